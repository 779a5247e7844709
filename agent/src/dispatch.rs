// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::docker;
use crate::runner::{ExecutionError, ProcessRunner, Runner};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use cluster_common::layout::{
    RemoteLayout, APPLICATION_SERVICE, CACHE_CONTAINER, ROUTER_CONTAINER,
    STORAGE_CONTAINER,
};
use cluster_common::protocol::{
    AgentCommand, AgentRequest, AgentResponse, LogTarget, ProtocolError,
    StartApplication, StartRouter, StartStorage,
};
use cluster_common::FileKv;
use slog::{info, o, Drain, Logger};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to read request {path}")]
    ReadRequest {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to decode request {path}")]
    DecodeRequest {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("secret file {0} does not exist")]
    MissingSecret(Utf8PathBuf),

    #[error("credential script printed no login bundle")]
    EmptyLoginBundle,
}

/// Executes one deployment request on this node.
#[derive(Debug, Parser)]
#[command(version)]
pub struct AgentApp {
    /// Path of the JSON request written by the deployer.
    #[clap(long)]
    request: Utf8PathBuf,
}

impl AgentApp {
    pub async fn exec(self, log: &Logger) -> Result<AgentResponse, AgentError> {
        let request = read_request(&self.request).await?;
        let log = log.new(o!(
            "nonce" => request.nonce.clone(),
            "command" => request.command.kind(),
        ));
        let agent = Agent::new(&log, ProcessRunner::new(&log));
        agent.execute(&request).await
    }

    /// Logs go to stderr; stdout carries only the response.
    pub fn setup_log() -> Logger {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let mut builder = slog_envlogger::LogBuilder::new(drain);
        if let Ok(s) = std::env::var("CLUSTER_AGENT_LOG") {
            builder = builder.parse(&s);
        } else {
            builder = builder.filter(None, slog::FilterLevel::Info);
        }
        let drain =
            slog_async::Async::new(builder.build().fuse()).build().fuse();
        Logger::root(drain, o!(FileKv))
    }
}

pub async fn read_request(path: &Utf8Path) -> Result<AgentRequest, AgentError> {
    let bytes = tokio::fs::read(path).await.map_err(|err| {
        AgentError::ReadRequest { path: path.to_owned(), err }
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|err| AgentError::DecodeRequest { path: path.to_owned(), err })
}

/// Translates agent commands into container-runtime invocations.
pub struct Agent<R> {
    log: Logger,
    runner: R,
}

impl<R: Runner> Agent<R> {
    pub fn new(log: &Logger, runner: R) -> Self {
        Self { log: log.clone(), runner }
    }

    pub async fn execute(
        &self,
        request: &AgentRequest,
    ) -> Result<AgentResponse, AgentError> {
        request.check_version()?;
        let layout = RemoteLayout::new(request.remote_root.clone());
        info!(self.log, "executing"; "command" => %request.command);

        match &request.command {
            AgentCommand::StartStorage(req) => {
                self.start_storage(&layout, req).await
            }
            AgentCommand::ExportLoginBundle { storage_nodes } => {
                let output = self
                    .runner
                    .run(&docker::export_login_bundle(storage_nodes))
                    .await?;
                let base64: String = output
                    .stdout
                    .chars()
                    .filter(|c| !c.is_whitespace())
                    .collect();
                if base64.is_empty() {
                    return Err(AgentError::EmptyLoginBundle);
                }
                Ok(AgentResponse::LoginBundle { base64 })
            }
            AgentCommand::StartRouter(req) => {
                self.start_router(&layout, req).await
            }
            AgentCommand::InitOrchestrator { advertise_addr } => {
                let state = self.runner.run(&docker::swarm_state()).await?;
                if state.stdout.trim() == "active" {
                    info!(self.log, "orchestrator already initialized");
                } else {
                    self.runner
                        .run(&docker::swarm_init(*advertise_addr))
                        .await?;
                }
                Ok(AgentResponse::Done)
            }
            AgentCommand::CreateOverlayNetwork { name } => {
                let existing =
                    self.runner.run(&docker::find_network(name)).await?;
                if docker::listing_contains(&existing.stdout, name) {
                    info!(self.log, "overlay network exists";
                        "network" => name);
                } else {
                    self.runner
                        .run(&docker::create_overlay_network(name))
                        .await?;
                }
                Ok(AgentResponse::Done)
            }
            AgentCommand::StartCache(req) => {
                if !self.restart_existing(CACHE_CONTAINER).await? {
                    self.runner.run(&docker::run_cache(req)).await?;
                }
                Ok(AgentResponse::Done)
            }
            AgentCommand::StartApplication(req) => {
                self.start_application(&layout, req).await
            }
            AgentCommand::ContainerHealth { container } => {
                let output =
                    self.runner.run(&docker::inspect_health(container)).await?;
                Ok(AgentResponse::Health {
                    status: docker::parse_health_status(&output.stdout),
                })
            }
            AgentCommand::ServiceState { service } => {
                let output =
                    self.runner.run(&docker::service_tasks(service)).await?;
                Ok(AgentResponse::ServiceState {
                    state: docker::parse_task_state(&output.stdout),
                })
            }
            AgentCommand::CollectLogs { target, tail } => {
                let text = self.collect_logs(target, *tail).await?;
                Ok(AgentResponse::Logs { text })
            }
        }
    }

    /// Starts the named container if it already exists.  Returns false if
    /// there is no such container.
    async fn restart_existing(&self, name: &str) -> Result<bool, AgentError> {
        let existing = self.runner.run(&docker::find_container(name)).await?;
        if !docker::listing_contains(&existing.stdout, name) {
            return Ok(false);
        }
        info!(self.log, "container exists; starting it"; "container" => name);
        self.runner.run(&docker::start_existing_container(name)).await?;
        Ok(true)
    }

    async fn start_storage(
        &self,
        layout: &RemoteLayout,
        req: &StartStorage,
    ) -> Result<AgentResponse, AgentError> {
        if !self.restart_existing(STORAGE_CONTAINER).await? {
            self.runner.run(&docker::run_storage(layout, req)).await?;
        }
        Ok(AgentResponse::Done)
    }

    async fn start_router(
        &self,
        layout: &RemoteLayout,
        req: &StartRouter,
    ) -> Result<AgentResponse, AgentError> {
        info!(self.log, "starting router";
            "state" => %req.state, "priority" => req.priority);
        // Compose recreates whichever container's configuration changed, so
        // a re-run with new credentials bootstraps the router again.
        self.runner.run(&docker::router_init(layout, req)?).await?;
        self.runner.run(&docker::router_main(layout, req)?).await?;
        Ok(AgentResponse::Done)
    }

    /// Replaces the application service and its secrets.
    ///
    /// Every run issues new secrets, and a runtime secret cannot change
    /// while a service references it, so an existing service is removed
    /// before its secrets are recreated.
    async fn start_application(
        &self,
        layout: &RemoteLayout,
        req: &StartApplication,
    ) -> Result<AgentResponse, AgentError> {
        for secret in &req.secrets {
            if !tokio::fs::try_exists(&secret.path).await.unwrap_or(false) {
                return Err(AgentError::MissingSecret(secret.path.clone()));
            }
        }

        let existing =
            self.runner.run(&docker::find_service(APPLICATION_SERVICE)).await?;
        if docker::listing_contains(&existing.stdout, APPLICATION_SERVICE) {
            info!(self.log, "removing previous application service");
            self.runner
                .run(&docker::remove_service(APPLICATION_SERVICE))
                .await?;
        }

        for secret in &req.secrets {
            let existing =
                self.runner.run(&docker::find_secret(&secret.name)).await?;
            if docker::listing_contains(&existing.stdout, &secret.name) {
                info!(self.log, "replacing secret"; "secret" => &secret.name);
                self.runner.run(&docker::remove_secret(&secret.name)).await?;
            }
            self.runner
                .run(&docker::create_secret(&secret.name, &secret.path))
                .await?;
        }

        self.runner
            .run(&docker::create_application_service(layout, req))
            .await?;
        Ok(AgentResponse::Done)
    }

    async fn collect_logs(
        &self,
        target: &LogTarget,
        tail: u32,
    ) -> Result<String, AgentError> {
        match target {
            LogTarget::Service(service) => {
                let output = self
                    .runner
                    .run(&docker::service_logs(service, tail))
                    .await?;
                Ok(join_streams(&output.stdout, &output.stderr))
            }
            LogTarget::Container(container)
                if container == ROUTER_CONTAINER =>
            {
                let mut text = String::new();
                for source in docker::router_log_sources() {
                    // The main container may not exist if bootstrap failed.
                    let logs = docker::container_logs(source, tail);
                    match self.runner.run(&logs).await {
                        Ok(output) => {
                            text.push_str(&format!("==> {source} <==\n"));
                            text.push_str(&join_streams(
                                &output.stdout,
                                &output.stderr,
                            ));
                            text.push_str("\n\n");
                        }
                        Err(err) => {
                            text.push_str(&format!(
                                "==> {source} <==\n{err}\n\n"
                            ));
                        }
                    }
                }
                Ok(text)
            }
            LogTarget::Container(container) => {
                let output = self
                    .runner
                    .run(&docker::container_logs(container, tail))
                    .await?;
                Ok(join_streams(&output.stdout, &output.stderr))
            }
        }
    }
}

// Container runtimes split a container's output across both streams.
fn join_streams(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    }
}
