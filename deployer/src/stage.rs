// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stages as data, and the engine that runs them.
//!
//! A stage is a list of [`NodePlan`]s: what to upload to a node and which
//! agent commands to run there afterwards, some of them behind a health
//! gate.  [`run_stage`] executes the plans with the stage's [`StartOrder`]
//! and returns once every gate has resolved, which makes the end of a stage
//! a hard barrier for the next one.

use crate::error::DeployError;
use crate::fanout::NodeTaskSet;
use crate::registry::NodeRegistry;
use camino::Utf8PathBuf;
use cluster_channel::{ChannelError, ExecutionChannel};
use cluster_common::health::{
    wait_until_healthy, HealthCheckPolicy, HealthOutcome,
};
use cluster_common::protocol::{
    AgentCommand, AgentResponse, HealthStatus, LogTarget, TaskState,
};
use secrecy::{ExposeSecret, SecretSlice};
use slog::{info, o, warn, Logger};
use std::fmt;

/// Lines of service output attached to a health-gate timeout.
pub const LOG_TAIL: u32 = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum StageName {
    Credentials,
    Storage,
    Routing,
    Application,
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageName::Credentials => "credentials",
            StageName::Storage => "storage",
            StageName::Routing => "routing",
            StageName::Application => "application",
        })
    }
}

/// One thing to place on a node before its commands run.
#[derive(Debug)]
pub enum UploadItem {
    /// A local directory mirrored to `remote`.
    Tree { local: Utf8PathBuf, remote: Utf8PathBuf },
    /// A world-readable file such as a certificate.
    File { what: &'static str, contents: Vec<u8>, remote: Utf8PathBuf },
    /// Secret material, restricted to its owner in the same transfer.
    Private {
        what: &'static str,
        contents: SecretSlice<u8>,
        remote: Utf8PathBuf,
    },
}

impl UploadItem {
    pub fn private(
        what: &'static str,
        contents: impl Into<Vec<u8>>,
        remote: Utf8PathBuf,
    ) -> Self {
        UploadItem::Private {
            what,
            contents: SecretSlice::from(contents.into()),
            remote,
        }
    }

    pub fn remote(&self) -> &Utf8PathBuf {
        match self {
            UploadItem::Tree { remote, .. }
            | UploadItem::File { remote, .. }
            | UploadItem::Private { remote, .. } => remote,
        }
    }

    pub fn description(&self) -> String {
        match self {
            UploadItem::Tree { local, .. } => format!("directory {local}"),
            UploadItem::File { what, .. }
            | UploadItem::Private { what, .. } => what.to_string(),
        }
    }

    async fn apply(
        &self,
        channel: &ExecutionChannel,
    ) -> Result<(), ChannelError> {
        match self {
            UploadItem::Tree { local, remote } => {
                channel.upload_tree(local, remote).await
            }
            UploadItem::File { contents, remote, .. } => {
                channel.upload_file(contents.clone(), remote).await
            }
            UploadItem::Private { contents, remote, .. } => {
                let contents = contents.expose_secret().to_vec();
                channel.upload_private_file(contents, remote).await
            }
        }
    }
}

/// What a health gate polls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Probe {
    /// Healthy when the container runtime reports the container healthy.
    Container(String),
    /// Healthy when the service's newest task is running.
    Service(String),
}

impl Probe {
    fn command(&self) -> AgentCommand {
        match self {
            Probe::Container(container) => {
                AgentCommand::ContainerHealth { container: container.clone() }
            }
            Probe::Service(service) => {
                AgentCommand::ServiceState { service: service.clone() }
            }
        }
    }

    fn log_target(&self) -> LogTarget {
        match self {
            Probe::Container(name) => LogTarget::Container(name.clone()),
            Probe::Service(name) => LogTarget::Service(name.clone()),
        }
    }

    fn interpret(
        &self,
        node: &str,
        response: AgentResponse,
    ) -> Result<bool, ChannelError> {
        match (self, response) {
            (Probe::Container(_), AgentResponse::Health { status }) => {
                Ok(status == HealthStatus::Healthy)
            }
            (Probe::Service(_), AgentResponse::ServiceState { state }) => {
                Ok(state == TaskState::Running)
            }
            (_, other) => Err(ChannelError::Protocol {
                node: node.to_string(),
                command: self.command().kind(),
                message: format!("unexpected {} response", other.kind()),
            }),
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.log_target(), f)
    }
}

/// A start command that is not done until its probe reports healthy.
#[derive(Clone, Debug)]
pub struct GatedStart {
    pub start: AgentCommand,
    pub probe: Probe,
    pub policy: HealthCheckPolicy,
}

#[derive(Clone, Debug)]
pub enum Action {
    /// Run once and expect [`AgentResponse::Done`].
    Run(AgentCommand),
    Gate(GatedStart),
}

impl Action {
    fn kind(&self) -> &'static str {
        match self {
            Action::Run(command) => command.kind(),
            Action::Gate(gate) => gate.start.kind(),
        }
    }
}

/// Everything one stage does on one node.
#[derive(Debug)]
pub struct NodePlan {
    pub node: String,
    pub uploads: Vec<UploadItem>,
    pub actions: Vec<Action>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOrder {
    /// Every node uploads, starts, and passes its gates independently of
    /// the others.
    PerNode,
    /// Uploads run on every node at once; then each node's actions run to
    /// completion, gates included, before the next node's actions begin.
    Sequential,
}

#[derive(Debug)]
pub struct StageDescriptor {
    pub name: StageName,
    pub nodes: Vec<NodePlan>,
    pub order: StartOrder,
}

/// Runs one stage to completion.  On failure, tasks still running for
/// other nodes of the stage are aborted.
pub async fn run_stage(
    log: &Logger,
    registry: &NodeRegistry,
    descriptor: StageDescriptor,
    max_parallelism: Option<usize>,
) -> Result<(), DeployError> {
    let StageDescriptor { name, nodes, order } = descriptor;
    let log = log.new(o!("stage" => name.to_string()));
    let parallelism = max_parallelism.unwrap_or(nodes.len());
    info!(log, "stage starting";
        "nodes" => nodes.len(),
        "order" => ?order,
        "parallelism" => parallelism,
    );

    match order {
        StartOrder::PerNode => {
            let mut tasks = NodeTaskSet::new(name, parallelism);
            for plan in nodes {
                let log = log.new(o!("node" => plan.node.clone()));
                let registry = registry.clone();
                let node = plan.node.clone();
                tasks.spawn(&node, async move {
                    let channel = registry.acquire(name, &plan.node).await?;
                    upload_all(&log, name, &channel, &plan.uploads).await?;
                    for action in &plan.actions {
                        run_action(&log, name, &channel, action).await?;
                    }
                    Ok(())
                });
            }
            tasks.join_all().await?;
        }
        StartOrder::Sequential => {
            let mut tasks = NodeTaskSet::new(name, parallelism);
            let mut pending = Vec::with_capacity(nodes.len());
            for plan in nodes {
                let log = log.new(o!("node" => plan.node.clone()));
                let registry = registry.clone();
                let node = plan.node.clone();
                pending.push((plan.node, plan.actions));
                let uploads = plan.uploads;
                let task_node = node.clone();
                tasks.spawn(&node, async move {
                    let channel = registry.acquire(name, &task_node).await?;
                    upload_all(&log, name, &channel, &uploads).await
                });
            }
            tasks.join_all().await?;

            for (node, actions) in pending {
                let log = log.new(o!("node" => node.clone()));
                let channel = registry.acquire(name, &node).await?;
                for action in &actions {
                    run_action(&log, name, &channel, action).await?;
                }
            }
        }
    }
    info!(log, "stage complete");
    Ok(())
}

async fn upload_all(
    log: &Logger,
    stage: StageName,
    channel: &ExecutionChannel,
    uploads: &[UploadItem],
) -> Result<(), DeployError> {
    for item in uploads {
        item.apply(channel).await.map_err(|err| {
            DeployError::upload_failed(
                stage,
                channel.node(),
                item.description(),
                err,
            )
        })?;
    }
    info!(log, "uploads complete"; "items" => uploads.len());
    Ok(())
}

/// Runs `command` and insists on [`AgentResponse::Done`].
pub(crate) async fn run_command(
    stage: StageName,
    channel: &ExecutionChannel,
    command: AgentCommand,
) -> Result<(), DeployError> {
    let action = command.kind();
    match channel.exec_agent(command).await {
        Ok(AgentResponse::Done) => Ok(()),
        Ok(other) => Err(DeployError::Protocol {
            stage,
            node: channel.node().to_string(),
            action,
            message: format!("expected done, got {}", other.kind()),
        }),
        Err(err) => {
            Err(DeployError::agent_failed(stage, channel.node(), action, err))
        }
    }
}

async fn run_action(
    log: &Logger,
    stage: StageName,
    channel: &ExecutionChannel,
    action: &Action,
) -> Result<(), DeployError> {
    info!(log, "running"; "action" => action.kind());
    match action {
        Action::Run(command) => {
            run_command(stage, channel, command.clone()).await
        }
        Action::Gate(gate) => run_gate(log, stage, channel, gate).await,
    }
}

async fn run_gate(
    log: &Logger,
    stage: StageName,
    channel: &ExecutionChannel,
    gate: &GatedStart,
) -> Result<(), DeployError> {
    let log = log.new(o!("target" => gate.probe.to_string()));
    let node = channel.node();
    let probe = &gate.probe;

    let outcome = wait_until_healthy(
        &log,
        &gate.policy,
        || run_command(stage, channel, gate.start.clone()),
        move || async move {
            let response = channel.exec_agent(probe.command()).await?;
            probe.interpret(node, response)
        },
    )
    .await?;

    match outcome {
        HealthOutcome::Healthy { polls } => {
            info!(log, "service healthy"; "polls" => polls);
            Ok(())
        }
        HealthOutcome::TimedOut { polls } => {
            let logs = collect_logs(&log, channel, probe).await;
            Err(DeployError::HealthGateTimeout {
                stage,
                node: node.to_string(),
                target: probe.to_string(),
                polls,
                logs,
            })
        }
    }
}

/// Best effort: a failure here is logged and yields `None`.
async fn collect_logs(
    log: &Logger,
    channel: &ExecutionChannel,
    probe: &Probe,
) -> Option<String> {
    let command = AgentCommand::CollectLogs {
        target: probe.log_target(),
        tail: LOG_TAIL,
    };
    match channel.exec_agent(command).await {
        Ok(AgentResponse::Logs { text }) => Some(text),
        Ok(other) => {
            warn!(log, "unexpected response to log collection";
                "response" => other.kind());
            None
        }
        Err(err) => {
            warn!(log, "failed to collect logs"; "error" => %err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cluster_channel::fake::{FakeConnector, FakeEvent, FakeReply};
    use camino::Utf8Path;
    use cluster_channel::{ChannelSettings, Connector};
    use cluster_common::protocol::AgentRequest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn registry(connector: &Arc<FakeConnector>) -> NodeRegistry {
        NodeRegistry::new(
            &log(),
            Arc::clone(connector) as Arc<dyn Connector>,
            ChannelSettings {
                remote_root: "/opt/superset-cluster".into(),
                agent_path: "/opt/superset-cluster/bin/cluster-agent".into(),
            },
        )
    }

    fn policy() -> HealthCheckPolicy {
        HealthCheckPolicy::new(
            Duration::from_secs(10),
            Duration::from_secs(5),
            3,
            Duration::from_secs(5),
        )
    }

    fn gated(node: &str) -> NodePlan {
        NodePlan {
            node: node.to_string(),
            uploads: vec![UploadItem::private(
                "secret",
                b"hunter2".to_vec(),
                "/opt/superset-cluster/secret".into(),
            )],
            actions: vec![Action::Gate(GatedStart {
                start: AgentCommand::CreateOverlayNetwork { name: node.into() },
                probe: Probe::Container("mysql".into()),
                policy: policy(),
            })],
        }
    }

    fn healthy_after(
        probes: u32,
    ) -> impl Fn(&str, &AgentRequest) -> FakeReply + Send + Sync + 'static {
        let seen = AtomicU32::new(0);
        move |_, request| match &request.command {
            AgentCommand::ContainerHealth { .. } => {
                let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                let status = if n >= probes {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Starting
                };
                FakeReply::Respond(AgentResponse::Health { status })
            }
            AgentCommand::CollectLogs { .. } => FakeReply::Respond(
                AgentResponse::Logs { text: "disk full".into() },
            ),
            _ => FakeReply::Respond(AgentResponse::Done),
        }
    }

    #[test]
    fn private_upload_debug_is_redacted() {
        let item =
            UploadItem::private("key", b"secret-bytes".to_vec(), "/k".into());
        assert!(!format!("{item:?}").contains("secret-bytes"));
        assert_eq!(item.description(), "key");
    }

    #[tokio::test(start_paused = true)]
    async fn per_node_stage_uploads_then_gates() {
        let connector = Arc::new(FakeConnector::new());
        connector.set_responder(healthy_after(2));
        let registry = registry(&connector);
        run_stage(
            &log(),
            &registry,
            StageDescriptor {
                name: StageName::Storage,
                nodes: vec![gated("s1")],
                order: StartOrder::PerNode,
            },
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            connector.mode("s1", Utf8Path::new("/opt/superset-cluster/secret")),
            Some(0o600)
        );
        let kinds: Vec<&str> = connector
            .requests()
            .iter()
            .map(|(_, r)| r.command.kind())
            .collect();
        assert_eq!(
            kinds,
            ["create_overlay_network", "container_health", "container_health"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_stage_finishes_each_gate_before_next_start() {
        let connector = Arc::new(FakeConnector::new());
        connector.set_responder(healthy_after(1));
        let registry = registry(&connector);
        run_stage(
            &log(),
            &registry,
            StageDescriptor {
                name: StageName::Routing,
                nodes: vec![gated("r1"), gated("r2")],
                order: StartOrder::Sequential,
            },
            None,
        )
        .await
        .unwrap();

        let execs: Vec<(String, &'static str)> = connector
            .events()
            .into_iter()
            .filter_map(|e| match e {
                FakeEvent::Exec { node, request } => {
                    Some((node, request.command.kind()))
                }
                _ => None,
            })
            .collect();
        let position = |node: &str, kind: &str| {
            execs.iter().position(|(n, k)| n == node && *k == kind).unwrap()
        };
        assert!(
            position("r1", "container_health")
                < position("r2", "create_overlay_network")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_attaches_collected_logs() {
        let connector = Arc::new(FakeConnector::new());
        connector.set_responder(healthy_after(u32::MAX));
        let registry = registry(&connector);
        let err = run_stage(
            &log(),
            &registry,
            StageDescriptor {
                name: StageName::Storage,
                nodes: vec![gated("s1")],
                order: StartOrder::PerNode,
            },
            None,
        )
        .await
        .unwrap_err();
        assert_matches!(
            &err,
            DeployError::HealthGateTimeout { polls: 3, target, .. }
                if target == "container mysql"
        );
        assert_eq!(err.collected_logs(), Some("disk full"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_never_probes() {
        let connector = Arc::new(FakeConnector::new());
        connector.set_responder(|_, request| match request.command {
            AgentCommand::CreateOverlayNetwork { .. } => FakeReply::Fail {
                status: 1,
                stderr: "no such image".into(),
            },
            _ => FakeReply::Respond(AgentResponse::Done),
        });
        let registry = registry(&connector);
        let err = run_stage(
            &log(),
            &registry,
            StageDescriptor {
                name: StageName::Storage,
                nodes: vec![gated("s1")],
                order: StartOrder::PerNode,
            },
            None,
        )
        .await
        .unwrap_err();
        assert_matches!(
            err,
            DeployError::Execution { action: "create_overlay_network", .. }
        );
        assert_eq!(connector.requests().len(), 1);
    }
}
