// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::ExecutionFailure;
use crate::transfer::{TransferOp, TransferPlan, MODE_OWNER_ONLY};
use crate::transport::{Connector, RemoteOutput, Transport};
use crate::ChannelError;
use camino::{Utf8Path, Utf8PathBuf};
use cluster_common::layout::RemoteLayout;
use cluster_common::protocol::{AgentCommand, AgentRequest, AgentResponse};
use slog::{debug, info, o, warn, Logger};
use std::str::from_utf8;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Where the agent and its working files live on every node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSettings {
    pub remote_root: Utf8PathBuf,
    pub agent_path: Utf8PathBuf,
}

/// The session to one node through which the deployer moves files and runs
/// agent commands.
pub struct ExecutionChannel {
    log: Logger,
    node: String,
    layout: RemoteLayout,
    agent_path: Utf8PathBuf,
    transport: Box<dyn Transport>,
    /// Request files of invocations cancelled before they removed them.
    abandoned: Mutex<Vec<Utf8PathBuf>>,
    closed: bool,
}

impl ExecutionChannel {
    pub async fn connect(
        log: &Logger,
        connector: &dyn Connector,
        node: &str,
        settings: &ChannelSettings,
    ) -> Result<Self, ChannelError> {
        let log = log.new(o!("node" => node.to_string()));
        let transport = connector.connect(&log, node).await?;
        info!(log, "session established");
        Ok(Self {
            log,
            node: node.to_string(),
            layout: RemoteLayout::new(settings.remote_root.clone()),
            agent_path: settings.agent_path.clone(),
            transport,
            abandoned: Mutex::new(Vec::new()),
            closed: false,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn layout(&self) -> &RemoteLayout {
        &self.layout
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Recursively copies the local directory `local` to `remote`.
    ///
    /// Existing remote directories are reused and existing files are
    /// overwritten, so repeating an upload is harmless.
    pub async fn upload_tree(
        &self,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<(), ChannelError> {
        let plan = TransferPlan::mirror_tree(local, remote).await?;
        debug!(self.log, "uploading directory";
            "local" => %local, "remote" => %remote, "ops" => plan.ops().len());
        self.apply(plan.ops()).await
    }

    /// Writes `contents` to `remote`, replacing any existing file.
    pub async fn upload_file(
        &self,
        contents: impl Into<Vec<u8>>,
        remote: &Utf8Path,
    ) -> Result<(), ChannelError> {
        let mut plan = TransferPlan::new();
        plan.write(contents, remote);
        debug!(self.log, "uploading file"; "remote" => %remote);
        self.apply(plan.ops()).await
    }

    /// Uploads secret material and restricts it to its owner as part of the
    /// same transfer.
    pub async fn upload_private_file(
        &self,
        contents: impl Into<Vec<u8>>,
        remote: &Utf8Path,
    ) -> Result<(), ChannelError> {
        let mut plan = TransferPlan::new();
        plan.write(contents, remote).chmod(MODE_OWNER_ONLY, remote);
        debug!(self.log, "uploading private file"; "remote" => %remote);
        self.apply(plan.ops()).await
    }

    pub async fn chmod600(
        &self,
        remote: &Utf8Path,
    ) -> Result<(), ChannelError> {
        self.apply(&[TransferOp::Chmod {
            mode: MODE_OWNER_ONLY,
            remote: remote.to_owned(),
        }])
        .await
    }

    /// Runs one agent command on the node and returns its response.
    ///
    /// The request is uploaded under a fresh nonce, executed once, and then
    /// removed; concurrent calls never share a request file.  If the call is
    /// dropped before it finishes, the file is removed by the channel's next
    /// invocation or by [`ExecutionChannel::close`].
    pub async fn exec_agent(
        &self,
        command: AgentCommand,
    ) -> Result<AgentResponse, ChannelError> {
        self.remove_abandoned_requests().await;

        let nonce = new_nonce(&self.node);
        let kind = command.kind();
        let secret_response = command.returns_secret();
        let log =
            self.log.new(o!("nonce" => nonce.clone(), "command" => kind));

        let request = AgentRequest::new(&nonce, self.layout.root(), command);
        let body = serde_json::to_vec(&request).map_err(|err| {
            ChannelError::Protocol {
                node: self.node.clone(),
                command: kind,
                message: format!("cannot encode request: {err}"),
            }
        })?;
        let request_path = self.layout.request_file(&nonce);
        let mut pending = PendingRequest {
            path: Some(request_path.clone()),
            abandoned: &self.abandoned,
        };
        let mut plan = TransferPlan::new();
        plan.write(body, &request_path).chmod(MODE_OWNER_ONLY, &request_path);
        self.apply(plan.ops()).await?;

        let argv = vec![
            self.agent_path.to_string(),
            "--request".to_string(),
            request_path.to_string(),
        ];
        info!(log, "running agent command");
        let result = self.transport.exec(&argv).await;

        pending.path = None;
        if let Err(err) =
            self.apply(&[TransferOp::Remove { remote: request_path }]).await
        {
            warn!(log, "failed to remove request file"; "error" => %err);
        }

        let output = result?;
        log_output(&log, &output, secret_response);
        if !output.success() {
            return Err(ChannelError::Execution(Box::new(ExecutionFailure {
                node: self.node.clone(),
                command: format!("{} ({kind})", shell_words::join(&argv)),
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })));
        }

        serde_json::from_slice(&output.stdout).map_err(|err| {
            ChannelError::Protocol {
                node: self.node.clone(),
                command: kind,
                message: err.to_string(),
            }
        })
    }

    /// Closes the session.  Closing an already closed channel does nothing.
    pub async fn close(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Ok(());
        }
        self.remove_abandoned_requests().await;
        self.closed = true;
        let result = self.transport.close().await;
        match &result {
            Ok(()) => info!(self.log, "session closed"),
            Err(err) => {
                warn!(self.log, "error closing session"; "error" => %err)
            }
        }
        result
    }

    /// Best effort: a failure is logged and retried by the next call.
    async fn remove_abandoned_requests(&self) {
        let paths = lock(&self.abandoned).clone();
        if paths.is_empty() {
            return;
        }
        let ops: Vec<TransferOp> = paths
            .iter()
            .map(|remote| TransferOp::Remove { remote: remote.clone() })
            .collect();
        match self.apply(&ops).await {
            Ok(()) => {
                debug!(self.log, "removed abandoned request files";
                    "count" => paths.len());
                lock(&self.abandoned).retain(|p| !paths.contains(p));
            }
            Err(err) => {
                warn!(self.log, "failed to remove abandoned request files";
                    "error" => %err);
            }
        }
    }

    async fn apply(&self, ops: &[TransferOp]) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed(self.node.clone()));
        }
        for op in ops {
            op.validate()?;
        }
        self.transport.apply(ops).await
    }
}

impl std::fmt::Debug for ExecutionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionChannel")
            .field("node", &self.node)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Hands its request file to the channel for later removal if the
/// invocation is dropped while the file may still exist.
struct PendingRequest<'a> {
    path: Option<Utf8PathBuf>,
    abandoned: &'a Mutex<Vec<Utf8PathBuf>>,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            lock(self.abandoned).push(path);
        }
    }
}

// The list stays consistent even if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Generates the tag of one agent invocation.
pub fn new_nonce(node: &str) -> String {
    format!("{node}-{}", uuid::Uuid::new_v4())
}

fn log_output(log: &Logger, output: &RemoteOutput, secret_response: bool) {
    info!(
        log,
        "agent command finished";
        "result" => if output.success() { "OK" } else { "ERROR" },
        "status" => output
            .status
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    if !output.stdout.is_empty() && !secret_response {
        info!(
            log,
            "agent stdout";
            "stdout" =>
                from_utf8(&output.stdout).unwrap_or("<Not valid UTF-8>"),
        );
    }
    if !output.stderr.is_empty() {
        warn!(
            log,
            "agent stderr";
            "stderr" =>
                from_utf8(&output.stderr).unwrap_or("<Not valid UTF-8>"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeConnector, FakeEvent, FakeReply};
    use assert_matches::assert_matches;
    use cluster_common::protocol::HealthStatus;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn settings() -> ChannelSettings {
        ChannelSettings {
            remote_root: "/opt/superset-cluster".into(),
            agent_path: "/opt/superset-cluster/bin/cluster-agent".into(),
        }
    }

    async fn channel(
        connector: &FakeConnector,
        node: &str,
    ) -> ExecutionChannel {
        ExecutionChannel::connect(&log(), connector, node, &settings())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn upload_tree_is_idempotent() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("conf")).unwrap();
        std::fs::write(dir.path().join("conf/my.cnf"), "[mysqld]\n").unwrap();
        std::fs::write(dir.path().join("seccomp.json"), "{}").unwrap();

        let connector = FakeConnector::new();
        let channel = channel(&connector, "mysql1").await;
        let remote = Utf8Path::new("/opt/superset-cluster/mysql-server");

        channel.upload_tree(dir.path(), remote).await.unwrap();
        let first = connector.files("mysql1");
        channel.upload_tree(dir.path(), remote).await.unwrap();
        let second = connector.files("mysql1");

        assert_eq!(first, second);
        assert_eq!(
            connector.file("mysql1", &remote.join("conf/my.cnf")).unwrap(),
            b"[mysqld]\n"
        );
        assert!(connector.is_dir("mysql1", &remote.join("conf")));
    }

    #[tokio::test]
    async fn upload_file_overwrites() {
        let connector = FakeConnector::new();
        let channel = channel(&connector, "mgmt1").await;
        let path = Utf8Path::new("/opt/superset-cluster/mysql-mgmt/x");
        channel.upload_file("first", path).await.unwrap();
        channel.upload_file(b"second".to_vec(), path).await.unwrap();
        assert_eq!(connector.file("mgmt1", path).unwrap(), b"second");
    }

    #[tokio::test]
    async fn private_files_are_owner_only() {
        let connector = FakeConnector::new();
        let channel = channel(&connector, "mgmt1").await;
        let path =
            Utf8Path::new("/opt/superset-cluster/mysql-mgmt/.mylogin.cnf");
        channel.upload_private_file("bundle", path).await.unwrap();
        assert_eq!(connector.mode("mgmt1", path), Some(0o600));

        let other = Utf8Path::new("/opt/superset-cluster/other");
        channel.upload_file("x", other).await.unwrap();
        assert_eq!(connector.mode("mgmt1", other), Some(0o644));
        channel.chmod600(other).await.unwrap();
        assert_eq!(connector.mode("mgmt1", other), Some(0o600));
    }

    #[tokio::test]
    async fn exec_agent_round_trip_and_cleanup() {
        let connector = FakeConnector::new();
        connector.set_responder(|_node, request| match &request.command {
            AgentCommand::ContainerHealth { container }
                if container == "mysql" =>
            {
                FakeReply::Respond(AgentResponse::Health {
                    status: HealthStatus::Healthy,
                })
            }
            _ => FakeReply::Respond(AgentResponse::Done),
        });
        let channel = channel(&connector, "mysql1").await;

        let response = channel
            .exec_agent(AgentCommand::ContainerHealth {
                container: "mysql".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            response,
            AgentResponse::Health { status: HealthStatus::Healthy }
        );

        // The request file was removed after execution.
        let requests = channel.layout().requests_dir();
        assert!(connector
            .files("mysql1")
            .keys()
            .all(|path| !path.starts_with(&requests)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_invocation_request_file_is_removed() {
        let connector = FakeConnector::new();
        connector.set_responder(|_, request| match &request.command {
            AgentCommand::ContainerHealth { .. } => FakeReply::Hang,
            _ => FakeReply::Respond(AgentResponse::Done),
        });
        let mut channel = channel(&connector, "mysql1").await;
        let requests = channel.layout().requests_dir();
        let leftover = |connector: &FakeConnector| {
            connector
                .files("mysql1")
                .keys()
                .filter(|path| path.starts_with(&requests))
                .count()
        };
        let health = || AgentCommand::ContainerHealth {
            container: "mysql".to_string(),
        };

        let stuck = channel.exec_agent(health());
        assert!(tokio::time::timeout(Duration::from_secs(5), stuck)
            .await
            .is_err());
        assert_eq!(leftover(&connector), 1);

        // The next invocation removes it first.
        channel
            .exec_agent(AgentCommand::CreateOverlayNetwork {
                name: "net".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(leftover(&connector), 0);

        // So does closing the channel.
        let stuck = channel.exec_agent(health());
        assert!(tokio::time::timeout(Duration::from_secs(5), stuck)
            .await
            .is_err());
        assert_eq!(leftover(&connector), 1);
        channel.close().await.unwrap();
        assert_eq!(leftover(&connector), 0);
    }

    #[tokio::test]
    async fn concurrent_invocations_use_distinct_request_files() {
        let connector = FakeConnector::new();
        let channel = channel(&connector, "mysql1").await;

        let (a, b) = tokio::join!(
            channel.exec_agent(AgentCommand::CreateOverlayNetwork {
                name: "a".to_string()
            }),
            channel.exec_agent(AgentCommand::CreateOverlayNetwork {
                name: "b".to_string()
            }),
        );
        a.unwrap();
        b.unwrap();

        let requests: Vec<_> = connector
            .events()
            .into_iter()
            .filter_map(|event| match event {
                FakeEvent::Exec { request, .. } => Some(request),
                _ => None,
            })
            .collect();
        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0].nonce, requests[1].nonce);
        assert!(requests.iter().all(|r| r.nonce.starts_with("mysql1-")));

        let nonces: BTreeSet<_> = (0..1000).map(|_| new_nonce("n")).collect();
        assert_eq!(nonces.len(), 1000);
    }

    #[tokio::test]
    async fn failed_command_captures_output() {
        let connector = FakeConnector::new();
        connector.set_responder(|_, _| FakeReply::Fail {
            status: 1,
            stderr: "docker: image not found".to_string(),
        });
        let channel = channel(&connector, "mysql1").await;

        let err = channel
            .exec_agent(AgentCommand::InitOrchestrator {
                advertise_addr: "10.0.0.1".parse().unwrap(),
            })
            .await
            .unwrap_err();
        let failure = assert_matches!(err, ChannelError::Execution(f) => f);
        assert_eq!(failure.node, "mysql1");
        assert_eq!(failure.status, Some(1));
        assert!(failure.command.contains("cluster-agent --request"));
        assert!(failure.command.contains("init_orchestrator"));
        assert_eq!(failure.stderr, "docker: image not found");
    }

    #[tokio::test]
    async fn garbage_on_stdout_is_a_protocol_error() {
        let connector = FakeConnector::new();
        connector.set_responder(|_, _| FakeReply::Raw {
            stdout: b"not json".to_vec(),
        });
        let channel = channel(&connector, "mysql1").await;
        assert_matches!(
            channel
                .exec_agent(AgentCommand::ServiceState {
                    service: "superset".to_string()
                })
                .await,
            Err(ChannelError::Protocol { command: "service_state", .. })
        );
    }

    #[tokio::test]
    async fn closed_channel_rejects_work() {
        let connector = FakeConnector::new();
        let mut channel = channel(&connector, "mysql1").await;
        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert_eq!(connector.closed_nodes(), vec!["mysql1".to_string()]);
        assert_matches!(
            channel.upload_file("x", Utf8Path::new("/opt/x")).await,
            Err(ChannelError::Closed(_))
        );
    }

    #[tokio::test]
    async fn relative_remote_paths_are_rejected() {
        let connector = FakeConnector::new();
        let channel = channel(&connector, "mysql1").await;
        assert_matches!(
            channel.upload_file("x", Utf8Path::new("relative/x")).await,
            Err(ChannelError::InvalidRemotePath(_))
        );
    }
}
