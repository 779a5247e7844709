// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The request/response protocol between the deployer and `cluster-agent`.
//!
//! The deployer never interpolates parameters into a remote shell command.
//! Instead it serializes an [`AgentRequest`] to JSON, uploads it to the node,
//! and runs `cluster-agent --request <path>`.  The agent prints exactly one
//! [`AgentResponse`] on stdout and exits 0, or exits non-zero with a
//! diagnostic on stderr.

use crate::health::HealthCheckPolicy;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Bumped whenever a change to [`AgentRequest`] or [`AgentResponse`] would
/// be misread by the other side.
pub const PROTOCOL_VERSION: u32 = 1;

/// The router's configuration names a replication primary and two
/// secondaries.
pub const MIN_STORAGE_NODES: usize = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error(
        "unsupported protocol version {found} (this build speaks {expected})"
    )]
    VersionMismatch { expected: u32, found: u32 },

    #[error("unexpected response to {command}: {response}")]
    UnexpectedResponse { command: &'static str, response: String },

    #[error(
        "routers need at least {MIN_STORAGE_NODES} storage nodes, got {found}"
    )]
    TooFewStorageNodes { found: usize },
}

/// One invocation of the remote agent.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgentRequest {
    pub version: u32,
    /// Unique per invocation; also names the uploaded request file.
    pub nonce: String,
    /// Root under which the deployer placed this node's service material.
    pub remote_root: Utf8PathBuf,
    pub command: AgentCommand,
}

impl AgentRequest {
    pub fn new(
        nonce: impl Into<String>,
        remote_root: impl Into<Utf8PathBuf>,
        command: AgentCommand,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            nonce: nonce.into(),
            remote_root: remote_root.into(),
            command,
        }
    }

    pub fn check_version(&self) -> Result<(), ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Run the database server container from `<root>/mysql-server`.
    StartStorage(StartStorage),
    /// Write the routing tier's login bundle inside the storage container and
    /// return it base64 encoded.
    ExportLoginBundle { storage_nodes: Vec<String> },
    /// Bring up the router and virtual IP containers from `<root>/mysql-mgmt`.
    StartRouter(StartRouter),
    InitOrchestrator { advertise_addr: Ipv4Addr },
    CreateOverlayNetwork { name: String },
    StartCache(StartCache),
    StartApplication(StartApplication),
    ContainerHealth { container: String },
    ServiceState { service: String },
    CollectLogs { target: LogTarget, tail: u32 },
}

impl AgentCommand {
    /// A short, secret-free name for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentCommand::StartStorage(_) => "start_storage",
            AgentCommand::ExportLoginBundle { .. } => "export_login_bundle",
            AgentCommand::StartRouter(_) => "start_router",
            AgentCommand::InitOrchestrator { .. } => "init_orchestrator",
            AgentCommand::CreateOverlayNetwork { .. } => {
                "create_overlay_network"
            }
            AgentCommand::StartCache(_) => "start_cache",
            AgentCommand::StartApplication(_) => "start_application",
            AgentCommand::ContainerHealth { .. } => "container_health",
            AgentCommand::ServiceState { .. } => "service_state",
            AgentCommand::CollectLogs { .. } => "collect_logs",
        }
    }

    /// Whether the response carries secret material and must not be logged.
    pub fn returns_secret(&self) -> bool {
        matches!(self, AgentCommand::ExportLoginBundle { .. })
    }
}

impl fmt::Display for AgentCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Container runtime healthcheck flags, mirrored from the controller's gate
/// so both sides agree on timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ContainerHealthcheck {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retries: u32,
    pub start_period_secs: u64,
}

impl From<&HealthCheckPolicy> for ContainerHealthcheck {
    fn from(policy: &HealthCheckPolicy) -> Self {
        Self {
            interval_secs: policy.poll_interval.as_secs(),
            timeout_secs: policy.probe_timeout.as_secs(),
            retries: policy.retries,
            start_period_secs: policy.grace_period.as_secs(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StartStorage {
    pub image: String,
    pub server_id: u32,
    pub healthcheck: ContainerHealthcheck,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouterState {
    Primary,
    Backup,
}

impl RouterState {
    /// The VRRP state name understood by the virtual IP container.
    pub fn vrrp_state(&self) -> &'static str {
        match self {
            RouterState::Primary => "MASTER",
            RouterState::Backup => "BACKUP",
        }
    }
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterState::Primary => f.write_str("PRIMARY"),
            RouterState::Backup => f.write_str("BACKUP"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StartRouter {
    pub virtual_ip: Ipv4Addr,
    pub mask: u8,
    pub network_address: Ipv4Addr,
    pub interface: String,
    /// Storage nodes to federate, replication primary first.
    pub storage_nodes: Vec<String>,
    pub state: RouterState,
    pub priority: u8,
    pub healthcheck: ContainerHealthcheck,
}

impl StartRouter {
    /// The replication primary followed by the first two secondaries.
    pub fn replication_members(&self) -> Result<[&str; 3], ProtocolError> {
        match self.storage_nodes.as_slice() {
            [primary, first, second, ..] => {
                Ok([primary.as_str(), first.as_str(), second.as_str()])
            }
            nodes => {
                Err(ProtocolError::TooFewStorageNodes { found: nodes.len() })
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StartCache {
    pub image: String,
    pub network: String,
    pub healthcheck: ContainerHealthcheck,
}

/// A secret the application consumes, already uploaded as an owner-only file.
///
/// The agent turns it into a container runtime secret; its value never
/// appears on a command line or in the request itself.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SecretFile {
    pub name: String,
    pub path: Utf8PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StartApplication {
    pub image: String,
    pub network: String,
    pub virtual_ip: Ipv4Addr,
    pub secrets: Vec<SecretFile>,
    pub healthcheck: ContainerHealthcheck,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogTarget {
    Container(String),
    Service(String),
}

impl fmt::Display for LogTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogTarget::Container(name) => write!(f, "container {name}"),
            LogTarget::Service(name) => write!(f, "service {name}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AgentResponse {
    Done,
    Health { status: HealthStatus },
    ServiceState { state: TaskState },
    LoginBundle { base64: String },
    Logs { text: String },
}

impl AgentResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentResponse::Done => "done",
            AgentResponse::Health { .. } => "health",
            AgentResponse::ServiceState { .. } => "service_state",
            AgentResponse::LoginBundle { .. } => "login_bundle",
            AgentResponse::Logs { .. } => "logs",
        }
    }
}

/// A container's reported health, as the container runtime names it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    /// The container has no healthcheck configured.
    None,
}

/// Run state of the newest placement task of a cluster-wide service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    New,
    Pending,
    Assigned,
    Accepted,
    Preparing,
    Starting,
    Running,
    Complete,
    Failed,
    Shutdown,
    Rejected,
    Orphaned,
    Remove,
    /// No task has been scheduled yet, or the runtime reported a state this
    /// build does not know.
    Unknown,
}

impl TaskState {
    /// Parses the runtime's lowercase state name; anything unrecognized maps
    /// to [`TaskState::Unknown`].
    pub fn from_runtime(state: &str) -> TaskState {
        match state.trim().to_ascii_lowercase().as_str() {
            "new" => TaskState::New,
            "pending" => TaskState::Pending,
            "assigned" => TaskState::Assigned,
            "accepted" => TaskState::Accepted,
            "preparing" => TaskState::Preparing,
            "starting" => TaskState::Starting,
            "running" => TaskState::Running,
            "complete" => TaskState::Complete,
            "failed" => TaskState::Failed,
            "shutdown" => TaskState::Shutdown,
            "rejected" => TaskState::Rejected,
            "orphaned" => TaskState::Orphaned,
            "remove" => TaskState::Remove,
            _ => TaskState::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[test]
    fn request_wire_format() {
        let request = AgentRequest::new(
            "mysql1-0",
            "/opt/superset-cluster",
            AgentCommand::ContainerHealth { container: "mysql".to_string() },
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "version": PROTOCOL_VERSION,
                "nonce": "mysql1-0",
                "remote_root": "/opt/superset-cluster",
                "command": {
                    "command": "container_health",
                    "container": "mysql",
                },
            })
        );
    }

    #[test]
    fn router_state_serializes_as_role_name() {
        let start = StartRouter {
            virtual_ip: Ipv4Addr::new(192, 168, 1, 100),
            mask: 24,
            network_address: Ipv4Addr::new(192, 168, 1, 0),
            interface: "eth0".to_string(),
            storage_nodes: vec!["mysql1".to_string()],
            state: RouterState::Backup,
            priority: 90,
            healthcheck: ContainerHealthcheck {
                interval_secs: 5,
                timeout_secs: 5,
                retries: 3,
                start_period_secs: 25,
            },
        };
        let json =
            serde_json::to_value(AgentCommand::StartRouter(start)).unwrap();
        assert_eq!(json["command"], "start_router");
        assert_eq!(json["state"], "BACKUP");
        assert_eq!(json["priority"], 90);
        assert_eq!(RouterState::Primary.vrrp_state(), "MASTER");
    }

    #[test]
    fn routers_name_three_replication_members() {
        let mut start = StartRouter {
            virtual_ip: Ipv4Addr::new(192, 168, 1, 100),
            mask: 24,
            network_address: Ipv4Addr::new(192, 168, 1, 0),
            interface: "eth0".to_string(),
            storage_nodes: vec!["mysql1".to_string(), "mysql2".to_string()],
            state: RouterState::Primary,
            priority: 100,
            healthcheck: ContainerHealthcheck {
                interval_secs: 5,
                timeout_secs: 5,
                retries: 3,
                start_period_secs: 25,
            },
        };
        assert_eq!(
            start.replication_members(),
            Err(ProtocolError::TooFewStorageNodes { found: 2 })
        );
        start
            .storage_nodes
            .extend(["mysql3".to_string(), "mysql4".to_string()]);
        assert_eq!(
            start.replication_members(),
            Ok(["mysql1", "mysql2", "mysql3"])
        );
    }

    #[test]
    fn responses_decode() {
        let response: AgentResponse =
            serde_json::from_str(r#"{"result":"health","status":"starting"}"#)
                .unwrap();
        assert_eq!(
            response,
            AgentResponse::Health { status: HealthStatus::Starting }
        );
        let response: AgentResponse =
            serde_json::from_str(r#"{"result":"done"}"#).unwrap();
        assert_eq!(response, AgentResponse::Done);
        assert!(
            serde_json::from_str::<AgentResponse>(r#"{"result":"bogus"}"#)
                .is_err()
        );
    }

    #[test]
    fn version_is_checked() {
        let mut request = AgentRequest::new(
            "n",
            "/opt/superset-cluster",
            AgentCommand::CreateOverlayNetwork { name: "net".to_string() },
        );
        assert_eq!(request.check_version(), Ok(()));
        request.version = PROTOCOL_VERSION + 1;
        assert_matches!(
            request.check_version(),
            Err(ProtocolError::VersionMismatch { found, .. })
                if found == PROTOCOL_VERSION + 1
        );
    }

    #[test]
    fn healthcheck_follows_policy() {
        let policy = HealthCheckPolicy::new(
            Duration::from_secs(60),
            Duration::from_secs(30),
            20,
            Duration::from_secs(5),
        );
        assert_eq!(
            ContainerHealthcheck::from(&policy),
            ContainerHealthcheck {
                interval_secs: 30,
                timeout_secs: 5,
                retries: 20,
                start_period_secs: 60,
            }
        );
    }

    #[test]
    fn task_state_from_runtime() {
        assert_eq!(TaskState::from_runtime("running"), TaskState::Running);
        assert_eq!(TaskState::from_runtime("Running\n"), TaskState::Running);
        assert_eq!(TaskState::from_runtime("preparing"), TaskState::Preparing);
        assert_eq!(TaskState::from_runtime("whatever"), TaskState::Unknown);
    }
}
