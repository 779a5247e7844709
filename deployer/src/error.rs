// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::stage::StageName;
use crate::topology::TopologyError;
use cluster_channel::ChannelError;
use cluster_credentials::{CredentialError, Identity};
use thiserror::Error;

/// Why a deployment run stopped.
///
/// Nothing is retried or rolled back automatically; every variant names
/// where it happened so an operator can inspect the node and re-run.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("{stage} stage: cannot reach node {node}")]
    Connectivity {
        stage: StageName,
        node: String,
        #[source]
        err: ChannelError,
    },

    #[error("{stage} stage: failed to upload {what} to node {node}")]
    Transfer {
        stage: StageName,
        node: String,
        what: String,
        #[source]
        err: ChannelError,
    },

    #[error("{stage} stage: {action} failed on node {node}")]
    Execution {
        stage: StageName,
        node: String,
        action: &'static str,
        #[source]
        err: ChannelError,
    },

    /// Services may already be running when this is returned.
    #[error(
        "{stage} stage: {target} on node {node} did not become healthy \
         after {polls} polls"
    )]
    HealthGateTimeout {
        stage: StageName,
        node: String,
        target: String,
        polls: u32,
        /// Recent output of the service, if it could be collected.
        logs: Option<String>,
    },

    #[error("invalid deployment input")]
    InvalidInput(#[from] TopologyError),

    #[error("failed to generate credentials")]
    Credentials(#[from] CredentialError),

    #[error("no {identity} credential was issued for node {node}")]
    MissingCredential { node: String, identity: Identity },

    #[error(
        "login bundle from node {node} rejected after {attempts} attempts: \
         {reason}"
    )]
    LoginBundle { node: String, attempts: u32, reason: String },

    #[error(
        "{stage} stage: bad response to {action} from node {node}: \
         {message}"
    )]
    Protocol {
        stage: StageName,
        node: String,
        action: &'static str,
        message: String,
    },

    #[error("{stage} stage: task for node {node} panicked")]
    TaskPanicked { stage: StageName, node: String },
}

impl DeployError {
    pub(crate) fn upload_failed(
        stage: StageName,
        node: &str,
        what: impl Into<String>,
        err: ChannelError,
    ) -> Self {
        if err.is_connectivity() {
            let node = node.to_string();
            return DeployError::Connectivity { stage, node, err };
        }
        DeployError::Transfer {
            stage,
            node: node.to_string(),
            what: what.into(),
            err,
        }
    }

    pub(crate) fn agent_failed(
        stage: StageName,
        node: &str,
        action: &'static str,
        err: ChannelError,
    ) -> Self {
        match err {
            err if err.is_connectivity() => DeployError::Connectivity {
                stage,
                node: node.to_string(),
                err,
            },
            ChannelError::Protocol { message, .. } => DeployError::Protocol {
                stage,
                node: node.to_string(),
                action,
                message,
            },
            err => DeployError::Execution {
                stage,
                node: node.to_string(),
                action,
                err,
            },
        }
    }

    /// The node the failure happened on, if there is one.
    pub fn node(&self) -> Option<&str> {
        match self {
            DeployError::Connectivity { node, .. }
            | DeployError::Transfer { node, .. }
            | DeployError::Execution { node, .. }
            | DeployError::HealthGateTimeout { node, .. }
            | DeployError::MissingCredential { node, .. }
            | DeployError::LoginBundle { node, .. }
            | DeployError::Protocol { node, .. }
            | DeployError::TaskPanicked { node, .. } => Some(node),
            DeployError::InvalidInput(_) | DeployError::Credentials(_) => None,
        }
    }

    /// Diagnostic output collected from the node, for health-gate timeouts.
    pub fn collected_logs(&self) -> Option<&str> {
        match self {
            DeployError::HealthGateTimeout { logs, .. } => logs.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cluster_channel::ExecutionFailure;

    #[test]
    fn channel_errors_are_classified() {
        let err = DeployError::agent_failed(
            StageName::Storage,
            "s1",
            "start_storage",
            ChannelError::Connect {
                node: "s1".into(),
                message: "refused".into(),
            },
        );
        assert_matches!(err, DeployError::Connectivity { .. });

        let err = DeployError::agent_failed(
            StageName::Routing,
            "r1",
            "start_router",
            ChannelError::Execution(Box::new(ExecutionFailure {
                node: "r1".into(),
                command: "agent".into(),
                status: Some(1),
                stdout: String::new(),
                stderr: "boom".into(),
            })),
        );
        assert_matches!(
            err,
            DeployError::Execution { action: "start_router", .. }
        );
        assert_eq!(err.node(), Some("r1"));

        let err = DeployError::upload_failed(
            StageName::Application,
            "r1",
            "service configuration",
            ChannelError::Transfer {
                node: "r1".into(),
                message: "disk full".into(),
            },
        );
        assert_matches!(err, DeployError::Transfer { .. });
        assert_eq!(
            err.to_string(),
            "application stage: failed to upload service configuration \
             to node r1"
        );
    }
}
