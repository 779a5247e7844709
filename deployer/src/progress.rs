// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::stage::StageName;
use std::fmt;
use tokio::sync::watch;

/// Where a deployment run currently is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeployStep {
    Starting,
    IssuingCredentials,
    Storage { nodes: usize },
    Routing { nodes: usize },
    Application { node: String },
    Complete,
    Failed { message: String },
}

impl DeployStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployStep::Complete | DeployStep::Failed { .. })
    }

    pub fn stage(&self) -> Option<StageName> {
        match self {
            DeployStep::IssuingCredentials => Some(StageName::Credentials),
            DeployStep::Storage { .. } => Some(StageName::Storage),
            DeployStep::Routing { .. } => Some(StageName::Routing),
            DeployStep::Application { .. } => Some(StageName::Application),
            DeployStep::Starting
            | DeployStep::Complete
            | DeployStep::Failed { .. } => None,
        }
    }
}

impl fmt::Display for DeployStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployStep::Starting => f.write_str("starting"),
            DeployStep::IssuingCredentials => {
                f.write_str("issuing credentials")
            }
            DeployStep::Storage { nodes } => {
                write!(f, "deploying storage tier ({nodes} nodes)")
            }
            DeployStep::Routing { nodes } => {
                write!(f, "deploying routing tier ({nodes} nodes)")
            }
            DeployStep::Application { node } => {
                write!(f, "deploying application on {node}")
            }
            DeployStep::Complete => f.write_str("complete"),
            DeployStep::Failed { message } => write!(f, "failed: {message}"),
        }
    }
}

/// Publishes [`DeployStep`]s to any number of observers.
#[derive(Debug)]
pub(crate) struct Progress {
    tx: watch::Sender<DeployStep>,
}

impl Progress {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(DeployStep::Starting);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<DeployStep> {
        self.tx.subscribe()
    }

    pub fn update(&self, step: DeployStep) {
        // `send_replace` succeeds with or without receivers.
        self.tx.send_replace(step);
    }
}
