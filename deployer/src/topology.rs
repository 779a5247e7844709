// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Which node does what.

use cluster_common::address::{InputError, VirtualNetwork};
use cluster_common::protocol::{RouterState, MIN_STORAGE_NODES};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Priority of the routing node that holds the virtual IP first.
pub const PRIMARY_PRIORITY: u8 = 100;
/// How much lower each following routing node's priority is.
pub const PRIORITY_STEP: u8 = 10;
/// Most routing nodes that still get distinct, positive priorities.
pub const MAX_ROUTING_NODES: usize =
    (PRIMARY_PRIORITY / PRIORITY_STEP) as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Storage,
    Routing,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Storage => f.write_str("storage"),
            Tier::Routing => f.write_str("routing"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error("the {0} tier needs at least one node")]
    EmptyTier(Tier),

    #[error(
        "replication needs at least {MIN_STORAGE_NODES} storage nodes, \
         got {0}"
    )]
    TooFewStorageNodes(usize),

    #[error("node {0:?} is listed more than once")]
    DuplicateNode(String),

    #[error("at most {MAX_ROUTING_NODES} routing nodes are supported, got {0}")]
    TooManyRoutingNodes(usize),
}

/// A routing node's part in the virtual-IP election.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterRole {
    pub node: String,
    pub state: RouterState,
    pub priority: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    storage: Vec<String>,
    routing: Vec<RouterRole>,
}

impl Topology {
    /// Builds the layout of the cluster.  The first storage node is the
    /// replication primary and the next two are the secondaries every router
    /// names.  The first routing node is PRIMARY; every other routing node is
    /// a BACKUP with a lower priority than the one before it.
    pub fn new(
        storage: Vec<String>,
        routing: Vec<String>,
    ) -> Result<Self, TopologyError> {
        if storage.is_empty() {
            return Err(TopologyError::EmptyTier(Tier::Storage));
        }
        if storage.len() < MIN_STORAGE_NODES {
            return Err(TopologyError::TooFewStorageNodes(storage.len()));
        }
        if routing.is_empty() {
            return Err(TopologyError::EmptyTier(Tier::Routing));
        }
        if routing.len() > MAX_ROUTING_NODES {
            return Err(TopologyError::TooManyRoutingNodes(routing.len()));
        }
        // Node names become certificate subjects, so they must be unique
        // across tiers.
        let mut seen = BTreeSet::new();
        for node in storage.iter().chain(routing.iter()) {
            if !seen.insert(node.to_ascii_lowercase()) {
                return Err(TopologyError::DuplicateNode(node.clone()));
            }
        }

        let routing = routing
            .into_iter()
            .zip(0u8..)
            .map(|(node, i)| RouterRole {
                node,
                state: if i == 0 {
                    RouterState::Primary
                } else {
                    RouterState::Backup
                },
                priority: PRIMARY_PRIORITY - i * PRIORITY_STEP,
            })
            .collect();
        Ok(Self { storage, routing })
    }

    pub fn storage_nodes(&self) -> &[String] {
        &self.storage
    }

    pub fn replication_primary(&self) -> &str {
        &self.storage[0]
    }

    /// Routing roles in start order: PRIMARY, then BACKUPs by descending
    /// priority.
    pub fn router_roles(&self) -> &[RouterRole] {
        &self.routing
    }

    pub fn routing_nodes(&self) -> impl Iterator<Item = &str> + '_ {
        self.routing.iter().map(|r| r.node.as_str())
    }

    /// The PRIMARY routing node, which also hosts the application.
    pub fn entrypoint(&self) -> &str {
        &self.routing[0].node
    }
}

/// A validated deployment request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deployment {
    pub network: VirtualNetwork,
    pub interface: String,
    pub topology: Topology,
}
