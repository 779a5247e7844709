// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live node sessions of one deployment run.

use crate::error::DeployError;
use crate::stage::StageName;
use cluster_channel::{ChannelSettings, Connector, ExecutionChannel};
use slog::{info, warn, Logger};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedMappedMutexGuard, OwnedMutexGuard};

type Slot = Arc<tokio::sync::Mutex<Option<ExecutionChannel>>>;

/// Exclusive use of one node's session.  Other tasks asking for the same
/// node wait until this is dropped.
pub type NodeHandle =
    OwnedMappedMutexGuard<Option<ExecutionChannel>, ExecutionChannel>;

/// Opens node sessions the first time a stage needs them and hands the same
/// session to later stages.  [`NodeRegistry::close_all`] tears every one
/// down.
#[derive(Clone)]
pub struct NodeRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    log: Logger,
    connector: Arc<dyn Connector>,
    settings: ChannelSettings,
    slots: Mutex<BTreeMap<String, Slot>>,
}

impl NodeRegistry {
    pub fn new(
        log: &Logger,
        connector: Arc<dyn Connector>,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                log: log.clone(),
                connector,
                settings,
                slots: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    fn slot(&self, node: &str) -> Slot {
        let mut slots =
            self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(node.to_string()).or_default().clone()
    }

    /// Takes exclusive use of `node`'s session, connecting first if this is
    /// the first time the node is used.
    pub async fn acquire(
        &self,
        stage: StageName,
        node: &str,
    ) -> Result<NodeHandle, DeployError> {
        let mut guard = self.slot(node).lock_owned().await;
        if guard.is_none() {
            let channel = ExecutionChannel::connect(
                &self.inner.log,
                self.inner.connector.as_ref(),
                node,
                &self.inner.settings,
            )
            .await
            .map_err(|err| DeployError::Connectivity {
                stage,
                node: node.to_string(),
                err,
            })?;
            *guard = Some(channel);
        }
        OwnedMutexGuard::try_map(guard, Option::as_mut).map_err(|_| {
            DeployError::Connectivity {
                stage,
                node: node.to_string(),
                err: cluster_channel::ChannelError::Closed(node.to_string()),
            }
        })
    }

    /// Every node a session was requested for, sorted.
    pub fn nodes(&self) -> Vec<String> {
        let slots =
            self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.keys().cloned().collect()
    }

    /// Closes every open session and returns how many were closed.  Errors
    /// are logged, never returned: this runs after the pipeline's result is
    /// already decided.
    pub async fn close_all(&self) -> usize {
        let slots: Vec<(String, Slot)> = {
            let slots =
                self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.iter().map(|(n, s)| (n.clone(), Arc::clone(s))).collect()
        };
        let mut closed = 0;
        for (node, slot) in slots {
            let mut guard = slot.lock().await;
            let Some(channel) = guard.as_mut() else {
                continue;
            };
            if channel.is_closed() {
                continue;
            }
            match channel.close().await {
                Ok(()) => closed += 1,
                Err(err) => {
                    warn!(self.inner.log, "failed to close session";
                        "node" => &node, "error" => %err);
                }
            }
        }
        info!(self.inner.log, "closed node sessions"; "count" => closed);
        closed
    }
}
