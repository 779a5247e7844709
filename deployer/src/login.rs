// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The routing tier's login bundle, fetched once per run.

use crate::error::DeployError;
use crate::registry::NodeRegistry;
use crate::stage::StageName;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cluster_common::protocol::{AgentCommand, AgentResponse};
use secrecy::{ExposeSecret, SecretSlice, SecretString};
use slog::{info, warn, Logger};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// A usable bundle is strictly longer than this.
pub const MIN_LOGIN_BUNDLE_LEN: usize = 320;
/// Times the export is attempted before the bundle is rejected.
pub const LOGIN_BUNDLE_ATTEMPTS: u32 = 3;

/// Memoizes the bundle exported from the replication primary.
///
/// Concurrent callers share one export; a failed export leaves the cache
/// empty so a later caller may try again.
#[derive(Default)]
pub struct LoginBundleCache {
    bundle: OnceCell<Arc<SecretSlice<u8>>>,
}

impl LoginBundleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(
        &self,
        log: &Logger,
        registry: &NodeRegistry,
        storage_nodes: &[String],
    ) -> Result<Arc<SecretSlice<u8>>, DeployError> {
        self.bundle
            .get_or_try_init(|| export(log, registry, storage_nodes))
            .await
            .cloned()
    }
}

async fn export(
    log: &Logger,
    registry: &NodeRegistry,
    storage_nodes: &[String],
) -> Result<Arc<SecretSlice<u8>>, DeployError> {
    let stage = StageName::Routing;
    let node = storage_nodes.first().cloned().unwrap_or_default();
    let channel = registry.acquire(stage, &node).await?;
    let command = AgentCommand::ExportLoginBundle {
        storage_nodes: storage_nodes.to_vec(),
    };
    let action = command.kind();

    let mut reason = String::new();
    for attempt in 1..=LOGIN_BUNDLE_ATTEMPTS {
        let encoded = match channel.exec_agent(command.clone()).await {
            Ok(AgentResponse::LoginBundle { base64 }) => {
                SecretString::from(base64)
            }
            Ok(other) => {
                return Err(DeployError::Protocol {
                    stage,
                    node,
                    action,
                    message: format!(
                        "expected login_bundle, got {}",
                        other.kind()
                    ),
                })
            }
            Err(err) => {
                return Err(DeployError::agent_failed(stage, &node, action, err))
            }
        };
        match STANDARD.decode(encoded.expose_secret().trim()) {
            Ok(bytes) if bytes.len() > MIN_LOGIN_BUNDLE_LEN => {
                info!(log, "login bundle exported";
                    "node" => &node, "attempt" => attempt);
                return Ok(Arc::new(SecretSlice::from(bytes)));
            }
            Ok(bytes) => {
                reason = format!(
                    "bundle is {} bytes, expected more than \
                     {MIN_LOGIN_BUNDLE_LEN}",
                    bytes.len()
                );
            }
            Err(err) => reason = format!("bundle is not valid base64: {err}"),
        }
        warn!(log, "login bundle rejected";
            "node" => &node, "attempt" => attempt, "reason" => &reason);
    }
    Err(DeployError::LoginBundle {
        node,
        attempts: LOGIN_BUNDLE_ATTEMPTS,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cluster_channel::fake::{FakeConnector, FakeReply};
    use cluster_channel::{ChannelSettings, Connector};
    use slog::o;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn setup(connector: &Arc<FakeConnector>) -> (Logger, NodeRegistry) {
        let log = Logger::root(slog::Discard, o!());
        let registry = NodeRegistry::new(
            &log,
            Arc::clone(connector) as Arc<dyn Connector>,
            ChannelSettings {
                remote_root: "/opt/superset-cluster".into(),
                agent_path: "/opt/superset-cluster/bin/cluster-agent".into(),
            },
        );
        (log, registry)
    }

    fn nodes() -> Vec<String> {
        vec!["s1".to_string(), "s2".to_string()]
    }

    #[tokio::test]
    async fn short_bundle_is_retried_then_memoized() {
        let connector = Arc::new(FakeConnector::new());
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        connector.set_responder(move |_, _| {
            let first = seen.fetch_add(1, Ordering::SeqCst) == 0;
            let len = if first { 10 } else { 400 };
            FakeReply::Respond(AgentResponse::LoginBundle {
                base64: STANDARD.encode(vec![7u8; len]),
            })
        });
        let (log, registry) = setup(&connector);
        let cache = LoginBundleCache::new();

        let bundle = cache.get(&log, &registry, &nodes()).await.unwrap();
        assert_eq!(bundle.expose_secret().len(), 400);
        cache.get(&log, &registry, &nodes()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(connector.requests()[0].0, "s1");
    }

    #[tokio::test]
    async fn exhausted_attempts() {
        let connector = Arc::new(FakeConnector::new());
        connector.set_responder(|_, _| {
            FakeReply::Respond(AgentResponse::LoginBundle {
                base64: "%%".into(),
            })
        });
        let (log, registry) = setup(&connector);
        let err = LoginBundleCache::new()
            .get(&log, &registry, &nodes())
            .await
            .unwrap_err();
        assert_matches!(
            err,
            DeployError::LoginBundle { attempts: LOGIN_BUNDLE_ATTEMPTS, .. }
        );
        assert_eq!(connector.requests().len(), 3);
    }

    #[tokio::test]
    async fn execution_failure_is_not_retried() {
        let connector = Arc::new(FakeConnector::new());
        connector.set_responder(|_, _| FakeReply::Fail {
            status: 1,
            stderr: "container not running".into(),
        });
        let (log, registry) = setup(&connector);
        let err = LoginBundleCache::new()
            .get(&log, &registry, &nodes())
            .await
            .unwrap_err();
        assert_matches!(err, DeployError::Execution { .. });
        assert_eq!(connector.requests().len(), 1);
    }
}
