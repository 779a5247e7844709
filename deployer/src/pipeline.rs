// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The deployment pipeline: credentials, storage, routing, application.
//!
//! Each stage is built as a [`StageDescriptor`] from the run's
//! [`DeployConfig`], [`Deployment`] and [`CredentialSet`], then handed to
//! [`run_stage`].  A stage starts only after the previous one has returned,
//! and the first failure ends the run.  Sessions opened along the way are
//! always closed before [`Deployer::deploy`] returns.

use crate::config::DeployConfig;
use crate::error::DeployError;
use crate::login::LoginBundleCache;
use crate::progress::{DeployStep, Progress};
use crate::registry::NodeRegistry;
use crate::stage::{
    run_stage, Action, GatedStart, NodePlan, Probe, StageDescriptor,
    StageName, StartOrder, UploadItem,
};
use crate::topology::Deployment;
use cluster_channel::{ChannelSettings, Connector};
use cluster_common::layout::{
    RemoteLayout, APPLICATION_DIR, APPLICATION_SERVICE, CACHE_CONTAINER,
    DATABASE_PASSWORD_SECRET, OVERLAY_NETWORK, ROUTER_CONTAINER, ROUTER_DIR,
    SESSION_KEY_SECRET, STORAGE_CONTAINER, STORAGE_DIR,
};
use cluster_common::protocol::{
    AgentCommand, SecretFile, StartApplication, StartCache, StartRouter,
    StartStorage,
};
use cluster_common::InlineErrorChain;
use cluster_credentials::{
    CredentialSet, Identity, IdentityRequest, LeafCredential,
};
use secrecy::ExposeSecret;
use slog::{error, info, o, Logger};
use std::sync::Arc;
use tokio::sync::watch;

/// What a successful run produced.
#[derive(Debug)]
pub struct DeploySummary {
    pub credentials: Arc<CredentialSet>,
    /// Every node a session was opened to, sorted.
    pub nodes: Vec<String>,
    pub sessions_closed: usize,
    /// The node serving the application behind the virtual IP.
    pub entrypoint: String,
}

pub struct Deployer {
    log: Logger,
    config: DeployConfig,
    layout: RemoteLayout,
    registry: NodeRegistry,
    progress: Progress,
    login_bundle: LoginBundleCache,
}

impl Deployer {
    pub fn new(
        log: &Logger,
        config: DeployConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let log = log.new(o!("component" => "Deployer"));
        let settings = ChannelSettings {
            remote_root: config.remote_root.clone(),
            agent_path: config.agent_path.clone(),
        };
        let layout = RemoteLayout::new(config.remote_root.clone());
        let registry = NodeRegistry::new(&log, connector, settings);
        Self {
            log,
            config,
            layout,
            registry,
            progress: Progress::new(),
            login_bundle: LoginBundleCache::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DeployStep> {
        self.progress.subscribe()
    }

    /// Closes every session still open, e.g. after an interrupted
    /// [`Deployer::deploy`].  Returns how many were closed.
    pub async fn close_sessions(&self) -> usize {
        self.registry.close_all().await
    }

    /// Runs every stage in order.  Whatever the outcome, every session
    /// opened during the run is closed before this returns.
    pub async fn deploy(
        &self,
        deployment: &Deployment,
    ) -> Result<DeploySummary, DeployError> {
        info!(self.log, "deployment starting";
            "virtual_ip" => %deployment.network.ip(),
            "storage_nodes" => deployment.topology.storage_nodes().len(),
            "routing_nodes" => deployment.topology.router_roles().len(),
        );
        self.progress.update(DeployStep::Starting);

        let result = self.run(deployment).await;
        let sessions_closed = self.registry.close_all().await;

        match result {
            Ok(credentials) => {
                self.progress.update(DeployStep::Complete);
                info!(self.log, "deployment complete";
                    "entrypoint" => deployment.topology.entrypoint());
                Ok(DeploySummary {
                    credentials,
                    nodes: self.registry.nodes(),
                    sessions_closed,
                    entrypoint: deployment.topology.entrypoint().to_string(),
                })
            }
            Err(err) => {
                error!(self.log, "deployment failed";
                    "node" => err.node(),
                    "error" => %InlineErrorChain::new(&err));
                self.progress
                    .update(DeployStep::Failed { message: err.to_string() });
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        deployment: &Deployment,
    ) -> Result<Arc<CredentialSet>, DeployError> {
        let topology = &deployment.topology;
        let max_parallelism = self.config.max_parallelism;

        self.progress.update(DeployStep::IssuingCredentials);
        let credentials = self.issue_credentials(deployment).await?;

        self.progress.update(DeployStep::Storage {
            nodes: topology.storage_nodes().len(),
        });
        let stage = self.storage_stage(deployment, &credentials)?;
        run_stage(&self.log, &self.registry, stage, max_parallelism).await?;

        self.progress.update(DeployStep::Routing {
            nodes: topology.router_roles().len(),
        });
        let bundle = self
            .login_bundle
            .get(&self.log, &self.registry, topology.storage_nodes())
            .await?;
        let stage = self.routing_stage(
            deployment,
            &credentials,
            bundle.expose_secret(),
        )?;
        run_stage(&self.log, &self.registry, stage, max_parallelism).await?;

        self.progress.update(DeployStep::Application {
            node: topology.entrypoint().to_string(),
        });
        let stage = self.application_stage(deployment, &credentials)?;
        run_stage(&self.log, &self.registry, stage, max_parallelism).await?;

        Ok(credentials)
    }

    async fn issue_credentials(
        &self,
        deployment: &Deployment,
    ) -> Result<Arc<CredentialSet>, DeployError> {
        let log =
            self.log.new(o!("stage" => StageName::Credentials.to_string()));
        let root_name = self.config.cluster_name.clone();
        let requests = identity_requests(&root_name, deployment);
        // Key generation is CPU-bound.
        let credentials = tokio::task::spawn_blocking(move || {
            CredentialSet::issue(&log, &root_name, &requests)
        })
        .await
        .map_err(|_| DeployError::TaskPanicked {
            stage: StageName::Credentials,
            node: "localhost".to_string(),
        })??;
        Ok(Arc::new(credentials))
    }

    fn storage_stage(
        &self,
        deployment: &Deployment,
        credentials: &CredentialSet,
    ) -> Result<StageDescriptor, DeployError> {
        let layout = &self.layout;
        let policy = self.config.health.storage;
        let ca_chain = credentials.ca_chain_pem()?;
        let root_secret = credentials.secrets().storage_root.expose_secret();

        let mut nodes = Vec::new();
        for (node, server_id) in
            deployment.topology.storage_nodes().iter().zip(1u32..)
        {
            let leaf = leaf(credentials, node, Identity::Storage)?;
            nodes.push(NodePlan {
                node: node.clone(),
                uploads: vec![
                    UploadItem::Tree {
                        local: self.config.services_dir.join(STORAGE_DIR),
                        remote: layout.storage_dir(),
                    },
                    UploadItem::private(
                        "storage root secret",
                        root_secret.as_bytes(),
                        layout.storage_root_password(),
                    ),
                    UploadItem::File {
                        what: "CA chain",
                        contents: ca_chain.clone().into_bytes(),
                        remote: layout.storage_ca_chain(),
                    },
                    UploadItem::private(
                        "storage private key",
                        leaf.private_key_pem()?.expose_secret().as_bytes(),
                        layout.storage_key(),
                    ),
                    UploadItem::File {
                        what: "storage certificate",
                        contents: leaf.certificate_pem()?.into_bytes(),
                        remote: layout.storage_certificate(),
                    },
                ],
                actions: vec![Action::Gate(GatedStart {
                    start: AgentCommand::StartStorage(StartStorage {
                        image: self.config.images.storage.clone(),
                        server_id,
                        healthcheck: (&policy).into(),
                    }),
                    probe: Probe::Container(STORAGE_CONTAINER.to_string()),
                    policy,
                })],
            });
        }
        Ok(StageDescriptor {
            name: StageName::Storage,
            nodes,
            order: StartOrder::PerNode,
        })
    }

    fn routing_stage(
        &self,
        deployment: &Deployment,
        credentials: &CredentialSet,
        login_bundle: &[u8],
    ) -> Result<StageDescriptor, DeployError> {
        let layout = &self.layout;
        let policy = self.config.health.routing;
        let network = &deployment.network;
        let ca_chain = credentials.ca_chain_pem()?;
        let database_secret = credentials.secrets().database.expose_secret();

        let mut nodes = Vec::new();
        for role in deployment.topology.router_roles() {
            let leaf = leaf(credentials, &role.node, Identity::Routing)?;
            nodes.push(NodePlan {
                node: role.node.clone(),
                uploads: vec![
                    UploadItem::Tree {
                        local: self.config.services_dir.join(ROUTER_DIR),
                        remote: layout.router_dir(),
                    },
                    UploadItem::private(
                        "database secret",
                        database_secret.as_bytes(),
                        layout.router_database_password(),
                    ),
                    UploadItem::private(
                        "login bundle",
                        login_bundle,
                        layout.router_login_bundle(),
                    ),
                    UploadItem::File {
                        what: "CA chain",
                        contents: ca_chain.clone().into_bytes(),
                        remote: layout.router_ca_chain(),
                    },
                    UploadItem::private(
                        "router private key",
                        leaf.private_key_pem()?.expose_secret().as_bytes(),
                        layout.router_key(),
                    ),
                    UploadItem::File {
                        what: "router certificate",
                        contents: leaf.certificate_pem()?.into_bytes(),
                        remote: layout.router_certificate(),
                    },
                ],
                actions: vec![Action::Gate(GatedStart {
                    start: AgentCommand::StartRouter(StartRouter {
                        virtual_ip: network.ip(),
                        mask: network.prefix(),
                        network_address: network.network_address(),
                        interface: deployment.interface.clone(),
                        storage_nodes: deployment
                            .topology
                            .storage_nodes()
                            .to_vec(),
                        state: role.state,
                        priority: role.priority,
                        healthcheck: (&policy).into(),
                    }),
                    probe: Probe::Container(ROUTER_CONTAINER.to_string()),
                    policy,
                })],
            });
        }
        // BACKUP routers join through the PRIMARY, so each router must be
        // healthy before the next one starts.
        Ok(StageDescriptor {
            name: StageName::Routing,
            nodes,
            order: StartOrder::Sequential,
        })
    }

    fn application_stage(
        &self,
        deployment: &Deployment,
        credentials: &CredentialSet,
    ) -> Result<StageDescriptor, DeployError> {
        let layout = &self.layout;
        let health = &self.config.health;
        let images = &self.config.images;
        let node = deployment.topology.entrypoint();
        let gateway = leaf(credentials, node, Identity::ApplicationGateway)?;
        let secrets = credentials.secrets();

        let session_key_path = layout.application_secret(SESSION_KEY_SECRET);
        let database_path = layout.application_secret(DATABASE_PASSWORD_SECRET);
        let plan = NodePlan {
            node: node.to_string(),
            uploads: vec![
                UploadItem::Tree {
                    local: self.config.services_dir.join(APPLICATION_DIR),
                    remote: layout.application_dir(),
                },
                UploadItem::File {
                    what: "root certificate",
                    contents: credentials
                        .root()
                        .certificate_pem()?
                        .into_bytes(),
                    remote: layout.application_ca_certificate(),
                },
                UploadItem::private(
                    "gateway private key",
                    gateway.private_key_pem()?.expose_secret().as_bytes(),
                    layout.application_key(),
                ),
                UploadItem::File {
                    what: "gateway certificate",
                    contents: gateway.certificate_pem()?.into_bytes(),
                    remote: layout.application_certificate(),
                },
                UploadItem::private(
                    "session key",
                    secrets.session_key.expose_secret().as_bytes(),
                    session_key_path.clone(),
                ),
                UploadItem::private(
                    "database secret",
                    secrets.database.expose_secret().as_bytes(),
                    database_path.clone(),
                ),
            ],
            actions: vec![
                Action::Run(AgentCommand::InitOrchestrator {
                    advertise_addr: deployment.network.ip(),
                }),
                Action::Run(AgentCommand::CreateOverlayNetwork {
                    name: OVERLAY_NETWORK.to_string(),
                }),
                Action::Gate(GatedStart {
                    start: AgentCommand::StartCache(StartCache {
                        image: images.cache.clone(),
                        network: OVERLAY_NETWORK.to_string(),
                        healthcheck: (&health.cache).into(),
                    }),
                    probe: Probe::Container(CACHE_CONTAINER.to_string()),
                    policy: health.cache,
                }),
                Action::Gate(GatedStart {
                    start: AgentCommand::StartApplication(StartApplication {
                        image: images.application.clone(),
                        network: OVERLAY_NETWORK.to_string(),
                        virtual_ip: deployment.network.ip(),
                        secrets: vec![
                            SecretFile {
                                name: SESSION_KEY_SECRET.to_string(),
                                path: session_key_path,
                            },
                            SecretFile {
                                name: DATABASE_PASSWORD_SECRET.to_string(),
                                path: database_path,
                            },
                        ],
                        healthcheck: (&health.application).into(),
                    }),
                    probe: Probe::Service(APPLICATION_SERVICE.to_string()),
                    policy: health.application,
                }),
            ],
        };
        Ok(StageDescriptor {
            name: StageName::Application,
            nodes: vec![plan],
            order: StartOrder::Sequential,
        })
    }
}

/// One leaf per storage node, one per routing node, and the application
/// gateway on the entrypoint, whose subject is the virtual IP.
fn identity_requests(
    root_name: &str,
    deployment: &Deployment,
) -> Vec<IdentityRequest> {
    let topology = &deployment.topology;
    let tiers = topology
        .storage_nodes()
        .iter()
        .map(|node| (node.as_str(), Identity::Storage))
        .chain(topology.routing_nodes().map(|node| (node, Identity::Routing)));
    let mut requests: Vec<IdentityRequest> = tiers
        .map(|(node, identity)| IdentityRequest {
            node: node.to_string(),
            identity,
            common_name: format!("{root_name}-{node}"),
        })
        .collect();
    requests.push(IdentityRequest {
        node: topology.entrypoint().to_string(),
        identity: Identity::ApplicationGateway,
        common_name: deployment.network.ip().to_string(),
    });
    requests
}

fn leaf<'a>(
    credentials: &'a CredentialSet,
    node: &str,
    identity: Identity,
) -> Result<&'a LeafCredential, DeployError> {
    credentials.leaf(node, identity).ok_or_else(|| {
        DeployError::MissingCredential { node: node.to_string(), identity }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;
    use cluster_common::address::VirtualNetwork;
    use std::net::Ipv4Addr;

    fn deployment() -> Deployment {
        Deployment {
            network: VirtualNetwork::new(Ipv4Addr::new(10, 1, 2, 3), 24)
                .unwrap(),
            interface: "eth0".to_string(),
            topology: Topology::new(
                vec!["s1".into(), "s2".into(), "s3".into()],
                vec!["r1".into(), "r2".into()],
            )
            .unwrap(),
        }
    }

    #[test]
    fn subjects_follow_the_cluster_name() {
        let requests = identity_requests("Superset-Cluster", &deployment());
        let subjects: Vec<(&str, Identity, &str)> = requests
            .iter()
            .map(|r| (r.node.as_str(), r.identity, r.common_name.as_str()))
            .collect();
        assert_eq!(
            subjects,
            [
                ("s1", Identity::Storage, "Superset-Cluster-s1"),
                ("s2", Identity::Storage, "Superset-Cluster-s2"),
                ("s3", Identity::Storage, "Superset-Cluster-s3"),
                ("r1", Identity::Routing, "Superset-Cluster-r1"),
                ("r2", Identity::Routing, "Superset-Cluster-r2"),
                ("r1", Identity::ApplicationGateway, "10.1.2.3"),
            ]
        );
    }
}
