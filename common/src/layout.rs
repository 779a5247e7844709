// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Where service material lives on a node, and the names of the runtime
//! objects the agent creates.
//!
//! The deployer uploads into these paths and the agent bind-mounts out of
//! them, so both sides must derive them from the same [`RemoteLayout`].

use camino::{Utf8Path, Utf8PathBuf};

pub const DEFAULT_REMOTE_ROOT: &str = "/opt/superset-cluster";

pub const STORAGE_CONTAINER: &str = "mysql";
pub const ROUTER_CONTAINER: &str = "mysql-mgmt";
pub const ROUTER_INIT_CONTAINER: &str = "mysql-mgmt-initcontainer";
pub const CACHE_CONTAINER: &str = "redis";
pub const APPLICATION_SERVICE: &str = "superset";
pub const OVERLAY_NETWORK: &str = "superset-network";

pub const SESSION_KEY_SECRET: &str = "superset_secret_key";
pub const DATABASE_PASSWORD_SECRET: &str = "mysql_superset_password";

/// Per-service directory names, both under `services_dir` on the control
/// host and under the remote root on each node.
pub const STORAGE_DIR: &str = "mysql-server";
pub const ROUTER_DIR: &str = "mysql-mgmt";
pub const APPLICATION_DIR: &str = "superset";

const CA_CHAIN_FILE: &str = "superset_cluster_ca_certificate.pem";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteLayout {
    root: Utf8PathBuf,
}

impl RemoteLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Directory holding uploaded agent requests.
    pub fn requests_dir(&self) -> Utf8PathBuf {
        self.root.join("requests")
    }

    pub fn request_file(&self, nonce: &str) -> Utf8PathBuf {
        self.requests_dir().join(format!("{nonce}.json"))
    }

    pub fn storage_dir(&self) -> Utf8PathBuf {
        self.root.join(STORAGE_DIR)
    }

    pub fn storage_root_password(&self) -> Utf8PathBuf {
        self.storage_dir().join("mysql_root_password")
    }

    pub fn storage_ca_chain(&self) -> Utf8PathBuf {
        self.storage_dir().join(CA_CHAIN_FILE)
    }

    pub fn storage_key(&self) -> Utf8PathBuf {
        self.storage_dir().join("mysql_server_key.pem")
    }

    pub fn storage_certificate(&self) -> Utf8PathBuf {
        self.storage_dir().join("mysql_server_certificate.pem")
    }

    pub fn storage_seccomp_profile(&self) -> Utf8PathBuf {
        self.storage_dir().join("seccomp.json")
    }

    pub fn router_dir(&self) -> Utf8PathBuf {
        self.root.join(ROUTER_DIR)
    }

    pub fn router_database_password(&self) -> Utf8PathBuf {
        self.router_dir().join("mysql_superset_password")
    }

    pub fn router_login_bundle(&self) -> Utf8PathBuf {
        self.router_dir().join(".mylogin.cnf")
    }

    pub fn router_ca_chain(&self) -> Utf8PathBuf {
        self.router_dir().join(CA_CHAIN_FILE)
    }

    pub fn router_key(&self) -> Utf8PathBuf {
        self.router_dir().join("mysql_router_key.pem")
    }

    pub fn router_certificate(&self) -> Utf8PathBuf {
        self.router_dir().join("mysql_router_certificate.pem")
    }

    pub fn router_compose_file(&self) -> Utf8PathBuf {
        self.router_dir().join("docker_compose.yml")
    }

    pub fn application_dir(&self) -> Utf8PathBuf {
        self.root.join(APPLICATION_DIR)
    }

    pub fn application_ca_certificate(&self) -> Utf8PathBuf {
        self.application_dir().join(CA_CHAIN_FILE)
    }

    pub fn application_key(&self) -> Utf8PathBuf {
        self.application_dir().join("superset_cluster_key.pem")
    }

    pub fn application_certificate(&self) -> Utf8PathBuf {
        self.application_dir().join("superset_cluster_certificate.pem")
    }

    pub fn application_secret(&self, name: &str) -> Utf8PathBuf {
        self.application_dir().join("secrets").join(name)
    }
}

impl Default for RemoteLayout {
    fn default() -> Self {
        Self::new(DEFAULT_REMOTE_ROOT)
    }
}
