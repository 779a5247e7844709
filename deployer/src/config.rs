// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deployer configuration, loaded from an optional TOML file.
//!
//! Every field has a default, so an empty file (or no file) is a complete
//! configuration.

use crate::logging::ConfigLogging;
use camino::{Utf8Path, Utf8PathBuf};
use cluster_channel::ssh::SshOptions;
use cluster_common::health::{HealthCheckPolicy, PolicyError};
use cluster_common::layout::DEFAULT_REMOTE_ROOT;
use serde::Deserialize;
use serde_with::serde_as;
use serde_with::DurationSeconds;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CLUSTER_NAME: &str = "Superset-Cluster";
pub const DEFAULT_SSH_USER: &str = "superset";
pub const DEFAULT_STORAGE_IMAGE: &str =
    "ghcr.io/szachovy/superset-cluster-mysql-server:latest";
pub const DEFAULT_CACHE_IMAGE: &str = "redis";
pub const DEFAULT_APPLICATION_IMAGE: &str =
    "ghcr.io/szachovy/superset-cluster-superset-service:latest";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to parse config from {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("invalid {tier} health policy")]
    Policy {
        tier: &'static str,
        #[source]
        err: PolicyError,
    },
    #[error(
        "{what} must be an absolute path without quotes or newlines: \
         {path:?}"
    )]
    RemotePath { what: &'static str, path: Utf8PathBuf },
    #[error("max_parallelism must be at least 1")]
    Parallelism,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DeployConfig {
    /// Common name of the root certificate; leaf names are derived from it.
    pub cluster_name: String,
    pub ssh: SshSettings,
    /// Local directory holding `mysql-server/`, `mysql-mgmt/` and
    /// `superset/`, mirrored to the nodes that run each service.
    pub services_dir: Utf8PathBuf,
    pub remote_root: Utf8PathBuf,
    /// The agent binary, preinstalled on every node.
    pub agent_path: Utf8PathBuf,
    pub images: Images,
    pub health: HealthPolicies,
    /// Caps the number of nodes worked on at once within a stage.  Unset
    /// means one worker per node.
    pub max_parallelism: Option<usize>,
    pub log: ConfigLogging,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            ssh: SshSettings::default(),
            services_dir: Utf8PathBuf::from("services"),
            remote_root: Utf8PathBuf::from(DEFAULT_REMOTE_ROOT),
            agent_path: Utf8PathBuf::from(DEFAULT_REMOTE_ROOT)
                .join("bin/cluster-agent"),
            images: Images::default(),
            health: HealthPolicies::default(),
            max_parallelism: None,
            log: ConfigLogging::default(),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SshSettings {
    pub user: String,
    /// Consulted when a direct connection fails.  A leading `~/` is expanded.
    pub config_path: Utf8PathBuf,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "connect_timeout_secs")]
    pub connect_timeout: Duration,
    /// Where multiplexing sockets live.  Unset means a temporary directory
    /// for the duration of the run.
    pub control_dir: Option<Utf8PathBuf>,
    pub ssh_program: String,
    pub sftp_program: String,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: DEFAULT_SSH_USER.to_string(),
            config_path: Utf8PathBuf::from("~/.ssh/config"),
            connect_timeout: Duration::from_secs(10),
            control_dir: None,
            ssh_program: "ssh".to_string(),
            sftp_program: "sftp".to_string(),
        }
    }
}

impl SshSettings {
    /// The channel options for this run, with control sockets in
    /// `control_dir`.
    pub fn options(&self, control_dir: Utf8PathBuf) -> SshOptions {
        SshOptions {
            user: self.user.clone(),
            config_path: self.expanded_config_path(),
            connect_timeout: self.connect_timeout,
            control_dir,
            ssh_program: self.ssh_program.clone(),
            sftp_program: self.sftp_program.clone(),
        }
    }

    /// `config_path` with `~/` replaced by the user's home directory.
    pub fn expanded_config_path(&self) -> Utf8PathBuf {
        match (self.config_path.strip_prefix("~"), std::env::var("HOME")) {
            (Ok(rest), Ok(home)) => Utf8PathBuf::from(home).join(rest),
            _ => self.config_path.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Images {
    pub storage: String,
    pub cache: String,
    pub application: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            storage: DEFAULT_STORAGE_IMAGE.to_string(),
            cache: DEFAULT_CACHE_IMAGE.to_string(),
            application: DEFAULT_APPLICATION_IMAGE.to_string(),
        }
    }
}

/// One gate policy per kind of service.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HealthPolicies {
    /// Slow cold start: long grace period, few retries.
    pub storage: HealthCheckPolicy,
    /// Fast convergence: short grace period, few retries.
    pub routing: HealthCheckPolicy,
    pub cache: HealthCheckPolicy,
    /// The application warms up slowly.
    pub application: HealthCheckPolicy,
}

impl Default for HealthPolicies {
    fn default() -> Self {
        const fn secs(s: u64) -> Duration {
            Duration::from_secs(s)
        }
        Self {
            storage: HealthCheckPolicy::new(secs(90), secs(5), 3, secs(10)),
            routing: HealthCheckPolicy::new(secs(25), secs(5), 3, secs(5)),
            cache: HealthCheckPolicy::new(secs(10), secs(10), 5, secs(5)),
            application: HealthCheckPolicy::new(
                secs(60),
                secs(30),
                20,
                secs(5),
            ),
        }
    }
}

impl DeployConfig {
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.to_owned(), err })?;
        let config: DeployConfig = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.to_owned(), err })?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (tier, policy) in [
            ("storage", &self.health.storage),
            ("routing", &self.health.routing),
            ("cache", &self.health.cache),
            ("application", &self.health.application),
        ] {
            policy.validate().map_err(|err| ConfigError::Policy { tier, err })?;
        }
        let paths = [
            ("remote_root", &self.remote_root),
            ("agent_path", &self.agent_path),
        ];
        for (what, path) in paths {
            let carriable = path.is_absolute()
                && !path.as_str().contains(['"', '\n', '\r']);
            if !carriable {
                let path = path.clone();
                return Err(ConfigError::RemotePath { what, path });
            }
        }
        if self.max_parallelism == Some(0) {
            return Err(ConfigError::Parallelism);
        }
        Ok(())
    }
}
