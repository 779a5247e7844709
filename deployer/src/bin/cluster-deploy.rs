// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context};
use camino_tempfile::Utf8TempDir;
use clap::Parser;
use cluster_channel::ssh::SshConnector;
use cluster_deployer::args::DeployArgs;
use cluster_deployer::config::DeployConfig;
use cluster_deployer::Deployer;
use slog::{info, warn};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = DeployArgs::parse();
    // Nothing is touched, locally or remotely, until the input is valid.
    let deployment = args.deployment().context("invalid deployment")?;

    let mut config = match &args.config {
        Some(path) => DeployConfig::from_file(path)?,
        None => DeployConfig::default(),
    };
    config.validate().context("invalid configuration")?;
    if let Some(level) = args.log_level {
        config.log = config.log.with_level(level);
    }
    let log = config.log.to_logger("cluster-deploy")?;

    let temp_dir: Utf8TempDir;
    let control_dir = match &config.ssh.control_dir {
        Some(dir) => dir.clone(),
        None => {
            temp_dir = camino_tempfile::Builder::new()
                .prefix("cluster-deploy-")
                .tempdir()
                .context("failed to create ssh control directory")?;
            temp_dir.path().to_owned()
        }
    };
    let connector = SshConnector::new(config.ssh.options(control_dir));
    let deployer = Deployer::new(&log, config, Arc::new(connector));

    let mut progress = deployer.subscribe();
    let progress_log = log.clone();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let step = progress.borrow_and_update().clone();
            info!(progress_log, "{step}");
        }
    });

    let result = tokio::select! {
        result = deployer.deploy(&deployment) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!(log, "interrupted; closing sessions");
            deployer.close_sessions().await;
            bail!("interrupted");
        }
    };

    match result {
        Ok(summary) => {
            info!(log, "cluster is up";
                "entrypoint" => &summary.entrypoint,
                "virtual_ip" => %deployment.network.ip(),
                "leaf_certificates" => summary.credentials.leaf_count(),
                "sessions_closed" => summary.sessions_closed,
            );
            Ok(())
        }
        Err(err) => {
            if let Some(logs) = err.collected_logs() {
                let node = err.node().unwrap_or("node");
                eprintln!("--- output collected from {node} ---");
                eprintln!("{logs}");
            }
            Err(err.into())
        }
    }
}
