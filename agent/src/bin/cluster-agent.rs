// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Context;
use clap::Parser;
use cluster_agent::AgentApp;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app = AgentApp::parse();
    let log = AgentApp::setup_log();
    let response = app.exec(&log).await?;
    let json = serde_json::to_string(&response)
        .context("failed to encode response")?;
    println!("{json}");
    Ok(())
}
