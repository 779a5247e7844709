// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bootstraps a storage, routing and application cluster from one control
//! host.

pub mod args;
pub mod config;
mod error;
mod fanout;
pub mod login;
pub mod logging;
mod pipeline;
mod progress;
pub mod registry;
pub mod stage;
pub mod topology;

pub use error::DeployError;
pub use pipeline::{DeploySummary, Deployer};
pub use progress::DeployStep;
