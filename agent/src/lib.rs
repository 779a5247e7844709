// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-call helper the deployer runs on each node.  It reads one
//! request, drives the container runtime, and prints one response.

mod dispatch;
pub mod docker;
pub mod runner;

pub use dispatch::{read_request, Agent, AgentApp, AgentError};
