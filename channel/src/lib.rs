// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Authenticated sessions to cluster nodes: file transfer and agent
//! invocation over ssh.

mod channel;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod ssh;
pub mod transfer;
pub mod transport;

pub use channel::{new_nonce, ChannelSettings, ExecutionChannel};
pub use error::{ChannelError, ExecutionFailure};
pub use transfer::{TransferOp, TransferPlan};
pub use transport::{Connector, RemoteOutput, Transport};
