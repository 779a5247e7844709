// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::transfer::TransferOp;
use crate::ChannelError;
use async_trait::async_trait;
use slog::Logger;

/// Captured result of a command run on a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    /// Exit code, or `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// An authenticated session to one node, able to move files and run
/// commands.
///
/// - In production, this is an [`crate::ssh::SshTransport`].
/// - Under test, a fake transport backed by an in-memory file system may be
///   used instead.
#[async_trait]
pub trait Transport: Send + Sync {
    fn node(&self) -> &str;

    /// Applies `ops` in order, stopping at the first failure.
    async fn apply(&self, ops: &[TransferOp]) -> Result<(), ChannelError>;

    /// Runs `argv` on the node and captures its output.  A non-zero exit is
    /// reported in [`RemoteOutput::status`], not as an error.
    async fn exec(&self, argv: &[String]) -> Result<RemoteOutput, ChannelError>;

    /// Tears the session down.  Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Opens [`Transport`]s.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        log: &Logger,
        node: &str,
    ) -> Result<Box<dyn Transport>, ChannelError>;
}
