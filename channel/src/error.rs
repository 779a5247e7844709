// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;

/// Details of a remote command that ran and exited unsuccessfully.
#[derive(Debug)]
pub struct ExecutionFailure {
    pub node: String,
    /// The command line as run on the node.
    pub command: String,
    /// Exit code, or `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "command [{}] on {} failed with status: ",
            self.command, self.node
        )?;
        match self.status {
            Some(code) => write!(f, "{code}")?,
            None => write!(f, "killed by signal")?,
        }
        write!(f, "  stdout: {}", self.stdout.trim_end())?;
        write!(f, "  stderr: {}", self.stderr.trim_end())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    #[error("cannot resolve node {node}: {reason}")]
    Resolve { node: String, reason: String },

    #[error("cannot connect to node {node}: {message}")]
    Connect { node: String, message: String },

    #[error("transfer to node {node} failed: {message}")]
    Transfer { node: String, message: String },

    #[error("{0}")]
    Execution(Box<ExecutionFailure>),

    #[error("malformed response from agent on {node} to {command}: {message}")]
    Protocol { node: String, command: &'static str, message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        err: std::io::Error,
    },

    #[error("remote path {0:?} is not absolute or contains a quote or newline")]
    InvalidRemotePath(Utf8PathBuf),

    #[error("local path {0:?} cannot be transferred")]
    InvalidLocalPath(Utf8PathBuf),

    #[error("local directory {0:?} links back to one of its ancestors")]
    SymlinkLoop(Utf8PathBuf),

    #[error("session to node {0} is closed")]
    Closed(String),
}

impl ChannelError {
    /// True for failures to reach or authenticate to a node, as opposed to
    /// failures of work done over an established session.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            ChannelError::Resolve { .. } | ChannelError::Connect { .. }
        )
    }

    pub(crate) fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        ChannelError::Io { context: context.into(), err }
    }
}
