// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running container-runtime commands and checking their exit status.

use async_trait::async_trait;
use slog::{debug, warn, Logger};
use std::fmt;
use std::process::Stdio;

/// One command line to run, with the environment it alone sees.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Stdout carries secret material and must never be logged or echoed
    /// into error messages.
    pub secret_output: bool,
}

impl Invocation {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            secret_output: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }

    pub fn secret_output(mut self) -> Self {
        self.secret_output = true;
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured output of a command that exited successfully.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub struct CommandFailureInfo {
    pub command: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Command [{}] executed and failed with status: ",
            self.command
        )?;
        match self.status {
            Some(code) => write!(f, "{code}")?,
            None => write!(f, "killed by signal")?,
        }
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),
}

/// Runs commands on this node.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Runs `invocation` to completion.  A non-zero exit is an error.
    async fn run(
        &self,
        invocation: &Invocation,
    ) -> Result<Output, ExecutionError>;
}

/// A [`Runner`] that spawns real processes.
pub struct ProcessRunner {
    log: Logger,
}

impl ProcessRunner {
    pub fn new(log: &Logger) -> Self {
        Self { log: log.clone() }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
    ) -> Result<Output, ExecutionError> {
        let command = invocation.to_string();
        debug!(self.log, "running command"; "command" => &command);
        let output = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| ExecutionError::ExecutionStart {
                command: command.clone(),
                err,
            })?;

        let stdout = if invocation.secret_output {
            String::from_utf8_lossy(&output.stdout).to_string()
        } else {
            String::from_utf8_lossy(&output.stdout).trim_end().to_string()
        };
        let stderr =
            String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        if !output.status.success() {
            warn!(self.log, "command failed";
                "command" => &command,
                "status" => ?output.status.code(),
                "stderr" => &stderr,
            );
            return Err(ExecutionError::CommandFailure(Box::new(
                CommandFailureInfo {
                    command,
                    status: output.status.code(),
                    stdout: if invocation.secret_output {
                        "<redacted>".to_string()
                    } else {
                        stdout
                    },
                    stderr,
                },
            )));
        }
        Ok(Output { stdout, stderr })
    }
}
