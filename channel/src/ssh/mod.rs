// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Transport`] over the system OpenSSH client.
//!
//! Each node gets one multiplexing master connection.  Commands and sftp
//! batches then ride on its control socket, so a node is authenticated once
//! per run no matter how many operations follow.

mod config;

pub use config::{ResolvedHost, SshConfig};

use crate::transfer::TransferOp;
use crate::transport::{Connector, RemoteOutput, Transport};
use crate::ChannelError;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::NamedUtf8TempFile;
use slog::{debug, info, o, warn, Logger};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// Extra time, beyond the connect timeout, allowed for authentication.
const MASTER_STARTUP_SLACK: Duration = Duration::from_secs(10);
const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MASTER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshOptions {
    /// Login user for the direct attempt, and for the fallback when the
    /// ssh config names none.
    pub user: String,
    /// The ssh config consulted by the fallback attempt.
    pub config_path: Utf8PathBuf,
    pub connect_timeout: Duration,
    /// Holds control sockets, master logs and staged uploads.
    pub control_dir: Utf8PathBuf,
    pub ssh_program: String,
    pub sftp_program: String,
}

/// Everything needed to address one node on the ssh command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTarget {
    pub node: String,
    pub destination: String,
    pub user: String,
    pub port: Option<u16>,
    pub identity_files: Vec<Utf8PathBuf>,
}

impl SshTarget {
    /// Connect to the node name as given, with the default identity.
    pub fn direct(node: &str, options: &SshOptions) -> Self {
        Self {
            node: node.to_string(),
            destination: node.to_string(),
            user: options.user.clone(),
            port: None,
            identity_files: Vec::new(),
        }
    }

    /// Connect to the address the ssh config gives for the node.
    pub fn from_config(
        node: &str,
        resolved: ResolvedHost,
        options: &SshOptions,
    ) -> Result<Self, ChannelError> {
        let Some(destination) = resolved.hostname else {
            return Err(ChannelError::Resolve {
                node: node.to_string(),
                reason: format!(
                    "no HostName for it in {}",
                    options.config_path
                ),
            });
        };
        Ok(Self {
            node: node.to_string(),
            destination,
            user: resolved.user.unwrap_or_else(|| options.user.clone()),
            port: resolved.port,
            identity_files: resolved.identity_files,
        })
    }

    /// Options shared by every ssh and sftp invocation for this target.
    /// The user's own config is never read; everything is explicit.
    fn common_args(
        &self,
        options: &SshOptions,
        control_path: &Utf8Path,
    ) -> Vec<String> {
        let mut args = vec![
            "-F".to_string(),
            "/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!(
                "ConnectTimeout={}",
                options.connect_timeout.as_secs().max(1)
            ),
            "-o".to_string(),
            format!("ControlPath=\"{control_path}\""),
            "-o".to_string(),
            format!("User={}", self.user),
        ];
        if let Some(port) = self.port {
            args.push("-o".to_string());
            args.push(format!("Port={port}"));
        }
        for identity in &self.identity_files {
            args.push("-o".to_string());
            args.push(format!("IdentityFile=\"{identity}\""));
        }
        if !self.identity_files.is_empty() {
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }
        args
    }

    pub fn master_args(
        &self,
        options: &SshOptions,
        control_path: &Utf8Path,
        log_file: &Utf8Path,
    ) -> Vec<String> {
        let mut args = self.common_args(options, control_path);
        args.extend([
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            "ControlPersist=no".to_string(),
            "-N".to_string(),
            "-E".to_string(),
            log_file.to_string(),
            self.destination.clone(),
        ]);
        args
    }

    /// `ssh -O <command>` against the running master.
    pub fn control_args(
        &self,
        options: &SshOptions,
        control_path: &Utf8Path,
        command: &str,
    ) -> Vec<String> {
        let mut args = self.common_args(options, control_path);
        args.extend([
            "-O".to_string(),
            command.to_string(),
            self.destination.clone(),
        ]);
        args
    }

    pub fn exec_args(
        &self,
        options: &SshOptions,
        control_path: &Utf8Path,
        argv: &[String],
    ) -> Vec<String> {
        let mut args = self.common_args(options, control_path);
        args.extend([
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-T".to_string(),
            self.destination.clone(),
            "--".to_string(),
            shell_words::join(argv),
        ]);
        args
    }

    pub fn sftp_args(
        &self,
        options: &SshOptions,
        control_path: &Utf8Path,
    ) -> Vec<String> {
        let mut args = self.common_args(options, control_path);
        args.extend([
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-b".to_string(),
            "-".to_string(),
            self.destination.clone(),
        ]);
        args
    }
}

/// Renders `ops` as an sftp batch script.
///
/// `staged[i]` is the local file holding the contents of `ops[i]` when it is
/// a [`TransferOp::Write`].  Commands prefixed with `-` may fail without
/// aborting the batch: that makes creating an existing directory and
/// removing a missing file harmless.
pub fn render_batch(
    ops: &[TransferOp],
    staged: &[Option<Utf8PathBuf>],
) -> String {
    let mut batch = String::new();
    for (i, op) in ops.iter().enumerate() {
        let line = match op {
            TransferOp::Mkdir { remote } => format!("-mkdir \"{remote}\""),
            TransferOp::Put { local, remote } => {
                format!("put \"{local}\" \"{remote}\"")
            }
            TransferOp::Write { remote, .. } => {
                let local =
                    staged.get(i).cloned().flatten().unwrap_or_default();
                format!("put \"{local}\" \"{remote}\"")
            }
            TransferOp::Chmod { mode, remote } => {
                format!("chmod {mode:o} \"{remote}\"")
            }
            TransferOp::Remove { remote } => format!("-rm \"{remote}\""),
        };
        batch.push_str(&line);
        batch.push('\n');
    }
    batch
}

/// Opens [`SshTransport`]s: first directly, then through the ssh config.
#[derive(Clone, Debug)]
pub struct SshConnector {
    options: SshOptions,
}

impl SshConnector {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        log: &Logger,
        node: &str,
    ) -> Result<Box<dyn Transport>, ChannelError> {
        let direct = SshTarget::direct(node, &self.options);
        let first_err =
            match SshTransport::open(log, &self.options, direct).await {
                Ok(transport) => return Ok(Box::new(transport)),
                Err(err) => err,
            };
        warn!(log, "direct connection failed; resolving through ssh config";
            "error" => %first_err,
            "config" => %self.options.config_path,
        );

        let config = SshConfig::load(&self.options.config_path)
            .await
            .map_err(|err| {
                ChannelError::io(
                    format!("read ssh config {}", self.options.config_path),
                    err,
                )
            })?;
        let target =
            SshTarget::from_config(node, config.resolve(node), &self.options)?;
        info!(log, "retrying with resolved host";
            "destination" => &target.destination,
            "identity_files" => ?target.identity_files,
        );
        let transport = SshTransport::open(log, &self.options, target).await?;
        Ok(Box::new(transport))
    }
}

/// A multiplexed OpenSSH session.  Dropping it kills the master.
pub struct SshTransport {
    log: Logger,
    options: SshOptions,
    target: SshTarget,
    control_path: Utf8PathBuf,
    master: Option<Child>,
}

impl SshTransport {
    async fn open(
        log: &Logger,
        options: &SshOptions,
        target: SshTarget,
    ) -> Result<Self, ChannelError> {
        let node = target.node.clone();
        let log = log.new(o!("destination" => target.destination.clone()));
        tokio::fs::create_dir_all(&options.control_dir).await.map_err(|err| {
            ChannelError::io(
                format!("create control directory {}", options.control_dir),
                err,
            )
        })?;
        let control_path = options.control_dir.join(format!("{node}.sock"));
        let log_file = options.control_dir.join(format!("{node}.log"));
        let _ = tokio::fs::remove_file(&control_path).await;
        let _ = tokio::fs::remove_file(&log_file).await;

        let args = target.master_args(options, &control_path, &log_file);
        debug!(log, "starting ssh master"; "args" => ?args);
        let mut master = Command::new(&options.ssh_program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ChannelError::io(format!("spawn {}", options.ssh_program), err)
            })?;

        let deadline =
            Instant::now() + options.connect_timeout + MASTER_STARTUP_SLACK;
        loop {
            let exited = master.try_wait().map_err(|err| {
                ChannelError::io("wait for ssh master", err)
            })?;
            if let Some(status) = exited {
                let diagnostics = tokio::fs::read_to_string(&log_file)
                    .await
                    .unwrap_or_default();
                return Err(ChannelError::Connect {
                    node,
                    message: format!(
                        "ssh to {} exited with {status}: {}",
                        target.destination,
                        diagnostics.trim()
                    ),
                });
            }

            let check = Command::new(&options.ssh_program)
                .args(target.control_args(options, &control_path, "check"))
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|err| {
                    ChannelError::io(
                        format!("spawn {}", options.ssh_program),
                        err,
                    )
                })?;
            if check.status.success() {
                break;
            }
            if Instant::now() >= deadline {
                let _ = master.kill().await;
                return Err(ChannelError::Connect {
                    node,
                    message: format!(
                        "timed out authenticating to {}",
                        target.destination
                    ),
                });
            }
            tokio::time::sleep(MASTER_POLL_INTERVAL).await;
        }

        info!(log, "ssh master ready");
        Ok(Self {
            log,
            options: options.clone(),
            target,
            control_path,
            master: Some(master),
        })
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.master.is_none() {
            return Err(ChannelError::Closed(self.target.node.clone()));
        }
        Ok(())
    }

    /// Writes the contents of every `Write` op to an owner-only local file.
    /// The files are deleted when the returned handles are dropped.
    async fn stage(
        &self,
        ops: &[TransferOp],
    ) -> Result<Vec<Option<NamedUtf8TempFile>>, ChannelError> {
        let mut staged = Vec::with_capacity(ops.len());
        for op in ops {
            let TransferOp::Write { contents, .. } = op else {
                staged.push(None);
                continue;
            };
            let file = NamedUtf8TempFile::new_in(&self.options.control_dir)
                .map_err(|err| ChannelError::io("create staging file", err))?;
            tokio::fs::write(file.path(), contents).await.map_err(|err| {
                ChannelError::io(
                    format!("write staging file {}", file.path()),
                    err,
                )
            })?;
            staged.push(Some(file));
        }
        Ok(staged)
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn node(&self) -> &str {
        &self.target.node
    }

    async fn apply(&self, ops: &[TransferOp]) -> Result<(), ChannelError> {
        self.ensure_open()?;
        if ops.is_empty() {
            return Ok(());
        }
        let staged = self.stage(ops).await?;
        let staged_paths: Vec<_> = staged
            .iter()
            .map(|f| f.as_ref().map(|f| f.path().to_owned()))
            .collect();
        let batch = render_batch(ops, &staged_paths);

        let mut child = Command::new(&self.options.sftp_program)
            .args(self.target.sftp_args(&self.options, &self.control_path))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ChannelError::io(
                    format!("spawn {}", self.options.sftp_program),
                    err,
                )
            })?;
        // The batch is fed while stdout and stderr are drained, so a chatty
        // sftp cannot block on a full pipe before reading all of its input.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(batch.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|err| ChannelError::io("wait for sftp", err))?;
        drop(staged);

        if !output.status.success() {
            return Err(ChannelError::Transfer {
                node: self.target.node.clone(),
                message: format!(
                    "sftp exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        fed.map_err(|err| ChannelError::io("write sftp batch", err))?;
        debug!(self.log, "sftp batch complete"; "ops" => ops.len());
        Ok(())
    }

    async fn exec(
        &self,
        argv: &[String],
    ) -> Result<RemoteOutput, ChannelError> {
        self.ensure_open()?;
        let args =
            self.target.exec_args(&self.options, &self.control_path, argv);
        let output = Command::new(&self.options.ssh_program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                ChannelError::io(
                    format!("spawn {}", self.options.ssh_program),
                    err,
                )
            })?;
        Ok(RemoteOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        let Some(mut master) = self.master.take() else {
            return Ok(());
        };
        let args =
            self.target.control_args(&self.options, &self.control_path, "exit");
        let exit = Command::new(&self.options.ssh_program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await;
        if let Err(err) = &exit {
            warn!(self.log, "failed to ask ssh master to exit";
                "error" => %err);
        }
        match tokio::time::timeout(MASTER_EXIT_TIMEOUT, master.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(ChannelError::io("wait for ssh master", err)),
            Err(_) => {
                warn!(self.log, "ssh master did not exit; killing it");
                master
                    .kill()
                    .await
                    .map_err(|err| ChannelError::io("kill ssh master", err))
            }
        }
    }
}
