// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A [`Connector`] that never leaves the process.
//!
//! Every node gets an in-memory file system.  Agent invocations are answered
//! by a caller-provided responder which sees the decoded request, so tests
//! can script the cluster's behavior.  Everything that happens is appended to
//! one shared event log, in order, across all nodes.

use crate::transfer::TransferOp;
use crate::transport::{Connector, RemoteOutput, Transport};
use crate::ChannelError;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use cluster_common::protocol::{AgentRequest, AgentResponse};
use slog::{debug, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

const DEFAULT_FILE_MODE: u32 = 0o644;

/// What the fake agent does with one request.
#[derive(Clone, Debug)]
pub enum FakeReply {
    /// Exit 0 and print `response`.
    Respond(AgentResponse),
    /// Exit with `status` and print `stderr`.
    Fail { status: i32, stderr: String },
    /// Exit 0 and print arbitrary bytes.
    Raw { stdout: Vec<u8> },
    /// Never finish, like a command stuck on an unresponsive runtime.
    Hang,
}

pub type FakeResponder =
    dyn Fn(&str, &AgentRequest) -> FakeReply + Send + Sync;

#[derive(Clone, Debug)]
pub enum FakeEvent {
    Connect { node: String },
    Transfer { node: String, op: TransferOp },
    Exec { node: String, request: AgentRequest },
    Close { node: String },
}

impl FakeEvent {
    pub fn node(&self) -> &str {
        match self {
            FakeEvent::Connect { node }
            | FakeEvent::Transfer { node, .. }
            | FakeEvent::Exec { node, .. }
            | FakeEvent::Close { node } => node,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Entry {
    Dir,
    File { contents: Vec<u8>, mode: u32 },
}

#[derive(Default)]
struct FakeState {
    filesystems: BTreeMap<String, BTreeMap<Utf8PathBuf, Entry>>,
    events: Vec<FakeEvent>,
    unreachable: BTreeSet<String>,
}

struct Inner {
    state: Mutex<FakeState>,
    responder: Mutex<Arc<FakeResponder>>,
}

/// Hands out [`FakeTransport`]s that share one simulated cluster.
#[derive(Clone)]
pub struct FakeConnector {
    inner: Arc<Inner>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeConnector {
    /// Creates a cluster whose agents answer every request with
    /// [`AgentResponse::Done`].
    pub fn new() -> Self {
        let responder: Arc<FakeResponder> =
            Arc::new(|_: &str, _: &AgentRequest| {
                FakeReply::Respond(AgentResponse::Done)
            });
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(FakeState::default()),
                responder: Mutex::new(responder),
            }),
        }
    }

    pub fn set_responder<F>(&self, f: F)
    where
        F: Fn(&str, &AgentRequest) -> FakeReply + Send + Sync + 'static,
    {
        *self.inner.responder.lock().unwrap() = Arc::new(f);
    }

    /// Makes every later connection attempt to `node` fail.
    pub fn set_unreachable(&self, node: &str) {
        self.inner.state.lock().unwrap().unreachable.insert(node.to_string());
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.inner.state.lock().unwrap().events.clone()
    }

    /// Every agent request executed so far, as `(node, request)`.
    pub fn requests(&self) -> Vec<(String, AgentRequest)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                FakeEvent::Exec { node, request } => Some((node, request)),
                _ => None,
            })
            .collect()
    }

    pub fn connected_nodes(&self) -> Vec<String> {
        self.nodes_with(|e| matches!(e, FakeEvent::Connect { .. }))
    }

    pub fn closed_nodes(&self) -> Vec<String> {
        self.nodes_with(|e| matches!(e, FakeEvent::Close { .. }))
    }

    fn nodes_with(&self, f: impl Fn(&FakeEvent) -> bool) -> Vec<String> {
        self.inner
            .state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| f(e))
            .map(|e| e.node().to_string())
            .collect()
    }

    /// Every regular file on `node` with its contents.
    pub fn files(&self, node: &str) -> BTreeMap<Utf8PathBuf, Vec<u8>> {
        let state = self.inner.state.lock().unwrap();
        state
            .filesystems
            .get(node)
            .map(|fs| {
                fs.iter()
                    .filter_map(|(path, entry)| match entry {
                        Entry::File { contents, .. } => {
                            Some((path.clone(), contents.clone()))
                        }
                        Entry::Dir => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn file(&self, node: &str, path: &Utf8Path) -> Option<Vec<u8>> {
        self.files(node).remove(path)
    }

    pub fn is_dir(&self, node: &str, path: &Utf8Path) -> bool {
        let state = self.inner.state.lock().unwrap();
        state
            .filesystems
            .get(node)
            .and_then(|fs| fs.get(path))
            .is_some_and(|e| *e == Entry::Dir)
    }

    pub fn mode(&self, node: &str, path: &Utf8Path) -> Option<u32> {
        let state = self.inner.state.lock().unwrap();
        match state.filesystems.get(node)?.get(path)? {
            Entry::File { mode, .. } => Some(*mode),
            Entry::Dir => None,
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        log: &Logger,
        node: &str,
    ) -> Result<Box<dyn Transport>, ChannelError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.unreachable.contains(node) {
            return Err(ChannelError::Connect {
                node: node.to_string(),
                message: "Connection refused".to_string(),
            });
        }
        state.events.push(FakeEvent::Connect { node: node.to_string() });
        state.filesystems.entry(node.to_string()).or_default();
        debug!(log, "fake session opened");
        Ok(Box::new(FakeTransport {
            node: node.to_string(),
            inner: self.inner.clone(),
            closed: false,
        }))
    }
}

/// One fake session.
pub struct FakeTransport {
    node: String,
    inner: Arc<Inner>,
    closed: bool,
}

impl FakeTransport {
    fn transfer_error(&self, message: String) -> ChannelError {
        ChannelError::Transfer { node: self.node.clone(), message }
    }

    fn apply_one(
        &self,
        fs: &mut BTreeMap<Utf8PathBuf, Entry>,
        op: &TransferOp,
        local_contents: Option<Vec<u8>>,
    ) -> Result<(), ChannelError> {
        let parent_is_dir = |fs: &BTreeMap<Utf8PathBuf, Entry>, p: &Utf8Path| {
            match p.parent() {
                Some(parent) if parent != "/" => {
                    fs.get(parent) == Some(&Entry::Dir)
                }
                _ => true,
            }
        };
        match op {
            TransferOp::Mkdir { remote } => {
                match fs.get(remote.as_path()) {
                    Some(Entry::Dir) => {}
                    Some(Entry::File { .. }) => {
                        return Err(self.transfer_error(format!(
                            "mkdir {remote}: file exists"
                        )));
                    }
                    None if !parent_is_dir(fs, remote) => {
                        return Err(self.transfer_error(format!(
                            "mkdir {remote}: no such file or directory"
                        )));
                    }
                    None => {
                        fs.insert(remote.clone(), Entry::Dir);
                    }
                }
            }
            TransferOp::Put { remote, .. }
            | TransferOp::Write { remote, .. } => {
                if !parent_is_dir(fs, remote) {
                    return Err(self.transfer_error(format!(
                        "{remote}: no such file or directory"
                    )));
                }
                let contents = match op {
                    TransferOp::Write { contents, .. } => contents.clone(),
                    _ => local_contents.unwrap_or_default(),
                };
                let mode = match fs.get(remote.as_path()) {
                    Some(Entry::File { mode, .. }) => *mode,
                    Some(Entry::Dir) => {
                        return Err(self.transfer_error(format!(
                            "{remote}: is a directory"
                        )));
                    }
                    None => DEFAULT_FILE_MODE,
                };
                fs.insert(remote.clone(), Entry::File { contents, mode });
            }
            TransferOp::Chmod { mode, remote } => {
                match fs.get_mut(remote.as_path()) {
                    Some(Entry::File { mode: m, .. }) => *m = *mode,
                    _ => {
                        return Err(self.transfer_error(format!(
                            "chmod {remote}: no such file"
                        )));
                    }
                }
            }
            TransferOp::Remove { remote } => {
                if let Some(Entry::File { .. }) = fs.get(remote.as_path()) {
                    fs.remove(remote.as_path());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn node(&self) -> &str {
        &self.node
    }

    async fn apply(&self, ops: &[TransferOp]) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed(self.node.clone()));
        }
        // Local files are read up front so the state lock is never held
        // across an await.
        let mut local = Vec::with_capacity(ops.len());
        for op in ops {
            local.push(match op {
                TransferOp::Put { local, .. } => Some(
                    tokio::fs::read(local).await.map_err(|err| {
                        ChannelError::io(format!("read {local}"), err)
                    })?,
                ),
                _ => None,
            });
        }

        let mut state = self.inner.state.lock().unwrap();
        for (op, contents) in ops.iter().zip(local) {
            state.events.push(FakeEvent::Transfer {
                node: self.node.clone(),
                op: op.clone(),
            });
            let fs = state.filesystems.entry(self.node.clone()).or_default();
            self.apply_one(fs, op, contents)?;
        }
        Ok(())
    }

    async fn exec(
        &self,
        argv: &[String],
    ) -> Result<RemoteOutput, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed(self.node.clone()));
        }
        let request_path = match argv {
            [_, flag, path] if flag == "--request" => Utf8PathBuf::from(path),
            _ => {
                return Ok(RemoteOutput {
                    status: Some(127),
                    stdout: Vec::new(),
                    stderr: format!("unexpected command: {argv:?}")
                        .into_bytes(),
                })
            }
        };

        let request = {
            let mut state = self.inner.state.lock().unwrap();
            let body = match state
                .filesystems
                .get(&self.node)
                .and_then(|fs| fs.get(&request_path))
            {
                Some(Entry::File { contents, .. }) => contents.clone(),
                _ => {
                    return Ok(RemoteOutput {
                        status: Some(2),
                        stdout: Vec::new(),
                        stderr: format!("{request_path}: not found")
                            .into_bytes(),
                    })
                }
            };
            let request: AgentRequest = match serde_json::from_slice(&body) {
                Ok(request) => request,
                Err(err) => {
                    return Ok(RemoteOutput {
                        status: Some(1),
                        stdout: Vec::new(),
                        stderr: err.to_string().into_bytes(),
                    })
                }
            };
            state.events.push(FakeEvent::Exec {
                node: self.node.clone(),
                request: request.clone(),
            });
            request
        };

        let responder = self.inner.responder.lock().unwrap().clone();
        Ok(match responder(&self.node, &request) {
            FakeReply::Respond(response) => RemoteOutput {
                status: Some(0),
                stdout: serde_json::to_vec(&response).unwrap_or_default(),
                stderr: Vec::new(),
            },
            FakeReply::Fail { status, stderr } => RemoteOutput {
                status: Some(status),
                stdout: Vec::new(),
                stderr: stderr.into_bytes(),
            },
            FakeReply::Raw { stdout } => {
                RemoteOutput { status: Some(0), stdout, stderr: Vec::new() }
            }
            FakeReply::Hang => std::future::pending::<RemoteOutput>().await,
        })
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if !self.closed {
            self.closed = true;
            self.inner
                .state
                .lock()
                .unwrap()
                .events
                .push(FakeEvent::Close { node: self.node.clone() });
        }
        Ok(())
    }
}
