// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File-transfer operations, and planning them for whole directory trees.

use crate::ChannelError;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeSet;
use std::fmt;

/// Owner read/write only.
pub const MODE_OWNER_ONLY: u32 = 0o600;

/// One file-system operation on a remote node.
#[derive(Clone, PartialEq, Eq)]
pub enum TransferOp {
    /// Create a directory.  A directory that already exists is not an error.
    Mkdir { remote: Utf8PathBuf },
    /// Copy a local file, replacing the remote file if present.
    Put { local: Utf8PathBuf, remote: Utf8PathBuf },
    /// Write `contents` to a remote file, replacing it if present.
    Write { contents: Vec<u8>, remote: Utf8PathBuf },
    Chmod { mode: u32, remote: Utf8PathBuf },
    /// Remove a file.  A missing file is not an error.
    Remove { remote: Utf8PathBuf },
}

impl TransferOp {
    pub fn remote(&self) -> &Utf8Path {
        match self {
            TransferOp::Mkdir { remote }
            | TransferOp::Put { remote, .. }
            | TransferOp::Write { remote, .. }
            | TransferOp::Chmod { remote, .. }
            | TransferOp::Remove { remote } => remote,
        }
    }

    /// Checks that every path in the operation can be carried by the
    /// transfer protocol.
    pub fn validate(&self) -> Result<(), ChannelError> {
        validate_remote_path(self.remote())?;
        if let TransferOp::Put { local, .. } = self {
            if !is_quotable(local.as_str()) {
                return Err(ChannelError::InvalidLocalPath(local.clone()));
            }
        }
        Ok(())
    }
}

// Contents may be secret material, so only their length is shown.
impl fmt::Debug for TransferOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOp::Mkdir { remote } => write!(f, "mkdir {remote}"),
            TransferOp::Put { local, remote } => {
                write!(f, "put {local} {remote}")
            }
            TransferOp::Write { contents, remote } => {
                write!(f, "write <{} bytes> {remote}", contents.len())
            }
            TransferOp::Chmod { mode, remote } => {
                write!(f, "chmod {mode:o} {remote}")
            }
            TransferOp::Remove { remote } => write!(f, "rm {remote}"),
        }
    }
}

fn is_quotable(path: &str) -> bool {
    !path.contains(['"', '\n', '\r'])
}

pub fn validate_remote_path(path: &Utf8Path) -> Result<(), ChannelError> {
    if path.is_absolute() && is_quotable(path.as_str()) {
        Ok(())
    } else {
        Err(ChannelError::InvalidRemotePath(path.to_owned()))
    }
}

/// An ordered list of [`TransferOp`]s.
///
/// Directories are always created before anything inside them, and each
/// directory is created at most once per plan.
#[derive(Debug, Default)]
pub struct TransferPlan {
    ops: Vec<TransferOp>,
    created: BTreeSet<Utf8PathBuf>,
}

impl TransferPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plans a recursive copy of the local directory `local` to `remote`.
    ///
    /// Every ancestor of `remote` is created, then the tree is walked with
    /// entries in sorted order, so planning the same tree twice yields the
    /// same operations.  Symbolic links are followed; one that leads back to
    /// a directory on its own path is an error.
    pub async fn mirror_tree(
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<Self, ChannelError> {
        let mut plan = Self::new();
        plan.ensure_dir(remote);

        let root = PendingDir {
            local: local.to_owned(),
            remote: remote.to_owned(),
            ancestors: vec![canonicalize(local).await?],
        };
        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            let mut subdirs = Vec::new();
            for name in read_dir_sorted(&dir.local).await? {
                let local_path = dir.local.join(&name);
                let remote_path = dir.remote.join(&name);
                let metadata =
                    tokio::fs::metadata(&local_path).await.map_err(|err| {
                        ChannelError::io(format!("stat {local_path}"), err)
                    })?;
                if metadata.is_dir() {
                    let canonical = canonicalize(&local_path).await?;
                    if dir.ancestors.contains(&canonical) {
                        return Err(ChannelError::SymlinkLoop(local_path));
                    }
                    let mut ancestors = dir.ancestors.clone();
                    ancestors.push(canonical);
                    plan.mkdir(&remote_path);
                    subdirs.push(PendingDir {
                        local: local_path,
                        remote: remote_path,
                        ancestors,
                    });
                } else if metadata.is_file() {
                    plan.put(&local_path, &remote_path);
                }
            }
            pending.extend(subdirs.into_iter().rev());
        }
        Ok(plan)
    }

    /// Creates `remote` and each of its ancestors, outermost first.
    pub fn ensure_dir(&mut self, remote: &Utf8Path) -> &mut Self {
        let mut ancestors: Vec<_> = remote
            .ancestors()
            .filter(|dir| dir.parent().is_some() && !dir.as_str().is_empty())
            .collect();
        ancestors.reverse();
        for dir in ancestors {
            self.mkdir(dir);
        }
        self
    }

    fn mkdir(&mut self, remote: &Utf8Path) {
        if self.created.insert(remote.to_owned()) {
            self.ops.push(TransferOp::Mkdir { remote: remote.to_owned() });
        }
    }

    pub fn put(&mut self, local: &Utf8Path, remote: &Utf8Path) -> &mut Self {
        self.ops.push(TransferOp::Put {
            local: local.to_owned(),
            remote: remote.to_owned(),
        });
        self
    }

    pub fn write(
        &mut self,
        contents: impl Into<Vec<u8>>,
        remote: &Utf8Path,
    ) -> &mut Self {
        if let Some(parent) = remote.parent() {
            self.ensure_dir(parent);
        }
        self.ops.push(TransferOp::Write {
            contents: contents.into(),
            remote: remote.to_owned(),
        });
        self
    }

    pub fn chmod(&mut self, mode: u32, remote: &Utf8Path) -> &mut Self {
        self.ops.push(TransferOp::Chmod { mode, remote: remote.to_owned() });
        self
    }

    pub fn remove(&mut self, remote: &Utf8Path) -> &mut Self {
        self.ops.push(TransferOp::Remove { remote: remote.to_owned() });
        self
    }

    pub fn ops(&self) -> &[TransferOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A local directory still to be walked, with the canonical paths of the
/// directories leading to it.
struct PendingDir {
    local: Utf8PathBuf,
    remote: Utf8PathBuf,
    ancestors: Vec<std::path::PathBuf>,
}

async fn canonicalize(
    path: &Utf8Path,
) -> Result<std::path::PathBuf, ChannelError> {
    tokio::fs::canonicalize(path)
        .await
        .map_err(|err| ChannelError::io(format!("resolve {path}"), err))
}

async fn read_dir_sorted(
    dir: &Utf8Path,
) -> Result<Vec<String>, ChannelError> {
    let read_error =
        |err| ChannelError::io(format!("read directory {dir}"), err);
    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_error)?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_error)? {
        let name = entry.file_name().into_string().map_err(|name| {
            ChannelError::InvalidLocalPath(
                dir.join(name.to_string_lossy().as_ref()),
            )
        })?;
        names.push(name);
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;

    fn mkdir(p: &str) -> TransferOp {
        TransferOp::Mkdir { remote: p.into() }
    }

    fn tree() -> Utf8TempDir {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("conf/nested")).unwrap();
        std::fs::write(root.join("seccomp.json"), "{}").unwrap();
        std::fs::write(root.join("conf/b.cnf"), "b").unwrap();
        std::fs::write(root.join("conf/a.cnf"), "a").unwrap();
        std::fs::write(root.join("conf/nested/z"), "z").unwrap();
        std::fs::create_dir(root.join("empty")).unwrap();
        dir
    }

    #[tokio::test]
    async fn mirror_tree_creates_directories_before_files() {
        let dir = tree();
        let local = dir.path();
        let plan = TransferPlan::mirror_tree(
            local,
            Utf8Path::new("/opt/cluster/mysql-server"),
        )
        .await
        .unwrap();

        let put = |l: &str, r: &str| TransferOp::Put {
            local: local.join(l),
            remote: Utf8PathBuf::from("/opt/cluster/mysql-server").join(r),
        };
        assert_eq!(
            plan.ops(),
            [
                mkdir("/opt"),
                mkdir("/opt/cluster"),
                mkdir("/opt/cluster/mysql-server"),
                mkdir("/opt/cluster/mysql-server/conf"),
                mkdir("/opt/cluster/mysql-server/empty"),
                put("seccomp.json", "seccomp.json"),
                put("conf/a.cnf", "conf/a.cnf"),
                put("conf/b.cnf", "conf/b.cnf"),
                mkdir("/opt/cluster/mysql-server/conf/nested"),
                put("conf/nested/z", "conf/nested/z"),
            ]
        );
    }

    #[tokio::test]
    async fn mirror_tree_is_deterministic() {
        let dir = tree();
        let a = TransferPlan::mirror_tree(dir.path(), Utf8Path::new("/srv"))
            .await
            .unwrap();
        let b = TransferPlan::mirror_tree(dir.path(), Utf8Path::new("/srv"))
            .await
            .unwrap();
        assert_eq!(a.ops(), b.ops());
    }

    #[tokio::test]
    async fn mirror_tree_of_missing_directory_fails() {
        let dir = camino_tempfile::tempdir().unwrap();
        assert_matches!(
            TransferPlan::mirror_tree(
                &dir.path().join("nope"),
                Utf8Path::new("/srv")
            )
            .await,
            Err(ChannelError::Io { .. })
        );
    }

    #[tokio::test]
    async fn mirror_tree_rejects_symlink_loops() {
        let dir = tree();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("conf/loop"))
            .unwrap();
        assert_matches!(
            TransferPlan::mirror_tree(dir.path(), Utf8Path::new("/srv")).await,
            Err(ChannelError::SymlinkLoop(path))
                if path == dir.path().join("conf/loop")
        );
    }

    #[tokio::test]
    async fn mirror_tree_follows_links_to_other_directories() {
        let dir = tree();
        let shared = camino_tempfile::tempdir().unwrap();
        std::fs::write(shared.path().join("ca.pem"), "ca").unwrap();
        // Two links to the same directory are copied twice, not a loop.
        std::os::unix::fs::symlink(shared.path(), dir.path().join("certs"))
            .unwrap();
        std::os::unix::fs::symlink(shared.path(), dir.path().join("conf/certs"))
            .unwrap();
        let plan = TransferPlan::mirror_tree(dir.path(), Utf8Path::new("/srv"))
            .await
            .unwrap();
        let puts: Vec<&Utf8Path> = plan
            .ops()
            .iter()
            .filter(|op| matches!(op, TransferOp::Put { .. }))
            .map(|op| op.remote())
            .filter(|remote| remote.ends_with("ca.pem"))
            .collect();
        assert_eq!(
            puts,
            [
                Utf8Path::new("/srv/certs/ca.pem"),
                Utf8Path::new("/srv/conf/certs/ca.pem"),
            ]
        );
    }

    #[test]
    fn write_creates_parents_once() {
        let mut plan = TransferPlan::new();
        plan.write("x", Utf8Path::new("/opt/c/requests/1.json"))
            .write("y", Utf8Path::new("/opt/c/requests/2.json"));
        assert_eq!(
            plan.ops()
                .iter()
                .filter(|op| matches!(op, TransferOp::Mkdir { .. }))
                .count(),
            3
        );
    }

    #[test]
    fn remote_paths_are_validated() {
        assert!(
            validate_remote_path(Utf8Path::new("/opt/superset-cluster")).is_ok()
        );
        for bad in ["relative/path", "/opt/\"quoted\"", "/opt/new\nline"] {
            assert_matches!(
                validate_remote_path(Utf8Path::new(bad)),
                Err(ChannelError::InvalidRemotePath(_))
            );
        }
        let op = TransferOp::Put {
            local: "/tmp/a\"b".into(),
            remote: "/opt/x".into(),
        };
        assert_matches!(op.validate(), Err(ChannelError::InvalidLocalPath(_)));
    }

    #[test]
    fn debug_hides_contents() {
        let op = TransferOp::Write {
            contents: b"hunter2".to_vec(),
            remote: "/opt/secret".into(),
        };
        assert_eq!(format!("{op:?}"), "write <7 bytes> /opt/secret");
    }
}
