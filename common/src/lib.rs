// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities shared by the cluster deployer and the remote agent.
//!
//! The deployer runs on the control host and drives every node over SSH; the
//! agent runs on each node, one invocation per request.  Both sides agree on
//! the request protocol ([`protocol`]), the remote file-system layout
//! ([`layout`]), and the health gate that sequences service start-up
//! ([`health`]).

pub mod address;
pub mod health;
pub mod layout;
pub mod protocol;

use std::fmt;

/// A type that allows adding file and line numbers to log messages
/// automatically. It should be instantiated at the root logger of each
/// executable that desires this functionality, as in the following example.
/// ```ignore
///     slog::Logger::root(drain, o!(FileKv))
/// ```
pub struct FileKv;

impl slog::KV for FileKv {
    fn serialize(
        &self,
        record: &slog::Record,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        // Only log file information when severity is at least info level
        if record.level() > slog::Level::Info {
            return Ok(());
        }
        serializer.emit_arguments(
            "file".into(),
            &format_args!("{}:{}", record.file(), record.line()),
        )
    }
}

/// Renders an error and every error in its `source()` chain on one line,
/// separated by `": "`.
///
/// Intended for structured log values:
///
/// ```ignore
///     warn!(log, "probe failed"; "error" => %InlineErrorChain::new(&err));
/// ```
pub struct InlineErrorChain<'a>(&'a (dyn std::error::Error + 'static));

impl<'a> InlineErrorChain<'a> {
    pub fn new(err: &'a (dyn std::error::Error + 'static)) -> Self {
        Self(err)
    }
}

impl fmt::Display for InlineErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}
