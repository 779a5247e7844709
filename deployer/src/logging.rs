// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Root logger construction for the deployer binary.

use camino::{Utf8Path, Utf8PathBuf};
use cluster_common::FileKv;
use serde::Deserialize;
use slog::{o, Drain, Level, Logger};
use std::fs::OpenOptions;

#[derive(Debug, thiserror::Error)]
#[error("failed to open log file {path}")]
pub struct LogInitError {
    path: Utf8PathBuf,
    #[source]
    err: std::io::Error,
}

/// The `[log]` table of the deployer configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode")]
pub enum ConfigLogging {
    #[serde(rename = "stderr-terminal")]
    StderrTerminal { level: ConfigLoggingLevel },

    /// Bunyan-formatted JSON records appended to (or replacing) a file.
    #[serde(rename = "file")]
    File {
        level: ConfigLoggingLevel,
        path: Utf8PathBuf,
        if_exists: ConfigLoggingIfExists,
    },
}

impl Default for ConfigLogging {
    fn default() -> Self {
        ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum ConfigLoggingIfExists {
    #[serde(rename = "fail")]
    Fail,
    #[serde(rename = "truncate")]
    Truncate,
    #[serde(rename = "append")]
    Append,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLoggingLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl From<ConfigLoggingLevel> for Level {
    fn from(config_level: ConfigLoggingLevel) -> Level {
        match config_level {
            ConfigLoggingLevel::Trace => Level::Trace,
            ConfigLoggingLevel::Debug => Level::Debug,
            ConfigLoggingLevel::Info => Level::Info,
            ConfigLoggingLevel::Warn => Level::Warning,
            ConfigLoggingLevel::Error => Level::Error,
            ConfigLoggingLevel::Critical => Level::Critical,
        }
    }
}

impl ConfigLogging {
    /// Overrides the configured level, e.g. from the command line.
    pub fn with_level(mut self, new_level: ConfigLoggingLevel) -> Self {
        match &mut self {
            ConfigLogging::StderrTerminal { level }
            | ConfigLogging::File { level, .. } => *level = new_level,
        }
        self
    }

    pub fn to_logger(
        &self,
        name: &'static str,
    ) -> Result<Logger, LogInitError> {
        match self {
            ConfigLogging::StderrTerminal { level } => {
                let decorator = slog_term::TermDecorator::new().build();
                let drain =
                    slog_term::FullFormat::new(decorator).build().fuse();
                Ok(async_root_logger(*level, drain))
            }

            ConfigLogging::File { level, path, if_exists } => {
                let mut open_options = OpenOptions::new();
                open_options.write(true);
                open_options.create(true);
                match if_exists {
                    ConfigLoggingIfExists::Fail => {
                        open_options.create_new(true);
                    }
                    ConfigLoggingIfExists::Append => {
                        open_options.append(true);
                    }
                    ConfigLoggingIfExists::Truncate => {
                        open_options.truncate(true);
                    }
                }
                let drain = log_drain_for_file(&open_options, path, name)?;
                Ok(async_root_logger(*level, drain))
            }
        }
    }
}

fn async_root_logger<T>(level: ConfigLoggingLevel, drain: T) -> Logger
where
    T: Drain + Send + 'static,
    <T as Drain>::Err: std::fmt::Debug,
{
    let level_drain = slog::LevelFilter(drain, Level::from(level)).fuse();
    let async_drain = slog_async::Async::new(level_drain).build().fuse();
    Logger::root(async_drain, o!(FileKv))
}

fn log_drain_for_file(
    open_options: &OpenOptions,
    path: &Utf8Path,
    name: &'static str,
) -> Result<
    impl Drain<Ok = (), Err = slog::Never> + Send + 'static,
    LogInitError,
> {
    if let Some(parent) = path.parent() {
        if !parent.as_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|err| LogInitError {
                path: path.to_owned(),
                err,
            })?;
        }
    }
    let file = open_options
        .open(path)
        .map_err(|err| LogInitError { path: path.to_owned(), err })?;

    // Tell the operator where the rest of the output went.
    eprintln!("note: configured to log to \"{path}\"");
    Ok(slog_bunyan::with_name(name, file).build().fuse())
}
