// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Just enough of ssh_config(5) to turn a host alias into an address, a user,
//! a port and identity files.
//!
//! Supported: `Host` blocks with `*`/`?` wildcards and `!` negation,
//! case-insensitive keywords, `key value` and `key=value` forms, quoted
//! values, and `~` / `%h` / `%%` expansion.  As in ssh, the first value
//! obtained for a keyword wins, except `IdentityFile` which accumulates.
//! `Match` blocks are skipped.

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};

#[derive(Debug)]
struct HostPattern {
    negated: bool,
    pattern: Pattern,
}

#[derive(Debug)]
struct Block {
    /// `None` for options that precede the first `Host` line (they apply to
    /// every host) and for `Match` blocks, which never apply.
    patterns: Option<Vec<HostPattern>>,
    matchable: bool,
    options: Vec<(String, String)>,
}

impl Block {
    fn matches(&self, host: &str) -> bool {
        if !self.matchable {
            return false;
        }
        let Some(patterns) = &self.patterns else {
            return true;
        };
        let opts = MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        let mut matched = false;
        for p in patterns {
            if p.pattern.matches_with(host, opts) {
                if p.negated {
                    return false;
                }
                matched = true;
            }
        }
        matched
    }
}

/// A parsed ssh client configuration.
#[derive(Debug, Default)]
pub struct SshConfig {
    blocks: Vec<Block>,
}

/// What the configuration says about one host alias.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedHost {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_files: Vec<Utf8PathBuf>,
}

impl SshConfig {
    pub fn parse(text: &str) -> Self {
        let mut blocks = vec![Block {
            patterns: None,
            matchable: true,
            options: Vec::new(),
        }];
        for line in text.lines() {
            let Some((key, value)) = split_line(line) else {
                continue;
            };
            match key.as_str() {
                "host" => blocks.push(Block {
                    patterns: Some(parse_patterns(&value)),
                    matchable: true,
                    options: Vec::new(),
                }),
                "match" => blocks.push(Block {
                    patterns: None,
                    matchable: false,
                    options: Vec::new(),
                }),
                _ => {
                    if let Some(block) = blocks.last_mut() {
                        block.options.push((key, unquote(&value)));
                    }
                }
            }
        }
        Self { blocks }
    }

    /// Reads and parses `path`.  A missing file is an empty configuration.
    pub async fn load(path: &Utf8Path) -> std::io::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Self::parse(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            Err(err) => Err(err),
        }
    }

    pub fn resolve(&self, host: &str) -> ResolvedHost {
        let home = std::env::var("HOME").ok();
        let mut resolved = ResolvedHost::default();
        for block in self.blocks.iter().filter(|b| b.matches(host)) {
            for (key, value) in &block.options {
                let value = expand(value, host, home.as_deref());
                match key.as_str() {
                    "hostname" if resolved.hostname.is_none() => {
                        resolved.hostname = Some(value);
                    }
                    "user" if resolved.user.is_none() => {
                        resolved.user = Some(value);
                    }
                    "port" if resolved.port.is_none() => {
                        resolved.port = value.parse().ok();
                    }
                    "identityfile" => {
                        resolved.identity_files.push(Utf8PathBuf::from(value));
                    }
                    _ => {}
                }
            }
        }
        resolved
    }
}

/// Splits a config line into a lowercased keyword and its raw value.
fn split_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let split_at = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let (key, rest) = line.split_at(split_at);
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
    if rest.is_empty() {
        return None;
    }
    Some((key.to_ascii_lowercase(), rest.to_string()))
}

fn parse_patterns(value: &str) -> Vec<HostPattern> {
    value
        .split_whitespace()
        .map(unquote)
        .filter_map(|raw| {
            let (negated, raw) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest.to_string()),
                None => (false, raw),
            };
            Pattern::new(&raw)
                .ok()
                .map(|pattern| HostPattern { negated, pattern })
        })
        .collect()
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

fn expand(value: &str, host: &str, home: Option<&str>) -> String {
    let value = match (value.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => {
            format!("{}/{rest}", home.trim_end_matches('/'))
        }
        _ => value.to_string(),
    };
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push_str(host),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
# global defaults
ConnectTimeout 5

Host mysql? !mysql9
    HostName %h.cluster.internal
    User deploy
    IdentityFile ~/.ssh/cluster_ed25519

Host mgmt1
    Hostname=10.0.0.21
    Port = 2222
    IdentityFile "/keys/mgmt key"

Match host *.example
    HostName never-used

Host *
    User fallback
    IdentityFile ~/.ssh/id_ed25519
    Port 22
"#;

    fn config() -> SshConfig {
        SshConfig::parse(CONFIG)
    }

    #[test]
    fn wildcard_block_resolves_alias() {
        let home = std::env::var("HOME").unwrap_or_default();
        let resolved = config().resolve("mysql1");
        assert_eq!(
            resolved.hostname.as_deref(),
            Some("mysql1.cluster.internal")
        );
        assert_eq!(resolved.user.as_deref(), Some("deploy"));
        assert_eq!(resolved.port, Some(22));
        if !home.is_empty() {
            assert_eq!(
                resolved.identity_files[0],
                Utf8PathBuf::from(format!(
                    "{}/.ssh/cluster_ed25519",
                    home.trim_end_matches('/')
                ))
            );
        }
        assert_eq!(resolved.identity_files.len(), 2);
    }

    #[test]
    fn negated_pattern_excludes_host() {
        let resolved = config().resolve("mysql9");
        assert_eq!(resolved.hostname, None);
        assert_eq!(resolved.user.as_deref(), Some("fallback"));
    }

    #[test]
    fn equals_form_and_quotes() {
        let resolved = config().resolve("MGMT1");
        assert_eq!(resolved.hostname.as_deref(), Some("10.0.0.21"));
        assert_eq!(resolved.port, Some(2222));
        assert_eq!(resolved.user.as_deref(), Some("fallback"));
        assert_eq!(resolved.identity_files[0], "/keys/mgmt key");
    }

    #[test]
    fn unknown_host_has_no_hostname() {
        let resolved = config().resolve("stranger.example");
        assert_eq!(resolved.hostname, None);
        assert_eq!(resolved.user.as_deref(), Some("fallback"));
    }

    #[test]
    fn token_expansion() {
        assert_eq!(expand("%h-%%-%x", "n1", None), "n1-%-%x");
        assert_eq!(expand("~/k", "n1", Some("/home/u/")), "/home/u/k");
        assert_eq!(expand("~/k", "n1", None), "~/k");
    }

    #[tokio::test]
    async fn missing_file_is_empty_config() {
        let dir = camino_tempfile::tempdir().unwrap();
        let config = SshConfig::load(&dir.path().join("config")).await.unwrap();
        assert_eq!(config.resolve("anything"), ResolvedHost::default());
    }
}
