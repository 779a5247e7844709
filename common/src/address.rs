// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Validation of the operator-supplied addressing: the virtual entry address,
//! its network mask, the interface it floats on, and node hostnames.
//!
//! All of these are checked before any node is contacted.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Longest hostname label accepted (RFC 1123).
pub const MAX_HOSTNAME_LEN: usize = 63;

/// Longest interface name accepted (`IFNAMSIZ` minus the trailing NUL).
pub const MAX_INTERFACE_LEN: usize = 15;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error(
        "invalid virtual IP address {0:?}: expected a dotted-quad IPv4 address"
    )]
    VirtualIp(String),

    #[error(
        "invalid network mask {0:?}: expected a prefix length from 0 to 32"
    )]
    Mask(String),

    #[error("invalid network interface name {0:?}")]
    Interface(String),

    #[error("invalid node hostname {0:?}")]
    Hostname(String),

    #[error("no node hostnames provided")]
    EmptyNodeList,
}

/// Parses a dotted-quad IPv4 address.
pub fn parse_virtual_ip(s: &str) -> Result<Ipv4Addr, InputError> {
    s.parse().map_err(|_| InputError::VirtualIp(s.to_string()))
}

/// Parses a network prefix length in `0..=32`.
pub fn parse_mask(s: &str) -> Result<u8, InputError> {
    match s.parse::<u8>() {
        Ok(mask) if mask <= 32 => Ok(mask),
        _ => Err(InputError::Mask(s.to_string())),
    }
}

/// Validates a network interface name: 1 to 15 characters of
/// `[A-Za-z0-9_-]`.
pub fn validate_interface(s: &str) -> Result<String, InputError> {
    let valid = !s.is_empty()
        && s.len() <= MAX_INTERFACE_LEN
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(s.to_string())
    } else {
        Err(InputError::Interface(s.to_string()))
    }
}

/// Validates a single-label hostname.
///
/// Node names are used as SSH host aliases and embedded in certificate
/// subjects, so we accept only one RFC 1123 label: 1 to 63 characters of
/// `[A-Za-z0-9-]`, neither starting nor ending with a hyphen.  Dotted names
/// are rejected; use an ssh_config alias for fully qualified hosts.
pub fn validate_hostname(s: &str) -> Result<String, InputError> {
    let valid = !s.is_empty()
        && s.len() <= MAX_HOSTNAME_LEN
        && !s.starts_with('-')
        && !s.ends_with('-')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(s.to_string())
    } else {
        Err(InputError::Hostname(s.to_string()))
    }
}

/// Parses a list of hostnames separated by commas and/or spaces.
pub fn parse_node_list(s: &str) -> Result<Vec<String>, InputError> {
    let nodes = s
        .split(|c: char| c == ',' || c.is_ascii_whitespace())
        .filter(|node| !node.is_empty())
        .map(validate_hostname)
        .collect::<Result<Vec<_>, _>>()?;
    if nodes.is_empty() {
        return Err(InputError::EmptyNodeList);
    }
    Ok(nodes)
}

/// The floating entry address of the routing tier and the network it lives
/// in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualNetwork {
    ip: Ipv4Addr,
    network: Ipv4Network,
}

impl VirtualNetwork {
    pub fn new(ip: Ipv4Addr, prefix: u8) -> Result<Self, InputError> {
        let network = Ipv4Network::new(ip, prefix)
            .map_err(|_| InputError::Mask(prefix.to_string()))?;
        Ok(Self { ip, network })
    }

    /// The virtual IP address itself.
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn prefix(&self) -> u8 {
        self.network.prefix()
    }

    /// The network address, i.e. the virtual IP with the host bits cleared.
    pub fn network_address(&self) -> Ipv4Addr {
        self.network.network()
    }
}
