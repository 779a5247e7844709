// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line arguments of `cluster-deploy`.

use crate::logging::ConfigLoggingLevel;
use crate::topology::{Deployment, Topology, TopologyError};
use camino::Utf8PathBuf;
use clap::Parser;
use cluster_common::address::{
    parse_mask, parse_node_list, parse_virtual_ip, validate_interface,
    InputError, VirtualNetwork,
};
use std::net::Ipv4Addr;

/// Comma- or space-separated hostnames, as one argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeList(pub Vec<String>);

fn parse_nodes(s: &str) -> Result<NodeList, InputError> {
    parse_node_list(s).map(NodeList)
}

/// Bootstraps a storage, routing and application cluster over ssh.
#[derive(Debug, Parser)]
#[command(version)]
pub struct DeployArgs {
    /// TOML configuration file; every setting has a default.
    #[clap(long)]
    pub config: Option<Utf8PathBuf>,

    /// Overrides the configured log level.
    #[clap(long, value_enum)]
    pub log_level: Option<ConfigLoggingLevel>,

    /// Floating entry address of the cluster.
    #[clap(value_parser = parse_virtual_ip)]
    pub virtual_ip: Ipv4Addr,

    /// Network interface the virtual IP is bound to on routing nodes.
    #[clap(value_parser = validate_interface)]
    pub interface: String,

    /// Prefix length of the virtual IP's network, 0 to 32.
    #[clap(value_parser = parse_mask)]
    pub mask: u8,

    /// Routing nodes; the first becomes PRIMARY and hosts the application.
    #[clap(value_parser = parse_nodes)]
    pub routing_nodes: NodeList,

    /// Storage nodes; the first becomes the replication primary.
    #[clap(value_parser = parse_nodes)]
    pub storage_nodes: NodeList,
}

impl DeployArgs {
    /// Cross-argument checks that individual parsers cannot make.
    pub fn deployment(&self) -> Result<Deployment, TopologyError> {
        let network = VirtualNetwork::new(self.virtual_ip, self.mask)?;
        let topology = Topology::new(
            self.storage_nodes.0.clone(),
            self.routing_nodes.0.clone(),
        )?;
        Ok(Deployment { network, interface: self.interface.clone(), topology })
    }
}
