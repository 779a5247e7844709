// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::authority::{issue_root, LeafCredential, RootAuthority};
use crate::secrets::SharedSecrets;
use crate::CredentialError;
use slog::{debug, info, Logger};
use std::collections::BTreeSet;
use std::fmt;

/// The role a leaf certificate plays on its node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Identity {
    /// Database server on a storage node.
    Storage,
    /// Router on a routing node.
    Routing,
    /// TLS endpoint of the application, served on the virtual IP.
    ApplicationGateway,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Storage => f.write_str("storage"),
            Identity::Routing => f.write_str("routing"),
            Identity::ApplicationGateway => f.write_str("application-gateway"),
        }
    }
}

/// One leaf certificate to issue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityRequest {
    pub node: String,
    pub identity: Identity,
    pub common_name: String,
}

#[derive(Debug)]
struct IssuedIdentity {
    node: String,
    identity: Identity,
    credential: LeafCredential,
}

/// Everything the credential stage produces.  Immutable once issued and
/// shared read-only by every per-node task.
#[derive(Debug)]
pub struct CredentialSet {
    root: RootAuthority,
    leaves: Vec<IssuedIdentity>,
    secrets: SharedSecrets,
}

impl CredentialSet {
    /// Issues the root, one leaf per request (in request order), and the
    /// shared secrets.  Any failure discards everything generated so far.
    pub fn issue(
        log: &Logger,
        root_common_name: &str,
        requests: &[IdentityRequest],
    ) -> Result<Self, CredentialError> {
        let mut subjects = BTreeSet::new();
        subjects.insert(root_common_name);
        for request in requests {
            if !subjects.insert(request.common_name.as_str()) {
                return Err(CredentialError::DuplicateSubject(
                    request.common_name.clone(),
                ));
            }
        }

        let root = issue_root(root_common_name)?;
        info!(log, "issued root certificate"; "subject" => root_common_name);

        let mut leaves = Vec::with_capacity(requests.len());
        for request in requests {
            let credential = root.issue_leaf(&request.common_name)?;
            debug!(log, "issued leaf certificate";
                "node" => &request.node,
                "identity" => %request.identity,
                "subject" => &request.common_name,
            );
            leaves.push(IssuedIdentity {
                node: request.node.clone(),
                identity: request.identity,
                credential,
            });
        }

        let secrets = SharedSecrets::generate()?;
        info!(log, "credential set ready"; "leaf_certificates" => leaves.len());
        Ok(Self { root, leaves, secrets })
    }

    pub fn root(&self) -> &RootAuthority {
        &self.root
    }

    pub fn secrets(&self) -> &SharedSecrets {
        &self.secrets
    }

    pub fn leaf(
        &self,
        node: &str,
        identity: Identity,
    ) -> Option<&LeafCredential> {
        self.leaves
            .iter()
            .find(|l| l.node == node && l.identity == identity)
            .map(|l| &l.credential)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Every leaf as `(node, identity, credential)`, in issue order.
    pub fn leaves(
        &self,
    ) -> impl Iterator<Item = (&str, Identity, &LeafCredential)> + '_ {
        self.leaves
            .iter()
            .map(|l| (l.node.as_str(), l.identity, &l.credential))
    }

    /// The chain trusted by the storage and routing tiers: every storage
    /// leaf certificate, then the root.
    pub fn ca_chain_pem(&self) -> Result<String, CredentialError> {
        let mut chain = String::new();
        let storage =
            self.leaves.iter().filter(|l| l.identity == Identity::Storage);
        for leaf in storage {
            chain.push_str(&leaf.credential.certificate_pem()?);
        }
        chain.push_str(&self.root.certificate_pem()?);
        Ok(chain)
    }
}
