// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The credential authority for one deployment run.
//!
//! Every run generates a fresh self-signed root, one leaf certificate per
//! (node, identity) pair signed by that root, and the cluster's shared random
//! secrets.  Nothing here touches the network and nothing is persisted: a
//! failed run is simply re-run, regenerating everything.

mod authority;
mod secrets;
mod set;

pub use authority::issue_root;
pub use authority::LeafCredential;
pub use authority::RootAuthority;
pub use authority::VALIDITY_DAYS;
pub use secrets::SharedSecrets;
pub use set::CredentialSet;
pub use set::Identity;
pub use set::IdentityRequest;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to generate private key")]
    KeyGeneration(#[source] openssl::error::ErrorStack),

    #[error("failed to build certificate for {subject:?}")]
    Certificate {
        subject: String,
        #[source]
        err: openssl::error::ErrorStack,
    },

    #[error("failed to build certificate signing request for {subject:?}")]
    SigningRequest {
        subject: String,
        #[source]
        err: openssl::error::ErrorStack,
    },

    #[error("failed to encode {what} as PEM")]
    Encoding {
        what: &'static str,
        #[source]
        err: openssl::error::ErrorStack,
    },

    #[error("failed to read from the system random number generator")]
    Entropy(#[source] rand::Error),

    #[error("subject {0:?} requested more than once")]
    DuplicateSubject(String),

    #[error("common name must not be empty")]
    EmptyCommonName,
}
