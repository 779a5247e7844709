// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Root and leaf certificate issuance.
//!
//! Certificates carry a single common-name attribute and no extensions.  Keys
//! are Ed25519, which signs without a separate digest, hence
//! `MessageDigest::null()` throughout.

use crate::CredentialError;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Name, X509NameBuilder, X509Req, X509ReqBuilder, X509};
use secrecy::SecretString;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const VALIDITY_DAYS: i64 = 365;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// The run's self-signed root.  Its private key never leaves this process.
pub struct RootAuthority {
    common_name: String,
    key: PKey<Private>,
    certificate: X509,
}

/// A key, its signing request, and the certificate the root issued for it.
pub struct LeafCredential {
    common_name: String,
    key: PKey<Private>,
    csr: X509Req,
    certificate: X509,
}

/// Generates a fresh key and a self-signed root certificate for it.
pub fn issue_root(common_name: &str) -> Result<RootAuthority, CredentialError> {
    let key = generate_key()?;
    let subject = common_name_to_x509(common_name)?;
    let certificate = build_certificate(&subject, &subject, &key, &key)
        .map_err(|err| CredentialError::Certificate {
            subject: common_name.to_string(),
            err,
        })?;
    Ok(RootAuthority { common_name: common_name.to_string(), key, certificate })
}

impl RootAuthority {
    /// Generates a leaf key and CSR for `common_name` and signs it.
    pub fn issue_leaf(
        &self,
        common_name: &str,
    ) -> Result<LeafCredential, CredentialError> {
        let key = generate_key()?;
        let subject = common_name_to_x509(common_name)?;
        let csr = build_csr(&subject, &key).map_err(|err| {
            CredentialError::SigningRequest {
                subject: common_name.to_string(),
                err,
            }
        })?;
        let certificate = csr
            .public_key()
            .and_then(|public| {
                build_certificate(
                    csr.subject_name(),
                    self.certificate.subject_name(),
                    &public,
                    &self.key,
                )
            })
            .map_err(|err| CredentialError::Certificate {
                subject: common_name.to_string(),
                err,
            })?;
        Ok(LeafCredential {
            common_name: common_name.to_string(),
            key,
            csr,
            certificate,
        })
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn certificate_pem(&self) -> Result<String, CredentialError> {
        certificate_pem(&self.certificate)
    }
}

impl fmt::Debug for RootAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootAuthority")
            .field("common_name", &self.common_name)
            .finish_non_exhaustive()
    }
}

impl LeafCredential {
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn csr(&self) -> &X509Req {
        &self.csr
    }

    pub fn certificate_pem(&self) -> Result<String, CredentialError> {
        certificate_pem(&self.certificate)
    }

    /// The private key as unencrypted PKCS#8 PEM.
    pub fn private_key_pem(&self) -> Result<SecretString, CredentialError> {
        let pem = self.key.private_key_to_pem_pkcs8().map_err(|err| {
            CredentialError::Encoding { what: "private key", err }
        })?;
        Ok(SecretString::from(String::from_utf8_lossy(&pem).into_owned()))
    }

    pub fn csr_pem(&self) -> Result<String, CredentialError> {
        let pem = self.csr.to_pem().map_err(|err| {
            CredentialError::Encoding { what: "signing request", err }
        })?;
        Ok(String::from_utf8_lossy(&pem).into_owned())
    }
}

impl fmt::Debug for LeafCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafCredential")
            .field("common_name", &self.common_name)
            .finish_non_exhaustive()
    }
}

fn certificate_pem(certificate: &X509) -> Result<String, CredentialError> {
    let pem = certificate
        .to_pem()
        .map_err(|err| CredentialError::Encoding { what: "certificate", err })?;
    Ok(String::from_utf8_lossy(&pem).into_owned())
}

fn generate_key() -> Result<PKey<Private>, CredentialError> {
    PKey::generate_ed25519().map_err(CredentialError::KeyGeneration)
}

fn common_name_to_x509(common_name: &str) -> Result<X509Name, CredentialError> {
    if common_name.is_empty() {
        return Err(CredentialError::EmptyCommonName);
    }
    let build = || -> Result<X509Name, openssl::error::ErrorStack> {
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        Ok(name.build())
    };
    build().map_err(|err| CredentialError::Certificate {
        subject: common_name.to_string(),
        err,
    })
}

fn build_csr(
    subject: &openssl::x509::X509NameRef,
    key: &PKey<Private>,
) -> Result<X509Req, openssl::error::ErrorStack> {
    let mut builder = X509ReqBuilder::new()?;
    builder.set_subject_name(subject)?;
    builder.set_pubkey(key)?;
    builder.sign(key, MessageDigest::null())?;
    Ok(builder.build())
}

fn build_certificate<T: openssl::pkey::HasPublic>(
    subject: &openssl::x509::X509NameRef,
    issuer: &openssl::x509::X509NameRef,
    public: &openssl::pkey::PKeyRef<T>,
    signer: &PKey<Private>,
) -> Result<X509, openssl::error::ErrorStack> {
    // Both bounds come from one clock read so the window is exactly
    // VALIDITY_DAYS long.
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    let not_before = Asn1Time::from_unix(now)?;
    let not_after = Asn1Time::from_unix(
        now.saturating_add(VALIDITY_DAYS * SECONDS_PER_DAY),
    )?;

    let mut serial = BigNum::new()?;
    serial.rand(159, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(subject)?;
    builder.set_issuer_name(issuer)?;
    builder.set_pubkey(public)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.sign(signer, MessageDigest::null())?;
    Ok(builder.build())
}
