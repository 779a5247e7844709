// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster-wide random secrets.

use crate::CredentialError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::SecretString;

/// Raw bytes behind the storage tier's administrative password.
const STORAGE_ROOT_SECRET_BYTES: usize = 16;
/// Characters in the application's database password.
const DATABASE_SECRET_LEN: usize = 12;
/// Raw bytes behind the application's session-signing key.
const SESSION_KEY_BYTES: usize = 42;

const LOWERCASE: &[u8; 26] = b"abcdefghijklmnopqrstuvwxyz";

/// The shared secrets of one deployment run.
///
/// `Debug` output is redacted by `SecretString`.
#[derive(Debug)]
pub struct SharedSecrets {
    /// Administrative password of the storage tier (base64).
    pub storage_root: SecretString,
    /// Password the application uses to reach the storage tier through the
    /// routers (lowercase letters, typed by operators).
    pub database: SecretString,
    /// Session-signing key of the application (base64).
    pub session_key: SecretString,
}

impl SharedSecrets {
    /// Draws every secret from the operating system's CSPRNG.
    pub fn generate() -> Result<Self, CredentialError> {
        Self::generate_with(&mut OsRng)
    }

    fn generate_with<R: RngCore>(rng: &mut R) -> Result<Self, CredentialError> {
        Ok(Self {
            storage_root: random_base64(rng, STORAGE_ROOT_SECRET_BYTES)?,
            database: random_lowercase(rng, DATABASE_SECRET_LEN)?,
            session_key: random_base64(rng, SESSION_KEY_BYTES)?,
        })
    }
}

fn random_base64<R: RngCore>(
    rng: &mut R,
    len: usize,
) -> Result<SecretString, CredentialError> {
    let mut bytes = vec![0u8; len];
    rng.try_fill_bytes(&mut bytes).map_err(CredentialError::Entropy)?;
    let encoded = STANDARD.encode(&bytes);
    bytes.fill(0);
    Ok(SecretString::from(encoded))
}

fn random_lowercase<R: RngCore>(
    rng: &mut R,
    len: usize,
) -> Result<SecretString, CredentialError> {
    // Rejection sampling keeps the distribution uniform: 234 is the largest
    // multiple of 26 that fits in a byte.
    const LIMIT: u8 = 234;
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 32];
    while out.len() < len {
        rng.try_fill_bytes(&mut buf).map_err(CredentialError::Entropy)?;
        for b in buf.iter().copied().filter(|b| *b < LIMIT) {
            if out.len() == len {
                break;
            }
            out.push(char::from(LOWERCASE[usize::from(b % 26)]));
        }
    }
    buf.fill(0);
    Ok(SecretString::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use secrecy::ExposeSecret;

    #[test]
    fn secrets_have_expected_shape() {
        let secrets = SharedSecrets::generate().unwrap();

        let root =
            STANDARD.decode(secrets.storage_root.expose_secret()).unwrap();
        assert_eq!(root.len(), STORAGE_ROOT_SECRET_BYTES);

        let db = secrets.database.expose_secret();
        assert_eq!(db.len(), DATABASE_SECRET_LEN);
        assert!(db.bytes().all(|b| b.is_ascii_lowercase()));

        let key = STANDARD.decode(secrets.session_key.expose_secret()).unwrap();
        assert_eq!(key.len(), SESSION_KEY_BYTES);
    }

    #[test]
    fn secrets_differ_between_runs() {
        let a = SharedSecrets::generate().unwrap();
        let b = SharedSecrets::generate().unwrap();
        assert_ne!(
            a.storage_root.expose_secret(),
            b.storage_root.expose_secret()
        );
        assert_ne!(
            a.session_key.expose_secret(),
            b.session_key.expose_secret()
        );
    }

    #[test]
    fn debug_is_redacted() {
        let secrets = SharedSecrets::generate().unwrap();
        let shown = format!("{secrets:?}");
        assert!(!shown.contains(secrets.database.expose_secret()));
    }

    struct BrokenRng;

    impl RngCore for BrokenRng {
        fn next_u32(&mut self) -> u32 {
            unimplemented!()
        }
        fn next_u64(&mut self) -> u64 {
            unimplemented!()
        }
        fn fill_bytes(&mut self, _: &mut [u8]) {
            unimplemented!()
        }
        fn try_fill_bytes(&mut self, _: &mut [u8]) -> Result<(), rand::Error> {
            Err(rand::Error::new(std::io::Error::other("no entropy")))
        }
    }

    #[test]
    fn entropy_failure_is_fatal() {
        assert_matches!(
            SharedSecrets::generate_with(&mut BrokenRng),
            Err(CredentialError::Entropy(_))
        );
    }
}
