//! The agent's keyring: every private key loaded from the vault, in load order.
//!
//! Shared between the daemon (which adds keys) and every agent connection
//! (which lists and signs) as a [`SharedKeyring`].  Writers hold the lock only
//! for the insert, never across a vault fetch.

use std::sync::{Arc, RwLock};

use rsa::BigUint;
use rsa::pkcs1v15::SigningKey;
use sha2::{Sha256, Sha512};
use signature::{SignatureEncoding as _, Signer as _};
use ssh_agent_lib::proto::signature::RSA_SHA2_256;
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::{Algorithm, HashAlg, PrivateKey, Signature, public::KeyData};
use tracing::debug;

use crate::KeyError;

pub type SharedKeyring = Arc<RwLock<Keyring>>;

/// A decrypted private key and the name it is advertised under.
pub struct LoadedKey {
    comment: String,
    fingerprint: String,
    private_key: PrivateKey,
    /// RSA keys sign through the `rsa` crate so the client's hash choice is
    /// honoured.
    rsa: Option<rsa::RsaPrivateKey>,
}

impl LoadedKey {
    /// Fails for a passphrase-protected key, which could never sign, and for
    /// key types the agent cannot sign with.
    pub fn new(private_key: PrivateKey, comment: impl Into<String>) -> Result<Self, KeyError> {
        if private_key.is_encrypted() {
            return Err(KeyError::Encrypted);
        }
        let rsa = match private_key.key_data() {
            KeypairData::Rsa(keypair) => Some(rsa_private_key(keypair)?),
            KeypairData::Ed25519(_) | KeypairData::Ecdsa(_) => None,
            _ => {
                return Err(KeyError::Unsupported(
                    private_key.algorithm().as_str().to_string(),
                ));
            }
        };
        Ok(Self {
            comment: comment.into(),
            fingerprint: private_key.fingerprint(HashAlg::Sha256).to_string(),
            private_key,
            rsa,
        })
    }

    /// Sign `data` for an agent client.
    ///
    /// `flags` only matters for RSA: `SSH_AGENT_RSA_SHA2_256` selects
    /// `rsa-sha2-256`, anything else gets `rsa-sha2-512`.  SHA-1 `ssh-rsa`
    /// signatures are never produced.
    pub fn sign(&self, data: &[u8], flags: u32) -> signature::Result<Signature> {
        let Some(key) = &self.rsa else {
            return self.private_key.try_sign(data);
        };
        let (hash, bytes) = if flags & RSA_SHA2_256 != 0 {
            let signer = SigningKey::<Sha256>::new(key.clone());
            (HashAlg::Sha256, signer.try_sign(data)?.to_vec())
        } else {
            let signer = SigningKey::<Sha512>::new(key.clone());
            (HashAlg::Sha512, signer.try_sign(data)?.to_vec())
        };
        Signature::new(Algorithm::Rsa { hash: Some(hash) }, bytes)
            .map_err(|_| signature::Error::new())
    }

    /// Vault item name.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// `SHA256:...` form, as printed by `ssh-add -l`.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn public_key_data(&self) -> &KeyData {
        self.private_key.public_key().key_data()
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }
}

/// Rebuild the `rsa` crate key from all of its OpenSSH components.
fn rsa_private_key(keypair: &RsaKeypair) -> Result<rsa::RsaPrivateKey, KeyError> {
    let uint = |mpint: &ssh_key::Mpint| BigUint::try_from(mpint).map_err(KeyError::Parse);
    rsa::RsaPrivateKey::from_components(
        uint(&keypair.public.n)?,
        uint(&keypair.public.e)?,
        uint(&keypair.private.d)?,
        vec![uint(&keypair.private.p)?, uint(&keypair.private.q)?],
    )
    .map_err(KeyError::Rsa)
}

impl std::fmt::Debug for LoadedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedKey")
            .field("comment", &self.comment)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Keys in the order they were added, at most one per fingerprint.
#[derive(Debug, Default)]
pub struct Keyring {
    keys: Vec<LoadedKey>,
}

impl Keyring {
    pub fn shared() -> SharedKeyring {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Add `key` unless the same key material is already present.
    ///
    /// Returns `false` for a duplicate; the earlier entry and its comment win.
    pub fn add(&mut self, key: LoadedKey) -> bool {
        if self.find(key.fingerprint()).is_some() {
            debug!(fingerprint = %key.fingerprint, comment = %key.comment, "key already loaded");
            return false;
        }
        debug!(fingerprint = %key.fingerprint, comment = %key.comment, "keyring: key added");
        self.keys.push(key);
        true
    }

    pub fn find(&self, fingerprint: &str) -> Option<&LoadedKey> {
        self.keys.iter().find(|k| k.fingerprint == fingerprint)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LoadedKey> {
        self.keys.iter()
    }

    pub fn fingerprints(&self) -> Vec<String> {
        self.keys.iter().map(|k| k.fingerprint.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
