//! Per-connection agent protocol handler.

use std::io;

use ssh_agent_lib::agent::Session;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{Identity, SignRequest};
use ssh_key::{HashAlg, Signature};
use tracing::{debug, warn};

use crate::keyring::SharedKeyring;

/// Cloned by `ssh_agent_lib` for every accepted connection; all clones share
/// one keyring.
///
/// Only listing and signing are answered.  Add/remove/lock and extension
/// requests fall through to the library's default failure reply, so nothing
/// a client sends can change the loaded keys.
#[derive(Clone, Debug)]
pub struct SshAgent {
    keyring: SharedKeyring,
}

impl SshAgent {
    pub fn new(keyring: SharedKeyring) -> Self {
        Self { keyring }
    }
}

fn failure(msg: impl Into<String>) -> AgentError {
    AgentError::other(io::Error::other(msg.into()))
}

#[ssh_agent_lib::async_trait]
impl Session for SshAgent {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        let keyring = self.keyring.read().map_err(|_| failure("keyring poisoned"))?;
        let identities = keyring
            .iter()
            .map(|key| Identity {
                pubkey: key.public_key_data().clone(),
                comment: key.comment().to_string(),
            })
            .collect::<Vec<_>>();
        debug!(count = identities.len(), "listed identities");
        Ok(identities)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        let wanted = request.pubkey.fingerprint(HashAlg::Sha256).to_string();
        let keyring = self.keyring.read().map_err(|_| failure("keyring poisoned"))?;
        let Some(key) = keyring.find(&wanted) else {
            debug!(fingerprint = %wanted, "sign request for unknown key");
            return Err(failure("no such key"));
        };

        debug!(
            fingerprint = %wanted,
            comment = key.comment(),
            bytes = request.data.len(),
            flags = request.flags,
            "signing"
        );
        key.sign(&request.data, request.flags).map_err(|e| {
            warn!(fingerprint = %wanted, "signing failed: {e}");
            failure(format!("signing failed: {e}"))
        })
    }
}
