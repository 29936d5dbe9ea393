//! SSH agent for bwagent.
//!
//! Serves keys held in a shared [`Keyring`] over the standard OpenSSH agent
//! protocol on a Unix socket.
//!
//! # Architecture
//!
//! ```text
//! bwagentd ─────── Keyring (Arc<RwLock<…>>) ───────► SshAgent
//!  │                   ▲                                │
//!  │   vault fetch     │                          AgentSocket::serve
//!  └──────── parse_private_key() → LoadedKey            │
//!                                                per-connection task
//!                                            (SshAgent clone, same keyring)
//!
//!  CloseHandle ──── watch<bool> ────► accept loop stops
//! ```

pub mod keyring;
pub mod listener;
pub mod pem;
pub mod session;

pub use keyring::{Keyring, LoadedKey, SharedKeyring};
pub use listener::{AgentSocket, BindError, CloseHandle};
pub use pem::parse_private_key;
pub use session::SshAgent;

/// Why raw bytes could not become a usable [`LoadedKey`].
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key payload is empty")]
    Empty,

    #[error("key payload is not text")]
    NotText,

    #[error("cannot parse private key: {0}")]
    Parse(#[source] ssh_key::Error),

    #[error("cannot decode {format} private key: {reason}")]
    Decode { format: &'static str, reason: String },

    #[error("unsupported key type: {0}")]
    Unsupported(String),

    #[error("invalid RSA key: {0}")]
    Rsa(#[source] rsa::Error),

    #[error("private key is passphrase-protected")]
    Encrypted,
}
