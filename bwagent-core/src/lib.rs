//! Shared types for bwagent.
//!
//! Defines the [`SecretSource`] seam between the SSH agent daemon and whatever
//! vault actually stores the key material, plus the value types that cross it.
//! Credentials and raw secret bytes are held in [`Zeroizing`] buffers and are
//! redacted from `Debug` output.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub mod config;

/// Name of the environment variable holding the vault session credential.
pub const DEFAULT_SESSION_ENV: &str = "BW_SESSION";

/// Opaque vault session credential.
///
/// This type intentionally does NOT implement `Serialize`: the token must never
/// be written to logs, config files, or disk.
#[derive(Clone)]
pub struct SessionToken(Zeroizing<String>);

impl SessionToken {
    /// Wrap a token, rejecting empty values.
    pub fn new(token: impl Into<String>) -> Result<Self, SourceError> {
        let token = Zeroizing::new(token.into());
        if token.trim().is_empty() {
            return Err(SourceError::MissingSession);
        }
        Ok(Self(token))
    }

    /// Read the token from the environment variable `var`.
    ///
    /// An unset variable and an empty one are both [`SourceError::MissingSession`].
    pub fn from_env(var: &str) -> Result<Self, SourceError> {
        match std::env::var(var) {
            Ok(v) => Self::new(v),
            Err(_) => Err(SourceError::MissingSession),
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionToken([redacted])")
    }
}

/// Raw secret payload, scrubbed on drop.
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes([redacted; {} bytes])", self.0.len())
    }
}

/// A vault folder: the container that scopes which items are eligible keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
}

/// A named field on a vault item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Field {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

/// An attachment on a vault item.  Only the identifier is needed to fetch it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// A vault item as listed within a folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("vault session credential is missing or empty")]
    MissingSession,

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("malformed vault response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Source of raw key material.
///
/// Implementations talk to an external vault; every call carries the session
/// credential so the source itself holds no authentication state.
#[async_trait::async_trait]
pub trait SecretSource: Send + Sync + std::fmt::Debug {
    /// Folders whose name matches `search`.
    async fn list_folders(
        &self,
        session: &SessionToken,
        search: &str,
    ) -> Result<Vec<Folder>, SourceError>;

    /// Items stored in the folder `folder_id`.
    async fn list_items(
        &self,
        session: &SessionToken,
        folder_id: &str,
    ) -> Result<Vec<VaultItem>, SourceError>;

    /// Raw bytes of one attachment.
    async fn get_attachment(
        &self,
        session: &SessionToken,
        item_id: &str,
        attachment_id: &str,
    ) -> Result<SecretBytes, SourceError>;
}
