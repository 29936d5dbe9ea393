//! Bitwarden CLI secret source.
//!
//! Drives the official `bw` command-line client to list folders and items and
//! to download raw attachments.  The CLI must already be logged in and
//! unlocked; the session key it printed on unlock is passed to every
//! invocation through the `BW_SESSION` environment variable of the child
//! process, never on the command line where other users could read it from
//! the process table.

use std::path::PathBuf;
use std::process::Stdio;

use bwagent_core::{Folder, SecretBytes, SecretSource, SessionToken, SourceError, VaultItem};
use tokio::process::Command;
use tracing::debug;
use zeroize::Zeroizing;

/// [`SecretSource`] backed by the `bw` binary.
#[derive(Debug, Clone)]
pub struct BwCli {
    binary: PathBuf,
}

impl BwCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run `bw <args…>` and return its stdout.
    async fn run(
        &self,
        session: &SessionToken,
        args: &[&str],
    ) -> Result<Zeroizing<Vec<u8>>, SourceError> {
        let program = self.binary.display().to_string();
        // Subcommand only.
        let command = format!("{program} {}", args[..args.len().min(2)].join(" "));
        debug!(%command, "running vault CLI");

        let output = Command::new(&self.binary)
            .args(args)
            .env("BW_SESSION", session.expose())
            .env("BW_NOINTERACTION", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SourceError::Spawn { program, source })?;

        let stdout = Zeroizing::new(output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SourceError::Command {
                command,
                status: output.status.to_string(),
                stderr,
            });
        }
        Ok(stdout)
    }
}

impl Default for BwCli {
    fn default() -> Self {
        Self::new("bw")
    }
}

#[async_trait::async_trait]
impl SecretSource for BwCli {
    async fn list_folders(
        &self,
        session: &SessionToken,
        search: &str,
    ) -> Result<Vec<Folder>, SourceError> {
        let out = self
            .run(session, &["list", "folders", "--search", search])
            .await?;
        let folders: Vec<Folder> = serde_json::from_slice(&out)?;
        debug!(search, count = folders.len(), "listed folders");
        Ok(folders)
    }

    async fn list_items(
        &self,
        session: &SessionToken,
        folder_id: &str,
    ) -> Result<Vec<VaultItem>, SourceError> {
        let out = self
            .run(session, &["list", "items", "--folderid", folder_id])
            .await?;
        let items: Vec<VaultItem> = serde_json::from_slice(&out)?;
        debug!(folder_id, count = items.len(), "listed items");
        Ok(items)
    }

    async fn get_attachment(
        &self,
        session: &SessionToken,
        item_id: &str,
        attachment_id: &str,
    ) -> Result<SecretBytes, SourceError> {
        let mut out = self
            .run(
                session,
                &["get", "attachment", attachment_id, "--itemid", item_id, "--raw"],
            )
            .await?;
        Ok(SecretBytes::new(std::mem::take(&mut *out)))
    }
}
