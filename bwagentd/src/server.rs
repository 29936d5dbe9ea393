//! The agent server: vault folder, keyring, and socket in one owned value.
//!
//! ## Lifecycle
//!
//! 1. [`AgentServer::new`] resolves the vault folder.  Exactly one folder must
//!    match; nothing is bound and no item is fetched otherwise.
//! 2. [`AgentServer::open`] binds the socket (mode 0700).
//! 3. [`AgentServer::add_key`] pulls the first attachment of the first item in
//!    the folder into the keyring.  Safe to call again later.
//! 4. [`AgentServer::start`] serves until [`AgentServer::close`] (or a clone of
//!    [`AgentServer::close_handle`]) fires.  Closing is permanent.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bwagent_core::{SecretSource, SessionToken, SourceError};
use bwagent_ssh::{
    AgentSocket, BindError, CloseHandle, KeyError, Keyring, LoadedKey, SharedKeyring, SshAgent,
};
use ssh_agent_lib::error::AgentError;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("expected exactly one vault folder matching {name:?}, found {count}")]
    FolderCount { name: String, count: usize },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("vault folder {0} has no items")]
    NoItems(String),

    #[error("vault item {0:?} has no attachments")]
    NoAttachment(String),

    #[error("vault item {item:?}: {source}")]
    Key {
        item: String,
        #[source]
        source: KeyError,
    },

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("agent server is closed")]
    Closed,

    #[error("agent socket is not open")]
    NotOpen,

    #[error("keyring lock poisoned")]
    Poisoned,

    #[error("agent listener failed: {0}")]
    Serve(#[source] AgentError),
}

pub struct AgentServer {
    source: Arc<dyn SecretSource>,
    session: SessionToken,
    folder_id: String,
    socket_path: PathBuf,
    keyring: SharedKeyring,
    socket: Option<AgentSocket>,
    close: CloseHandle,
    closed: watch::Receiver<bool>,
}

impl std::fmt::Debug for AgentServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentServer")
            .field("folder_id", &self.folder_id)
            .field("socket_path", &self.socket_path)
            .field("open", &self.socket.is_some())
            .field("closed", &self.close.is_closed())
            .finish_non_exhaustive()
    }
}

impl AgentServer {
    /// Resolve the folder named `folder` and build an unopened server.
    pub async fn new(
        source: Arc<dyn SecretSource>,
        session: SessionToken,
        folder: &str,
        socket_path: impl Into<PathBuf>,
    ) -> Result<Self, ServerError> {
        let folders = source.list_folders(&session, folder).await?;
        let [found] = folders.as_slice() else {
            return Err(ServerError::FolderCount {
                name: folder.to_string(),
                count: folders.len(),
            });
        };
        debug!(folder, folder_id = %found.id, "resolved key folder");

        let (close, closed) = CloseHandle::new();
        Ok(Self {
            source,
            session,
            folder_id: found.id.clone(),
            socket_path: socket_path.into(),
            keyring: Keyring::shared(),
            socket: None,
            close,
            closed,
        })
    }

    /// Bind the agent socket.  A second call on an open server is a no-op.
    pub fn open(&mut self) -> Result<(), ServerError> {
        if self.close.is_closed() {
            return Err(ServerError::Closed);
        }
        if self.socket.is_none() {
            self.socket = Some(AgentSocket::bind(&self.socket_path)?);
        }
        Ok(())
    }

    /// Fetch one key from the vault folder and add it to the keyring.
    ///
    /// Returns the key's fingerprint; a key already loaded is not added twice.
    /// On any failure the keyring is left exactly as it was.
    pub async fn add_key(&self) -> Result<String, ServerError> {
        let items = self.source.list_items(&self.session, &self.folder_id).await?;
        let item = items
            .first()
            .ok_or_else(|| ServerError::NoItems(self.folder_id.clone()))?;
        let attachment = item
            .attachments
            .first()
            .ok_or_else(|| ServerError::NoAttachment(item.name.clone()))?;

        let raw = self
            .source
            .get_attachment(&self.session, &item.id, &attachment.id)
            .await?;
        let key_err = |source| ServerError::Key {
            item: item.name.clone(),
            source,
        };
        let private_key = bwagent_ssh::parse_private_key(raw.as_slice()).map_err(key_err)?;
        let key = LoadedKey::new(private_key, item.name.clone()).map_err(key_err)?;
        let fingerprint = key.fingerprint().to_string();

        let added = self
            .keyring
            .write()
            .map_err(|_| ServerError::Poisoned)?
            .add(key);
        if added {
            info!(fingerprint = %fingerprint, item = %item.name, "loaded SSH key");
        }
        Ok(fingerprint)
    }

    /// Serve connections until closed.  Returns `Ok` on close.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if self.close.is_closed() {
            self.socket = None;
            return Ok(());
        }
        let socket = self.socket.take().ok_or(ServerError::NotOpen)?;
        let agent = SshAgent::new(Arc::clone(&self.keyring));
        socket
            .serve(agent, self.closed.clone())
            .await
            .map_err(ServerError::Serve)
    }

    /// Stop accepting.  Connections already accepted run to completion.
    pub fn close(&self) {
        self.close.close();
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn key_count(&self) -> Result<usize, ServerError> {
        Ok(self.keyring.read().map_err(|_| ServerError::Poisoned)?.len())
    }

    pub fn fingerprints(&self) -> Result<Vec<String>, ServerError> {
        Ok(self
            .keyring
            .read()
            .map_err(|_| ServerError::Poisoned)?
            .fingerprints())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bwagent_core::{Attachment, Folder, SecretBytes, VaultItem};
    use ssh_agent_lib::agent::Session as _;
    use ssh_agent_lib::client::Client;
    use ssh_agent_lib::proto::SignRequest;
    use ssh_key::PrivateKey;
    use tokio::net::UnixStream;

    pub(crate) const KEY_A: &str = include_str!("../testdata/id_ed25519_a");
    const KEY_RSA: &str = include_str!("../testdata/id_rsa");
    const KEY_ECDSA: &str = include_str!("../testdata/id_ecdsa");

    /// In-memory vault with call counters.
    #[derive(Debug, Default)]
    pub(crate) struct FakeVault {
        pub folders: Vec<Folder>,
        pub items: Mutex<Vec<VaultItem>>,
        pub attachments: Mutex<HashMap<String, Vec<u8>>>,
        pub fail_items: bool,
        pub item_calls: AtomicUsize,
    }

    impl FakeVault {
        pub(crate) fn with_folders(names: &[&str]) -> Self {
            Self {
                folders: names
                    .iter()
                    .enumerate()
                    .map(|(i, n)| Folder {
                        id: format!("folder-{i}"),
                        name: n.to_string(),
                    })
                    .collect(),
                ..Self::default()
            }
        }

        /// One folder holding one item with one attachment of `bytes`.
        pub(crate) fn with_key(bytes: &[u8]) -> Self {
            let vault = Self::with_folders(&["ssh-agent"]);
            vault.push_item("item-0", "laptop", Some(bytes));
            vault
        }

        pub(crate) fn push_item(&self, id: &str, name: &str, attachment: Option<&[u8]>) {
            let mut attachments = Vec::new();
            if let Some(bytes) = attachment {
                let att_id = format!("{id}-att");
                self.attachments
                    .lock()
                    .unwrap()
                    .insert(att_id.clone(), bytes.to_vec());
                attachments.push(Attachment {
                    id: att_id,
                    file_name: Some("id_ed25519".into()),
                    url: None,
                });
            }
            // New items go first: add_key always takes the first one.
            self.items.lock().unwrap().insert(
                0,
                VaultItem {
                    id: id.to_string(),
                    name: name.to_string(),
                    fields: Vec::new(),
                    attachments,
                },
            );
        }
    }

    #[async_trait::async_trait]
    impl SecretSource for FakeVault {
        async fn list_folders(
            &self,
            _session: &SessionToken,
            _search: &str,
        ) -> Result<Vec<Folder>, SourceError> {
            Ok(self.folders.clone())
        }

        async fn list_items(
            &self,
            _session: &SessionToken,
            _folder_id: &str,
        ) -> Result<Vec<VaultItem>, SourceError> {
            self.item_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_items {
                return Err(SourceError::Other("vault unreachable".into()));
            }
            Ok(self.items.lock().unwrap().clone())
        }

        async fn get_attachment(
            &self,
            _session: &SessionToken,
            _item_id: &str,
            attachment_id: &str,
        ) -> Result<SecretBytes, SourceError> {
            self.attachments
                .lock()
                .unwrap()
                .get(attachment_id)
                .cloned()
                .map(SecretBytes::new)
                .ok_or_else(|| SourceError::Other("no such attachment".into()))
        }
    }

    pub(crate) fn session() -> SessionToken {
        SessionToken::new("test-session").unwrap()
    }

    pub(crate) async fn server_for(vault: FakeVault, dir: &tempfile::TempDir) -> AgentServer {
        AgentServer::new(
            Arc::new(vault),
            session(),
            "ssh-agent",
            dir.path().join("agent.sock"),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn folder_must_match_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        for names in [&[][..], &["ssh-agent", "ssh-agent-old"][..]] {
            let vault = Arc::new(FakeVault::with_folders(names));
            let err = AgentServer::new(
                vault.clone(),
                session(),
                "ssh-agent",
                dir.path().join("agent.sock"),
            )
            .await
            .unwrap_err();

            assert!(
                matches!(err, ServerError::FolderCount { count, .. } if count == names.len())
            );
            assert_eq!(vault.item_calls.load(Ordering::SeqCst), 0);
            assert!(!dir.path().join("agent.sock").exists());
        }
    }

    #[tokio::test]
    async fn add_key_loads_exactly_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_for(FakeVault::with_key(KEY_A.as_bytes()), &dir).await;

        let fingerprint = server.add_key().await.unwrap();

        let expected = PrivateKey::from_openssh(KEY_A)
            .unwrap()
            .public_key()
            .fingerprint(ssh_key::HashAlg::Sha256)
            .to_string();
        assert_eq!(fingerprint, expected);
        assert_eq!(server.key_count().unwrap(), 1);
        assert_eq!(server.fingerprints().unwrap(), vec![expected]);
    }

    #[tokio::test]
    async fn add_key_twice_keeps_earlier_keys() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(FakeVault::with_key(KEY_A.as_bytes()));
        let server = AgentServer::new(
            vault.clone(),
            session(),
            "ssh-agent",
            dir.path().join("agent.sock"),
        )
        .await
        .unwrap();

        let first = server.add_key().await.unwrap();
        vault.push_item(
            "item-1",
            "desktop",
            Some(include_bytes!("../testdata/id_ed25519_b")),
        );
        let second = server.add_key().await.unwrap();

        assert_ne!(first, second);
        let mut listed = server.fingerprints().unwrap();
        listed.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn reloading_same_key_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_for(FakeVault::with_key(KEY_A.as_bytes()), &dir).await;

        let first = server.add_key().await.unwrap();
        let second = server.add_key().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(server.key_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_folder_fails_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_for(FakeVault::with_folders(&["ssh-agent"]), &dir).await;
        assert!(matches!(server.add_key().await, Err(ServerError::NoItems(_))));
        assert_eq!(server.key_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn item_without_attachment_fails() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FakeVault::with_folders(&["ssh-agent"]);
        vault.push_item("item-0", "notes only", None);
        let server = server_for(vault, &dir).await;
        assert!(matches!(
            server.add_key().await,
            Err(ServerError::NoAttachment(name)) if name == "notes only"
        ));
        assert_eq!(server.key_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn unparseable_attachment_fails_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_for(FakeVault::with_key(b"definitely not a key"), &dir).await;
        assert!(matches!(
            server.add_key().await,
            Err(ServerError::Key { .. })
        ));
        assert_eq!(server.key_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn fetch_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = FakeVault::with_key(KEY_A.as_bytes());
        vault.fail_items = true;
        let server = server_for(vault, &dir).await;
        assert!(matches!(
            server.add_key().await,
            Err(ServerError::Source(SourceError::Other(_)))
        ));
        assert_eq!(server.key_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn open_fails_when_path_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let _other = tokio::net::UnixListener::bind(dir.path().join("agent.sock")).unwrap();
        let mut server = server_for(FakeVault::with_key(KEY_A.as_bytes()), &dir).await;
        assert!(matches!(
            server.open(),
            Err(ServerError::Bind(BindError::InUse(_)))
        ));
    }

    #[tokio::test]
    async fn start_without_open_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server_for(FakeVault::with_key(KEY_A.as_bytes()), &dir).await;
        assert!(matches!(server.start().await, Err(ServerError::NotOpen)));
    }

    #[tokio::test]
    async fn closed_server_cannot_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server_for(FakeVault::with_key(KEY_A.as_bytes()), &dir).await;
        server.open().unwrap();
        server.close();
        // start returns at once and releases the socket.
        server.start().await.unwrap();
        assert!(!server.socket_path().exists());
        assert!(matches!(server.open(), Err(ServerError::Closed)));
    }

    #[tokio::test]
    async fn concurrent_clients_list_and_sign() {
        use ssh_agent_lib::proto::signature::{RSA_SHA2_256, RSA_SHA2_512};

        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(FakeVault::with_key(KEY_A.as_bytes()));
        let mut server = AgentServer::new(
            vault.clone(),
            session(),
            "ssh-agent",
            dir.path().join("agent.sock"),
        )
        .await
        .unwrap();
        server.open().unwrap();
        server.add_key().await.unwrap();
        vault.push_item("item-rsa", "build box", Some(KEY_RSA.as_bytes()));
        server.add_key().await.unwrap();
        vault.push_item("item-ecdsa", "router", Some(KEY_ECDSA.as_bytes()));
        server.add_key().await.unwrap();
        assert_eq!(server.key_count().unwrap(), 3);

        let path = server.socket_path().to_path_buf();
        let close = server.close_handle();
        let serving = tokio::spawn(async move { server.start().await });

        let publics: Vec<_> = [KEY_A, KEY_RSA, KEY_ECDSA]
            .iter()
            .map(|pem| PrivateKey::from_openssh(pem).unwrap().public_key().clone())
            .collect();
        let mut clients = Vec::new();
        for n in 0..18u8 {
            let path = path.clone();
            let publics = publics.clone();
            clients.push(tokio::spawn(async move {
                let mut client = Client::new(UnixStream::connect(&path).await.unwrap());
                let ids = client.request_identities().await.unwrap();
                let listed: Vec<_> = ids.iter().map(|id| id.pubkey.clone()).collect();
                let expected: Vec<_> = publics.iter().map(|p| p.key_data().clone()).collect();
                assert_eq!(listed, expected);

                let public = &publics[usize::from(n) % publics.len()];
                let flags = if n % 2 == 0 { RSA_SHA2_256 } else { RSA_SHA2_512 };
                let data = vec![n; 32];
                let signature = client
                    .sign(SignRequest {
                        pubkey: public.key_data().clone(),
                        data: data.clone(),
                        flags,
                    })
                    .await
                    .unwrap();
                signature::Verifier::verify(public, &data, &signature).unwrap();
            }));
        }
        for c in clients {
            c.await.unwrap();
        }

        close.close();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn poisoned_keyring_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_for(FakeVault::with_key(KEY_A.as_bytes()), &dir).await;
        let keyring = Arc::clone(&server.keyring);
        let _ = std::thread::spawn(move || {
            let _held = keyring.write().unwrap();
            panic!("writer died holding the keyring");
        })
        .join();

        assert!(matches!(server.key_count(), Err(ServerError::Poisoned)));
        assert!(matches!(server.fingerprints(), Err(ServerError::Poisoned)));
        assert!(matches!(server.add_key().await, Err(ServerError::Poisoned)));
    }

    #[tokio::test]
    async fn close_leaves_accepted_connections_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server_for(FakeVault::with_key(KEY_A.as_bytes()), &dir).await;
        server.open().unwrap();
        server.add_key().await.unwrap();
        let path = server.socket_path().to_path_buf();
        let close = server.close_handle();
        let serving = tokio::spawn(async move { server.start().await });

        let mut client = Client::new(UnixStream::connect(&path).await.unwrap());
        assert_eq!(client.request_identities().await.unwrap().len(), 1);

        close.close();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // New connections are refused, the existing one still answers.
        assert!(UnixStream::connect(&path).await.is_err());
        assert_eq!(client.request_identities().await.unwrap().len(), 1);
    }
}
