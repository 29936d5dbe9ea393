//! Agent socket: bind, serve, close.
//!
//! [`AgentSocket::bind`] creates the Unix socket and restricts it to the owning
//! user.  [`AgentSocket::serve`] runs the `ssh_agent_lib` accept loop, which
//! spawns one task per connection, until the paired [`CloseHandle`] fires.
//! Closing stops accepting; connections already handed to their own task keep
//! running until the peer hangs up.

use std::io;
use std::os::unix::fs::{FileTypeExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ssh_agent_lib::agent::listen;
use ssh_agent_lib::error::AgentError;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::session::SshAgent;

/// Mode applied to the socket path right after bind.
pub const SOCKET_MODE: u32 = 0o700;

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("socket {0} is already served by another process")]
    InUse(PathBuf),

    #[error("bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("chmod {mode:o} {path}: {source}")]
    Permissions {
        path: PathBuf,
        mode: u32,
        #[source]
        source: io::Error,
    },
}

/// Closes the listener paired with it.  Cheap to clone; closing is idempotent
/// and permanent.
#[derive(Clone, Debug)]
pub struct CloseHandle(Arc<watch::Sender<bool>>);

impl CloseHandle {
    /// A fresh handle and the receiver that [`AgentSocket::serve`] waits on.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self(Arc::new(tx)), rx)
    }

    pub fn close(&self) {
        // send_replace stores the value even when no receiver is alive yet.
        if !self.0.send_replace(true) {
            debug!("agent listener close requested");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }
}

/// A bound agent socket.  The socket file is removed on drop.
#[derive(Debug)]
pub struct AgentSocket {
    listener: Option<UnixListener>,
    path: PathBuf,
}

impl AgentSocket {
    /// Bind `path` and restrict it to [`SOCKET_MODE`].
    ///
    /// An existing socket at `path` is connected to first.  If something
    /// accepts, the path is in use; if the connection is refused, it is a
    /// leftover from a dead process and is removed.  Anything else, including
    /// a non-socket file, is left in place and reported.
    pub fn bind(path: &Path) -> Result<Self, BindError> {
        Self::bind_with(path, |p| {
            std::fs::set_permissions(p, std::fs::Permissions::from_mode(SOCKET_MODE))
        })
    }

    fn bind_with(
        path: &Path,
        restrict: impl FnOnce(&Path) -> io::Result<()>,
    ) -> Result<Self, BindError> {
        clear_stale(path)?;

        let listener = UnixListener::bind(path).map_err(|source| BindError::Bind {
            path: path.to_path_buf(),
            source,
        })?;

        // Dropping `socket` on the error path closes the listener and unlinks it.
        let socket = Self {
            listener: Some(listener),
            path: path.to_path_buf(),
        };
        restrict(path).map_err(|source| BindError::Permissions {
            path: path.to_path_buf(),
            mode: SOCKET_MODE,
            source,
        })?;

        debug!(path = %path.display(), "agent socket bound");
        Ok(socket)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept and serve connections until `closed` turns true.
    ///
    /// A close is a normal return.  An `Err` means the accept loop itself
    /// failed; per-connection protocol errors are logged by `ssh_agent_lib`
    /// and never reach here.
    pub async fn serve(
        mut self,
        agent: SshAgent,
        mut closed: watch::Receiver<bool>,
    ) -> Result<(), AgentError> {
        let Some(listener) = self.listener.take() else {
            return Ok(());
        };
        info!(path = %self.path.display(), "SSH agent listening");

        tokio::select! {
            biased;
            // A dropped sender means the owning server is gone: stop as well.
            _ = closed.wait_for(|c| *c) => {
                info!(path = %self.path.display(), "SSH agent listener closed");
                Ok(())
            }
            res = listen(listener, agent) => res,
        }
    }
}

impl Drop for AgentSocket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), "failed to remove agent socket: {e}");
        }
    }
}

fn clear_stale(path: &Path) -> Result<(), BindError> {
    clear_stale_with(path, |p| std::os::unix::net::UnixStream::connect(p).map(drop))
}

fn clear_stale_with(
    path: &Path,
    connect: impl FnOnce(&Path) -> io::Result<()>,
) -> Result<(), BindError> {
    let bind_error = |source| BindError::Bind {
        path: path.to_path_buf(),
        source,
    };
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(bind_error(e)),
    };
    if !meta.file_type().is_socket() {
        return Err(bind_error(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a socket",
        )));
    }

    match connect(path) {
        Ok(()) => Err(BindError::InUse(path.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            debug!(path = %path.display(), "removing stale agent socket");
            std::fs::remove_file(path).map_err(bind_error)
        }
        Err(e) => {
            warn!(path = %path.display(), "cannot tell whether agent socket is live: {e}");
            Err(bind_error(e))
        }
    }
}
