//! Leaving the controlling terminal.
//!
//! A multithreaded tokio process cannot safely `fork(2)`, so the daemon
//! re-executes itself instead: the launching process spawns a copy of the
//! binary with [`DETACHED_ENV`] set and waits for the marker to turn ready.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt as _;
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::lifecycle::{Lifecycle, LifecycleError, MarkerRecord, ProcessControl};

/// Set in the environment of the re-executed daemon.
pub const DETACHED_ENV: &str = "BWAGENT_DETACHED";

const READY_POLL: Duration = Duration::from_millis(100);

/// A daemon process started by [`Detach::detach`], seen from its launcher.
pub trait SpawnedDaemon: Send {
    fn pid(&self) -> u32;
    /// `Some` once the process has exited.
    fn try_exit(&mut self) -> io::Result<Option<ExitStatus>>;
}

impl SpawnedDaemon for Child {
    fn pid(&self) -> u32 {
        self.id()
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.try_wait()
    }
}

pub enum Detached {
    /// This process is the daemon.
    Child,
    /// This process launched the daemon and should report on it.
    Parent(Box<dyn SpawnedDaemon>),
}

impl std::fmt::Debug for Detached {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Child => f.write_str("Child"),
            Self::Parent(d) => f.debug_tuple("Parent").field(&d.pid()).finish(),
        }
    }
}

pub trait Detach {
    fn detach(&self) -> Result<Detached, LifecycleError>;
}

/// `--foreground`: stay attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDetach;

impl Detach for NoDetach {
    fn detach(&self) -> Result<Detached, LifecycleError> {
        Ok(Detached::Child)
    }
}

/// Re-execute the current binary in a new session.
#[derive(Debug, Clone, Default)]
pub struct ReexecDetach {
    /// Receives the daemon's stderr.  `None` discards it.
    pub log_file: Option<PathBuf>,
}

impl ReexecDetach {
    pub fn new(log_file: Option<PathBuf>) -> Self {
        Self { log_file }
    }

    /// True inside the re-executed daemon.
    pub fn is_detached_child() -> bool {
        std::env::var_os(DETACHED_ENV).is_some()
    }

    fn stderr_target(&self) -> io::Result<Stdio> {
        match &self.log_file {
            Some(path) => Ok(open_log(path)?.into()),
            None => Ok(Stdio::null()),
        }
    }
}

impl Detach for ReexecDetach {
    fn detach(&self) -> Result<Detached, LifecycleError> {
        if Self::is_detached_child() {
            return Ok(Detached::Child);
        }

        let exe = std::env::current_exe().map_err(LifecycleError::Detach)?;
        let mut cmd = Command::new(&exe);
        cmd.args(std::env::args_os().skip(1))
            .env(DETACHED_ENV, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(self.stderr_target().map_err(LifecycleError::Detach)?);

        // SAFETY: setsid and umask are async-signal-safe and touch no
        // allocator or lock state of the parent.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                libc::umask(0o027);
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(LifecycleError::Detach)?;
        info!(pid = child.id(), exe = %exe.display(), "spawned detached agent");
        Ok(Detached::Parent(Box::new(child)))
    }
}

fn open_log(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
}

/// Wait until a live agent's marker is ready and return its record.
///
/// `daemon` is the process this launcher spawned, if any.  Whichever process
/// becomes ready is accepted: when two launches race, the one that lost the
/// claim exits and its launcher attaches to the winner.  Fails with
/// [`LifecycleError::StartupFailed`] once no live process holds the marker and
/// the spawned daemon (if any) has exited, and with
/// [`LifecycleError::StartupTimeout`] once `timeout` has elapsed.
pub async fn wait_until_ready<P: ProcessControl>(
    lifecycle: &Lifecycle<P>,
    mut daemon: Option<&mut dyn SpawnedDaemon>,
    timeout: Duration,
) -> Result<MarkerRecord, LifecycleError> {
    let spawned = daemon.as_ref().map(|d| d.pid());
    let deadline = Instant::now() + timeout;
    loop {
        let running = lifecycle.find_running()?;
        if let Some(record) = &running
            && record.ready
        {
            if spawned.is_some_and(|pid| pid != record.pid) {
                info!(pid = record.pid, "attaching to agent started concurrently");
            } else {
                debug!(pid = record.pid, "agent reported ready");
            }
            return Ok(record.clone());
        }

        let exited = match daemon.as_mut() {
            Some(d) => match d.try_exit() {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                Err(e) => Some(e.to_string()),
            },
            None => None,
        };
        if let Some(status) = exited {
            if running.is_none() {
                return Err(LifecycleError::StartupFailed(status));
            }
            debug!(%status, "spawned agent exited; waiting on the marker holder");
            daemon = None;
        }
        if daemon.is_none() && running.is_none() {
            return Err(LifecycleError::StartupFailed(
                "no agent holds the marker".to_string(),
            ));
        }

        if Instant::now() >= deadline {
            return Err(LifecycleError::StartupTimeout(timeout.as_secs()));
        }
        tokio::time::sleep(READY_POLL).await;
    }
}
