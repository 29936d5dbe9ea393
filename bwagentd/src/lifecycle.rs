//! Single-instance enforcement.
//!
//! The running daemon is recorded in a marker file: pid on the first line,
//! socket path on the second, `starting` or `ready` on the third.  Every
//! invocation consults it:
//!
//! - `--kill`: signal the recorded pid, or fail if nothing is running.
//! - marker present, pid alive and ready: print the coordinates, do nothing else.
//! - marker present, pid alive but still starting: wait for it to become ready.
//! - otherwise: the caller starts a new instance.  It claims the marker before
//!   binding the socket, so concurrent launches settle on one winner, and
//!   flips it to ready once the key is loaded.
//!
//! Process liveness and signalling go through [`ProcessControl`] so the
//! decision logic can be tested without real processes.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write as _};
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("no running agent found (marker {0})")]
    NoInstance(PathBuf),

    #[error("failed to signal agent pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("another agent claimed {0} first")]
    AlreadyClaimed(PathBuf),

    #[error("marker {path}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to detach: {0}")]
    Detach(#[source] io::Error),

    #[error("agent exited during startup ({0})")]
    StartupFailed(String),

    #[error("agent did not become ready within {0}s")]
    StartupTimeout(u64),
}

/// Where clients find the running agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coordinates {
    pub socket_path: PathBuf,
    pub pid: u32,
}

/// Shell-evaluable form, as `ssh-agent` prints it.
impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "SSH_AUTH_SOCK={}; export SSH_AUTH_SOCK;",
            self.socket_path.display()
        )?;
        writeln!(f, "SSH_AGENT_PID={}; export SSH_AGENT_PID;", self.pid)
    }
}

pub trait ProcessControl: Send + Sync {
    fn current_pid(&self) -> u32;
    fn is_alive(&self, pid: u32) -> bool;
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// Real processes via `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixProcesses;

impl ProcessControl for UnixProcesses {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs permission and existence checks only.
        let ret = unsafe { libc::kill(pid, 0) };
        // EPERM: alive, but owned by someone else.
        ret == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;
        // SAFETY: plain kill(2) on a positive pid; never a process group.
        if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

const STATE_STARTING: &str = "starting";
const STATE_READY: &str = "ready";

/// Contents of the marker file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerRecord {
    pub pid: u32,
    pub socket_path: Option<PathBuf>,
    /// False between claiming the marker and loading the key.  Markers
    /// without a state line are treated as ready.
    pub ready: bool,
}

impl MarkerRecord {
    fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let pid = lines.next()?.trim().parse().ok()?;
        let socket_path = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from);
        let ready = lines.next().map(str::trim) != Some(STATE_STARTING);
        Some(Self {
            pid,
            socket_path,
            ready,
        })
    }

    fn render(&self) -> String {
        let socket = self
            .socket_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let state = if self.ready { STATE_READY } else { STATE_STARTING };
        format!("{}\n{socket}\n{state}\n", self.pid)
    }
}

/// Read the marker at `path`.  Missing or unparseable markers are `None`.
pub fn read_marker(path: &Path) -> Result<Option<MarkerRecord>, LifecycleError> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let record = MarkerRecord::parse(&text);
            if record.is_none() {
                debug!(path = %path.display(), "ignoring malformed marker");
            }
            Ok(record)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(LifecycleError::Marker {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Held by the running instance; removes the marker on drop if it is still ours.
#[derive(Debug)]
pub struct MarkerGuard {
    path: PathBuf,
    record: MarkerRecord,
}

impl MarkerGuard {
    /// Rewrite the marker as ready.
    ///
    /// The new record goes to a sibling file that is renamed over the marker,
    /// so a concurrent reader sees either the old record or the new one.
    pub fn mark_ready(&mut self) -> Result<(), LifecycleError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let record = MarkerRecord {
            ready: true,
            ..self.record.clone()
        };
        remove_if_present(&tmp)
            .and_then(|()| write_new(&tmp, &record))
            .and_then(|()| std::fs::rename(&tmp, &self.path))
            .map_err(|source| LifecycleError::Marker {
                path: self.path.clone(),
                source,
            })?;

        self.record = record;
        debug!(path = %self.path.display(), pid = self.record.pid, "marker ready");
        Ok(())
    }
}

impl Drop for MarkerGuard {
    fn drop(&mut self) {
        match read_marker(&self.path) {
            Ok(Some(record)) if record.pid == self.record.pid => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), "failed to remove marker: {e}");
                } else {
                    debug!(path = %self.path.display(), "marker removed");
                }
            }
            _ => debug!(path = %self.path.display(), "marker no longer ours, leaving it"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Attach to the running agent or start one.
    Run,
    /// Terminate the running agent.
    Kill,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    /// `--kill` delivered SIGTERM to this pid.
    Signalled(u32),
    /// An agent is already serving.
    AlreadyRunning(Coordinates),
    /// An agent with this pid has claimed the marker but is not serving yet.
    Starting(u32),
    /// Nothing is running; the caller should start the agent.
    Start,
}

#[derive(Debug)]
pub struct Lifecycle<P> {
    marker_path: PathBuf,
    socket_path: PathBuf,
    procs: P,
}

impl<P: ProcessControl> Lifecycle<P> {
    pub fn new(marker_path: impl Into<PathBuf>, socket_path: impl Into<PathBuf>, procs: P) -> Self {
        Self {
            marker_path: marker_path.into(),
            socket_path: socket_path.into(),
            procs,
        }
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The live instance recorded in the marker, if any.  Never modifies the marker.
    pub fn find_running(&self) -> Result<Option<MarkerRecord>, LifecycleError> {
        Ok(read_marker(&self.marker_path)?.filter(|r| self.procs.is_alive(r.pid)))
    }

    pub fn decide(&self, mode: Mode) -> Result<Decision, LifecycleError> {
        let running = self.find_running()?;
        match (mode, running) {
            (Mode::Kill, None) => Err(LifecycleError::NoInstance(self.marker_path.clone())),
            (Mode::Kill, Some(record)) => {
                self.procs
                    .terminate(record.pid)
                    .map_err(|source| LifecycleError::Signal {
                        pid: record.pid,
                        source,
                    })?;
                info!(pid = record.pid, "sent SIGTERM to running agent");
                Ok(Decision::Signalled(record.pid))
            }
            (Mode::Run, Some(record)) if record.ready => {
                Ok(Decision::AlreadyRunning(self.coordinates_of(&record)))
            }
            (Mode::Run, Some(record)) => Ok(Decision::Starting(record.pid)),
            (Mode::Run, None) => Ok(Decision::Start),
        }
    }

    pub fn coordinates_of(&self, record: &MarkerRecord) -> Coordinates {
        Coordinates {
            socket_path: record
                .socket_path
                .clone()
                .unwrap_or_else(|| self.socket_path.clone()),
            pid: record.pid,
        }
    }

    pub fn own_coordinates(&self) -> Coordinates {
        Coordinates {
            socket_path: self.socket_path.clone(),
            pid: self.procs.current_pid(),
        }
    }

    /// Record this process as the starting instance.
    ///
    /// A marker left by a dead process is replaced; one held by a live
    /// process is [`LifecycleError::AlreadyClaimed`].  Call
    /// [`MarkerGuard::mark_ready`] once the agent can serve.
    pub fn claim(&self) -> Result<MarkerGuard, LifecycleError> {
        if let Some(stale) = read_marker(&self.marker_path)?
            && !self.procs.is_alive(stale.pid)
        {
            debug!(pid = stale.pid, "removing stale marker");
            remove_if_present(&self.marker_path).map_err(|source| self.marker_err(source))?;
        }

        let pid = self.procs.current_pid();
        let record = MarkerRecord {
            pid,
            socket_path: Some(self.socket_path.clone()),
            ready: false,
        };

        match write_new(&self.marker_path, &record) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LifecycleError::AlreadyClaimed(self.marker_path.clone()));
            }
            Err(source) => return Err(self.marker_err(source)),
        }

        debug!(path = %self.marker_path.display(), pid, "marker claimed");
        Ok(MarkerGuard {
            path: self.marker_path.clone(),
            record,
        })
    }

    fn marker_err(&self, source: io::Error) -> LifecycleError {
        LifecycleError::Marker {
            path: self.marker_path.clone(),
            source,
        }
    }
}

/// Create `path` (which must not exist) readable by the owner only.
fn write_new(path: &Path, record: &MarkerRecord) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(record.render().as_bytes())?;
    file.sync_all()
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
