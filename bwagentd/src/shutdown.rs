//! Shutdown coordination.
//!
//! Termination requests arrive as [`ShutdownEvent`]s on an mpsc channel.  The
//! OS signal pump ([`forward_os_signals`]) is the production producer; tests
//! push events directly.  The first interrupt only warns, so a stray Ctrl-C in
//! a foreground session does not drop every loaded key.  A second interrupt or
//! any terminate closes the agent listener.

use std::io;

use bwagent_ssh::CloseHandle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownEvent {
    /// SIGINT: warn first, act on the second.
    Interrupt,
    /// SIGTERM: act immediately.
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Idle,
    WarnedOnce,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Ignore,
    Warn,
    Shutdown,
}

impl ShutdownState {
    /// Pure transition function.
    pub fn next(self, event: ShutdownEvent) -> (Self, Action) {
        use ShutdownEvent::*;
        use ShutdownState::*;
        match (self, event) {
            (ShuttingDown, _) => (ShuttingDown, Action::Ignore),
            (Idle, Interrupt) => (WarnedOnce, Action::Warn),
            (WarnedOnce, Interrupt) | (_, Terminate) => (ShuttingDown, Action::Shutdown),
        }
    }
}

/// Applies [`ShutdownState::next`] and closes the listener on shutdown.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: ShutdownState,
    close: CloseHandle,
}

impl ShutdownCoordinator {
    pub fn new(close: CloseHandle) -> Self {
        Self {
            state: ShutdownState::Idle,
            close,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ShutdownState {
        self.state
    }

    pub fn handle(&mut self, event: ShutdownEvent) -> Action {
        let (state, action) = self.state.next(event);
        self.state = state;
        match action {
            Action::Warn => {
                warn!("interrupt received; interrupt again (or send SIGTERM) to stop the agent");
            }
            Action::Shutdown => {
                info!(?event, "shutting down SSH agent");
                self.close.close();
            }
            Action::Ignore => debug!(?event, "already shutting down"),
        }
        action
    }

    /// Consume events until shutdown, then notify `done`.
    ///
    /// If every sender goes away first the listener is left open and `done`
    /// is dropped unsent.
    pub async fn run(mut self, mut events: mpsc::Receiver<ShutdownEvent>, done: oneshot::Sender<()>) {
        while let Some(event) = events.recv().await {
            if self.handle(event) == Action::Shutdown {
                let _ = done.send(());
                return;
            }
        }
        debug!("shutdown event channel closed");
    }
}

/// Forward SIGINT and SIGTERM into `tx` until the receiver is dropped.
///
/// Handlers are registered before this returns, so a signal arriving right
/// after the call is not lost.
pub fn forward_os_signals(tx: mpsc::Sender<ShutdownEvent>) -> io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(()) = sigint.recv() => ShutdownEvent::Interrupt,
                Some(()) = sigterm.recv() => ShutdownEvent::Terminate,
                else => break,
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    }))
}
