mod detach;
mod harden;
mod lifecycle;
mod server;
mod shutdown;

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bwagent_bitwarden::BwCli;
use bwagent_core::config::{Config, default_config_path, load_config};
use bwagent_core::{SecretSource, SessionToken};
use clap::Parser;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::detach::{Detach, Detached, NoDetach, ReexecDetach, wait_until_ready};
use crate::lifecycle::{Decision, Lifecycle, Mode, ProcessControl, UnixProcesses};
use crate::server::AgentServer;
use crate::shutdown::{ShutdownCoordinator, forward_os_signals};

/// Environment variable holding the `tracing` filter directive.
const LOG_ENV: &str = "BWAGENT_LOG";

/// SSH agent serving a key stored as a Bitwarden vault attachment.
///
/// Prints shell commands that point `SSH_AUTH_SOCK` at the agent, whether it
/// was just started or was already running; use as `eval "$(bwagentd)"`.
#[derive(Debug, Parser)]
#[command(name = "bwagentd", version, about, long_about = None)]
struct Args {
    /// Terminate the running agent
    #[arg(short, long)]
    kill: bool,

    /// Config file [default: $XDG_CONFIG_HOME/bwagent/config.toml]
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Stay attached to the terminal instead of daemonizing
    #[arg(short, long, conflicts_with = "kill")]
    foreground: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> Result<()> {
    let config_path = args.config.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;

    let lifecycle = Lifecycle::new(
        config.agent.pid_file(),
        config.agent.socket_path(),
        UnixProcesses,
    );
    let mode = if args.kill { Mode::Kill } else { Mode::Run };
    let timeout = Duration::from_secs(config.agent.startup_timeout_secs);
    match lifecycle.decide(mode)? {
        Decision::Signalled(pid) => {
            print_stdout(&format!(
                "unset SSH_AUTH_SOCK;\nunset SSH_AGENT_PID;\necho Agent pid {pid} killed;\n"
            ))?;
            return Ok(());
        }
        Decision::AlreadyRunning(coords) => {
            info!(pid = coords.pid, "agent already running");
            print_stdout(&coords.to_string())?;
            return Ok(());
        }
        Decision::Starting(pid) => {
            info!(pid, "agent is starting, waiting for it");
            let record = wait_until_ready(&lifecycle, None, timeout)
                .await
                .context("waiting for agent")?;
            print_stdout(&lifecycle.coordinates_of(&record).to_string())?;
            return Ok(());
        }
        Decision::Start => {}
    }

    if harden::apply(&config.hardening).any_failed() {
        info!("continuing with partial process hardening");
    }

    // Read before detaching so a missing session fails in the invoking shell.
    let session = SessionToken::from_env(&config.agent.session_env)
        .with_context(|| format!("reading ${}", config.agent.session_env))?;

    let detacher: Box<dyn Detach> = if args.foreground {
        Box::new(NoDetach)
    } else {
        Box::new(ReexecDetach::new(config.log.file.clone()))
    };

    match detacher.detach()? {
        Detached::Parent(mut daemon) => {
            drop(session);
            let record = wait_until_ready(&lifecycle, Some(daemon.as_mut()), timeout)
                .await
                .context("starting agent")?;
            print_stdout(&lifecycle.coordinates_of(&record).to_string())
        }
        Detached::Child => run_daemon(&config, session, &lifecycle, args.foreground).await,
    }
}

/// Daemon body.
///
/// The marker is claimed first, so of two agents started together only one
/// gets past this point, and marked ready once the key is loaded.  Launchers
/// wait for the ready marker, whichever process wrote it.
async fn run_daemon<P: ProcessControl>(
    config: &Config,
    session: SessionToken,
    lifecycle: &Lifecycle<P>,
    print_coordinates: bool,
) -> Result<()> {
    let source: Arc<dyn SecretSource> = Arc::new(BwCli::new(config.agent.bw_binary.clone()));
    let mut server = AgentServer::new(
        source,
        session,
        &config.agent.folder,
        lifecycle.socket_path(),
    )
    .await
    .context("resolving key folder")?;

    let mut marker = lifecycle.claim().context("recording running agent")?;
    server.open().context("opening agent socket")?;

    let (events_tx, events_rx) = mpsc::channel(8);
    let _signals = forward_os_signals(events_tx).context("installing signal handlers")?;
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(ShutdownCoordinator::new(server.close_handle()).run(events_rx, done_tx));

    if let Err(e) = server.add_key().await {
        server.close();
        return Err(e).context("loading SSH key");
    }
    marker.mark_ready().context("recording running agent")?;

    let coords = lifecycle.own_coordinates();
    if print_coordinates {
        print_stdout(&coords.to_string())?;
    }
    info!(
        pid = coords.pid,
        socket = %server.socket_path().display(),
        keys = server.key_count()?,
        fingerprints = ?server.fingerprints()?,
        "SSH agent ready"
    );

    server.start().await.context("serving SSH agent")?;
    if done_rx.await.is_ok() {
        info!("SSH agent stopped");
    }
    Ok(())
}

fn print_stdout(text: &str) -> Result<()> {
    let mut out = std::io::stdout().lock();
    out.write_all(text.as_bytes())
        .and_then(|()| out.flush())
        .context("writing to stdout")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::{FakeVault, KEY_A, server_for};
    use crate::shutdown::ShutdownEvent;
    use clap::CommandFactory as _;
    use ssh_agent_lib::agent::Session as _;
    use ssh_agent_lib::client::Client;
    use tokio::net::UnixStream;

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn cli_flags() {
        let args = Args::try_parse_from(["bwagentd", "-k", "-c", "/etc/bwagent.toml"]).unwrap();
        assert!(args.kill);
        assert!(!args.foreground);
        assert_eq!(args.config, Some(PathBuf::from("/etc/bwagent.toml")));

        let args = Args::try_parse_from(["bwagentd", "--foreground"]).unwrap();
        assert!(args.foreground && !args.kill);

        assert!(Args::try_parse_from(["bwagentd", "-k", "-f"]).is_err());
    }

    #[tokio::test]
    async fn second_interrupt_stops_serving() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server_for(FakeVault::with_key(KEY_A.as_bytes()), &dir).await;
        server.open().unwrap();
        server.add_key().await.unwrap();
        let path = server.socket_path().to_path_buf();

        let (tx, rx) = mpsc::channel(4);
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(ShutdownCoordinator::new(server.close_handle()).run(rx, done_tx));
        let serving = tokio::spawn(async move { server.start().await });

        tx.send(ShutdownEvent::Interrupt).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!serving.is_finished());
        let mut client = Client::new(UnixStream::connect(&path).await.unwrap());
        assert_eq!(client.request_identities().await.unwrap().len(), 1);

        tx.send(ShutdownEvent::Interrupt).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        done_rx.await.unwrap();
        assert!(!path.exists());
    }
}
