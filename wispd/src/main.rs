//! wispd — owns a gpg-agent and re-exposes it on every local IPC flavor.
//!
//! Startup: load the config, launch and verify gpg-agent, bring up all
//! connectors.  Then sit on the shutdown signals.  The host environment is
//! expected to drive the session-lock gate; on unix SIGUSR1/SIGUSR2 stand
//! in for the host UI's lock/unlock notifications.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tracing::{error, info, warn};

use wisp_agent::Agent;
use wisp_core::Config;

#[derive(Debug, Parser)]
#[command(name = "wispd", version, about = "gpg-agent session daemon")]
struct Cli {
    /// Configuration file
    #[arg(short, long, value_name = "path")]
    config: Option<PathBuf>,

    /// Turn on debugging
    #[arg(short, long)]
    debug: bool,
}

fn config_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.config {
        return path.clone();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("wispd.toml")))
        .unwrap_or_else(|| PathBuf::from("wispd.toml"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = config_path(&cli);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("unable to read configuration {path:?}"))?;
    let mut config = Config::from_toml(&text)?;
    if cli.debug {
        config.gui.debug = true;
    }

    tracing_subscriber::fmt()
        .with_env_filter(if config.gui.debug { "debug" } else { "info" })
        .init();
    info!(config = %path.display(), "starting");

    let mut agent = Agent::new(config).await?;
    if let Err(err) = agent.start().await {
        error!("unable to start gpg-agent: {err:#}");
        return Err(err);
    }
    info!(version = agent.version(), "gpg-agent started");

    for kind in agent.kinds() {
        if let Err(err) = agent.serve(kind).await {
            warn!(%kind, "cannot serve connector: {err:#}");
        }
    }

    watch_session_lock(&agent);
    shutdown_signal().await;
    info!("received shutdown signal, stopping");

    if let Err(err) = agent.stop().await {
        error!("shutdown failed: {err:#}");
        return Err(err);
    }
    Ok(())
}

/// SIGUSR1 locks, SIGUSR2 unlocks — the stand-in for host UI session
/// notifications.
#[cfg(unix)]
fn watch_session_lock(agent: &Agent) {
    use tokio::signal::unix::{SignalKind, signal};

    let gate = agent.gate();
    tokio::spawn(async move {
        let mut lock = match signal(SignalKind::user_defined1()) {
            Ok(lock) => lock,
            Err(err) => {
                warn!("cannot install SIGUSR1 handler: {err}");
                return;
            }
        };
        let mut unlock = match signal(SignalKind::user_defined2()) {
            Ok(unlock) => unlock,
            Err(err) => {
                warn!("cannot install SIGUSR2 handler: {err}");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = lock.recv() => {
                    gate.lock();
                    info!("session locked");
                }
                _ = unlock.recv() => {
                    gate.unlock();
                    info!("session unlocked");
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn watch_session_lock(_agent: &Agent) {
    // on Windows the tray application drives the gate through the
    // supervisor API
}

/// Wait for ctrl-c (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!("failed to register SIGTERM handler: {err}, falling back to SIGINT only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
