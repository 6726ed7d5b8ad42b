//! wisp-pinentry — pinentry program for GnuPG.
//!
//! Speaks Assuan on stdio towards gpg-agent; defers the actual dialog to
//! the configured prompt helper and passphrase caching to the OS keyring.
//! gpg-agent passes assorted legacy flags on the command line; everything
//! we do not recognize is accepted and ignored.

mod prompt;
mod server;
mod settings;
mod vault;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use clap::error::ErrorKind;
use tracing::{debug, info};

use wisp_core::Config;

use crate::prompt::ExecPrompt;
use crate::server::PinentryServer;
use crate::settings::Settings;
use crate::vault::KeyringVault;

#[derive(Debug, Parser)]
#[command(
    name = "wisp-pinentry",
    version,
    about = "Pinentry program for GnuPG",
    disable_help_subcommand = true
)]
struct Cli {
    /// Configuration file
    #[arg(short, long, value_name = "path")]
    config: Option<PathBuf>,

    /// Turn on debugging
    #[arg(short, long)]
    debug: bool,
}

/// Parse the command line, tolerating flags we do not know.
fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => err.exit(),
            _ => {
                // gpg-agent forwards pinentry flags we never use
                // (--ttyname, --lc-ctype, …); keep ours, drop the rest
                Cli::parse_from(recognized_args())
            }
        },
    }
}

fn recognized_args() -> Vec<std::ffi::OsString> {
    let mut kept = Vec::new();
    let mut args = std::env::args_os();
    if let Some(program) = args.next() {
        kept.push(program);
    }
    let mut take_value = false;
    for arg in args {
        if take_value {
            kept.push(arg);
            take_value = false;
            continue;
        }
        let text = arg.to_string_lossy();
        if text == "--config" || text == "-c" {
            kept.push(arg);
            take_value = true;
        } else if text.starts_with("--config=") || text == "--debug" || text == "-d" {
            kept.push(arg);
        }
    }
    kept
}

fn config_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.config {
        return path.clone();
    }
    // configuration is picked up next to the executable
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("wisp-pinentry.toml")))
        .unwrap_or_else(|| PathBuf::from("wisp-pinentry.toml"))
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            Config::from_toml(&text).with_context(|| format!("unable to load {path:?}"))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(err) => Err(err).with_context(|| format!("unable to read {path:?}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = parse_cli();

    let path = config_path(&cli);
    let mut config = load_config(&path)?;
    if cli.debug {
        config.gui.debug = true;
    }

    // stdout carries the protocol; logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(if config.gui.debug { "debug" } else { "info" })
        .init();
    debug!(config = %path.display(), "starting");

    let defaults = Settings::base(Duration::ZERO, true, 0);
    let server = PinentryServer::new(
        Arc::new(KeyringVault::new()),
        Arc::new(ExecPrompt::from_config(&config.gui.pin_dialog)),
        config.gui.vault_prefix.clone(),
        env!("CARGO_PKG_VERSION"),
        defaults,
    );
    let proto = server.proto();

    info!("serving on stdio");
    let stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    if let Err(err) = wisp_assuan::server::serve(stdio, &proto).await {
        debug!("session ended with error: {err}");
        std::process::exit(1);
    }
    Ok(())
}
