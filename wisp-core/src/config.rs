//! Resolved daemon configuration.
//!
//! The daemon and the pinentry consume this record fully resolved — path
//! expansion, file discovery and layering happen in the binaries before
//! anything here is constructed.  TOML, with per-field defaults:
//!
//! ```toml
//! [gpg]
//! install_path = 'C:\Program Files (x86)\gnupg'
//! homedir      = 'C:\Users\me\AppData\Roaming\gnupg'
//!
//! [gui]
//! homedir             = 'C:\Users\me\AppData\Local\gnupg\wisp'
//! deadline_secs       = 60
//! ignore_session_lock = false
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gpg: GpgConfig,
    #[serde(default)]
    pub gui: GuiConfig,
}

/// Where GnuPG lives and how to run its agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpgConfig {
    /// GnuPG installation root; the agent binary is `bin/gpg-agent` below it.
    #[serde(default)]
    pub install_path: PathBuf,
    /// `--homedir` passed to the agent.
    #[serde(default)]
    pub homedir: PathBuf,
    /// Directory where the agent keeps its control sockets.  Usually equals
    /// `homedir`; split out because GnuPG honors a separate socketdir.
    #[serde(default)]
    pub socketdir: Option<PathBuf>,
    /// Optional `--options` file for the agent.
    #[serde(default)]
    pub gpg_agent_conf: Option<PathBuf>,
    /// Extra arguments appended to the agent command line.
    #[serde(default)]
    pub gpg_agent_args: Vec<String>,
}

/// The daemon's own surface: where it republishes sockets and how its
/// prompts behave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuiConfig {
    /// Directory for the re-exposed AF_UNIX and Cygwin sockets.
    #[serde(default)]
    pub homedir: PathBuf,
    /// SSH agent named pipe.
    #[serde(default = "default_pipe_name")]
    pub pipe_name: String,
    /// Optional loopback TCP port re-exposing the extra socket.
    #[serde(default)]
    pub extra_port: Option<u16>,
    /// Idle deadline for relayed connections, in seconds.  Absent means
    /// relays block forever.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: Option<u64>,
    /// Never gate traffic on the session lock.
    #[serde(default)]
    pub ignore_session_lock: bool,
    #[serde(default)]
    pub debug: bool,
    /// Native prompt dialog parameters.
    #[serde(default)]
    pub pin_dialog: PinDialogConfig,
    /// Credential vault name prefix for cached passphrases.
    #[serde(default = "default_vault_prefix")]
    pub vault_prefix: String,
}

impl Default for GuiConfig {
    fn default() -> Self {
        Self {
            homedir: PathBuf::new(),
            pipe_name: default_pipe_name(),
            extra_port: None,
            deadline_secs: default_deadline_secs(),
            ignore_session_lock: false,
            debug: false,
            pin_dialog: PinDialogConfig::default(),
            vault_prefix: default_vault_prefix(),
        }
    }
}

/// How the pinentry finds and decorates its dialog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinDialogConfig {
    /// Helper program that displays the dialog; empty selects the built-in
    /// fallback.
    #[serde(default)]
    pub program: String,
    /// Extra arguments for the helper.
    #[serde(default)]
    pub args: Vec<String>,
    /// Milliseconds to wait before raising the dialog window.
    #[serde(default = "default_dialog_delay_ms")]
    pub delay_ms: u64,
    /// Window name hint used to bring the dialog to the foreground.
    #[serde(default)]
    pub window_name: String,
    /// Window class hint used to bring the dialog to the foreground.
    #[serde(default)]
    pub window_class: String,
    /// Free-form options handed to the helper.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for PinDialogConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            delay_ms: default_dialog_delay_ms(),
            window_name: String::new(),
            window_class: String::new(),
            options: HashMap::new(),
        }
    }
}

fn default_pipe_name() -> String {
    crate::names::SSH_AGENT_PIPE_NAME.to_string()
}

fn default_deadline_secs() -> Option<u64> {
    Some(60)
}

fn default_vault_prefix() -> String {
    "GnuPG:PinGO".to_string()
}

fn default_dialog_delay_ms() -> u64 {
    300
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("gpg socketdir and gui homedir both resolve to {0:?}")]
    SocketDirConflict(PathBuf),
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Directory holding the upstream agent's own sockets.
    pub fn gpg_socket_dir(&self) -> &PathBuf {
        self.gpg.socketdir.as_ref().unwrap_or(&self.gpg.homedir)
    }

    /// The configured idle deadline.  Zero and absent both disable it.
    pub fn deadline(&self) -> Option<Duration> {
        self.gui
            .deadline_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // serving our sockets out of the agent's own socket directory would
        // have us deleting the agent's sockets at teardown
        let gpg_sockets = self.gpg_socket_dir();
        if !self.gui.homedir.as_os_str().is_empty() && gpg_sockets == &self.gui.homedir {
            return Err(ConfigError::SocketDirConflict(self.gui.homedir.clone()));
        }
        Ok(())
    }
}
