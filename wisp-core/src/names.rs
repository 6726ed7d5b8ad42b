//! Well-known names and wire limits shared across the workspace.

/// Basename of the gpg-agent executable.
pub const GPG_AGENT_NAME: &str = "gpg-agent";

/// gpg-agent's main control socket.
pub const SOCKET_AGENT: &str = "S.gpg-agent";

/// The restricted "extra" socket intended for forwarding.
pub const SOCKET_AGENT_EXTRA: &str = "S.gpg-agent.extra";

/// The browser socket.
pub const SOCKET_AGENT_BROWSER: &str = "S.gpg-agent.browser";

/// The ssh-agent socket.
pub const SOCKET_AGENT_SSH: &str = "S.gpg-agent.ssh";

/// The ssh-agent socket re-published under the Cygwin convention.
pub const SOCKET_AGENT_SSH_CYGWIN: &str = "S.gpg-agent.ssh.cyg";

/// Named pipe the Windows OpenSSH agent and its clients use.
pub const SSH_AGENT_PIPE_NAME: &str = r"\\.\pipe\openssh-ssh-agent";

/// Maximum SSH agent message length, shared with the Pageant mapping size.
///
/// openssh-portable uses 256 KiB; gpg-agent 16 KiB; PuTTY about 8 KiB.  The
/// largest wins so every client fits.
pub const MAX_AGENT_MSG_LEN: usize = 256 * 1024;

/// Maximum length of an AF_UNIX socket path (`sun_path`).
pub const MAX_SOCKET_PATH_LEN: usize = 108;
