//! gpg-agent process supervision.
//!
//! [`Agent`] owns exactly one child gpg-agent and one connector per
//! endpoint kind.  Start is verified end to end: the control socket must
//! appear within five seconds and answer an Assuan `RESET`; anything less
//! force-kills the child.  Stop is cooperative first (`KILLAGENT` over the
//! control socket) with the same forced fallback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, bail};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use wisp_assuan::client::Session;
use wisp_core::names::{
    GPG_AGENT_NAME, SOCKET_AGENT, SOCKET_AGENT_BROWSER, SOCKET_AGENT_EXTRA, SOCKET_AGENT_SSH,
    SOCKET_AGENT_SSH_CYGWIN,
};
use wisp_core::{Config, SessionGate};

use crate::connector::{Connector, ConnectorKind};
use crate::fswait;
use crate::ring::RingBuffer;

/// How long to wait for gpg-agent's control socket to appear.
const SOCKET_WAIT: Duration = Duration::from_secs(5);

#[cfg(windows)]
const DETACHED_PROCESS: u32 = 0x0000_0008;

type ControlSession = Session<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf>;

/// Supervisor for one upstream gpg-agent and its IPC surface.
pub struct Agent {
    cfg: Config,
    exe: PathBuf,
    version: String,
    gate: SessionGate,
    cancel: CancellationToken,
    tracker: TaskTracker,
    connectors: HashMap<ConnectorKind, Connector>,
    child: Option<Child>,
    output: Arc<Mutex<RingBuffer>>,
}

impl Agent {
    /// Probe the gpg-agent binary, build the connector set, and clear stale
    /// pseudo-sockets from earlier runs.
    pub async fn new(cfg: Config) -> anyhow::Result<Self> {
        let exe = agent_executable(&cfg);
        let probe = Command::new(&exe)
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("unable to run {exe:?}"))?;
        let stdout = String::from_utf8_lossy(&probe.stdout);
        let version = parse_version_line(&stdout)
            .with_context(|| format!("cannot parse version from {exe:?} output"))?;
        info!(%version, "found gpg-agent");

        let gate = if cfg.gui.ignore_session_lock {
            SessionGate::disabled()
        } else {
            SessionGate::new()
        };
        let tracker = TaskTracker::new();
        let gpg_dir = cfg.gpg_socket_dir().clone();
        let gui_dir = cfg.gui.homedir.clone();

        let mut connectors = HashMap::new();
        for (kind, gpg, gui, name) in [
            (ConnectorKind::UpstreamRelay, &gpg_dir, &gui_dir, SOCKET_AGENT.to_string()),
            (ConnectorKind::ExtraRelay, &gpg_dir, &gui_dir, SOCKET_AGENT_EXTRA.to_string()),
            (ConnectorKind::BrowserRelay, &gpg_dir, &gui_dir, SOCKET_AGENT_BROWSER.to_string()),
            (ConnectorKind::SshSocket, &gpg_dir, &gui_dir, SOCKET_AGENT_SSH.to_string()),
            (ConnectorKind::SshCygwinSocket, &gpg_dir, &gui_dir, SOCKET_AGENT_SSH_CYGWIN.to_string()),
            (ConnectorKind::SshPipe, &PathBuf::new(), &PathBuf::new(), cfg.gui.pipe_name.clone()),
        ] {
            connectors.insert(
                kind,
                Connector::new(kind, gpg, gui, name, gate.clone(), tracker.clone()),
            );
        }
        if let Some(port) = cfg.gui.extra_port {
            connectors.insert(
                ConnectorKind::ExtraTcp,
                Connector::new(
                    ConnectorKind::ExtraTcp,
                    &gpg_dir,
                    "",
                    format!("127.0.0.1:{port}"),
                    gate.clone(),
                    tracker.clone(),
                ),
            );
        }

        // make sure we are not looking at sockets of a dead agent
        let stale: Vec<PathBuf> = [
            SOCKET_AGENT,
            SOCKET_AGENT_EXTRA,
            SOCKET_AGENT_BROWSER,
            SOCKET_AGENT_SSH,
        ]
        .iter()
        .map(|name| gpg_dir.join(name))
        .collect();
        fswait::wait_for_file_departure(SOCKET_WAIT, &stale).await;

        Ok(Self {
            cfg,
            exe,
            version,
            gate,
            cancel: CancellationToken::new(),
            tracker,
            connectors,
            child: None,
            output: Arc::new(Mutex::new(RingBuffer::default())),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn gate(&self) -> SessionGate {
        self.gate.clone()
    }

    /// Cancellation signal shared with connection tasks.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Launch gpg-agent daemonized and verify its control socket answers.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.child.is_some() {
            bail!("gpg-agent is already running");
        }

        let pinentry = sibling_program("wisp-pinentry")?;
        let mut command = Command::new(&self.exe);
        command
            .arg("--homedir")
            .arg(&self.cfg.gpg.homedir)
            .args(["--ssh-fingerprint-digest", "SHA256"])
            .arg("--use-standard-socket")
            .arg("--enable-ssh-support")
            .arg("--enable-putty-support")
            .arg("--pinentry-program")
            .arg(&pinentry)
            .arg("--daemon");
        if let Some(conf) = &self.cfg.gpg.gpg_agent_conf
            && tokio::fs::try_exists(conf).await.unwrap_or(false)
        {
            command.arg("--options").arg(conf);
        }
        command.args(&self.cfg.gpg.gpg_agent_args);
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        #[cfg(windows)]
        command.creation_flags(DETACHED_PROCESS);

        info!(exe = %self.exe.display(), "executing gpg-agent");
        let mut child = command
            .spawn()
            .with_context(|| format!("unable to start {:?}", self.exe))?;

        if let Some(stdout) = child.stdout.take() {
            self.capture_output(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.capture_output(stderr);
        }
        self.child = Some(child);

        let socket = self.cfg.gpg_socket_dir().join(SOCKET_AGENT);
        if !fswait::wait_for_file_arrival(SOCKET_WAIT, std::slice::from_ref(&socket)).await {
            let err = anyhow::anyhow!("unable to access socket: {socket:?}");
            self.force_kill().await;
            return Err(err);
        }

        let reset_target = socket.clone();
        if let Err(err) = send_assuan_cmd(&socket, move |ses| {
            Box::pin(async move {
                ses.reset()
                    .await
                    .with_context(|| format!("unable to RESET assuan session on {reset_target:?}"))
            })
        })
        .await
        {
            self.force_kill().await;
            return Err(err);
        }

        debug!("gpg-agent is up");
        Ok(())
    }

    /// Serve the endpoint for `kind` using the configured idle deadline.
    pub async fn serve(&self, kind: ConnectorKind) -> anyhow::Result<()> {
        let connector = self
            .connectors
            .get(&kind)
            .with_context(|| format!("no connector for {kind}"))?;
        // only relayed byte streams honor the idle deadline; SSH framing
        // has its own request boundaries
        let deadline = if kind.is_relay() {
            self.cfg.deadline()
        } else {
            None
        };
        connector.serve(deadline).await
    }

    /// Stop accepting on the endpoint for `kind`.
    pub fn close(&self, kind: ConnectorKind) {
        if let Some(connector) = self.connectors.get(&kind) {
            connector.close();
        }
    }

    /// Kinds this supervisor can serve (the TCP endpoint only when
    /// configured).
    pub fn kinds(&self) -> Vec<ConnectorKind> {
        self.connectors.keys().copied().collect()
    }

    /// Flag the user session as locked.
    pub fn session_lock(&self) {
        self.gate.lock();
        info!("session locked");
    }

    /// Flag the user session as unlocked.
    pub fn session_unlock(&self) {
        self.gate.unlock();
        info!("session unlocked");
    }

    /// Close every endpoint, ask gpg-agent to exit, and wait for both the
    /// child and all in-flight connection tasks.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        if self.child.is_none() {
            return Ok(());
        }

        for connector in self.connectors.values() {
            connector.close();
        }
        // in-flight conversations are allowed to finish
        self.cancel.cancel();

        let socket = self.cfg.gpg_socket_dir().join(SOCKET_AGENT);
        let kill_target = socket.clone();
        let result = send_assuan_cmd(&socket, move |ses| {
            Box::pin(async move {
                ses.simple_cmd("KILLAGENT", "")
                    .await
                    .map(|_| ())
                    .or_else(|err| {
                        // gpg-agent may exit without answering
                        if err.is_eof() { Ok(()) } else { Err(err) }
                    })
                    .with_context(|| format!("unable to send KILLAGENT on {kill_target:?}"))
            })
        })
        .await;

        let outcome = match result {
            Err(err) => {
                self.force_kill().await;
                Err(err)
            }
            Ok(()) => match self.child.take() {
                Some(mut child) => child
                    .wait()
                    .await
                    .map(|status| debug!(%status, "gpg-agent exited"))
                    .context("waiting for gpg-agent"),
                None => Ok(()),
            },
        };

        self.tracker.close();
        self.tracker.wait().await;
        self.flush_output_log();
        outcome
    }

    async fn force_kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!("forcefully killing gpg-agent");
            if let Err(err) = child.kill().await {
                warn!("unable to kill gpg-agent: {err}");
            }
        }
        self.flush_output_log();
    }

    fn capture_output<R>(&self, stream: R)
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
    {
        let output = Arc::clone(&self.output);
        self.tracker.spawn(async move {
            let mut stream = stream;
            let mut buf = vec![0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => output.lock().expect("output mutex poisoned").push(&buf[..n]),
                }
            }
        });
    }

    fn flush_output_log(&self) {
        let (contents, dropped) = self
            .output
            .lock()
            .expect("output mutex poisoned")
            .take();
        if dropped > 0 {
            warn!(dropped, "gpg-agent output overflowed the capture buffer");
        }
        if !contents.is_empty() {
            info!("gpg-agent output[\n{}]", String::from_utf8_lossy(&contents));
        }
    }
}

fn agent_executable(cfg: &Config) -> PathBuf {
    let name = format!("{GPG_AGENT_NAME}{}", std::env::consts::EXE_SUFFIX);
    cfg.gpg.install_path.join("bin").join(name)
}

/// Locate a program installed next to the current executable.
fn sibling_program(name: &str) -> anyhow::Result<PathBuf> {
    let current = std::env::current_exe().context("cannot locate current executable")?;
    let dir = current
        .parent()
        .context("current executable has no parent directory")?;
    Ok(dir.join(format!("{name}{}", std::env::consts::EXE_SUFFIX)))
}

/// Third whitespace-separated token of the first line, e.g.
/// `gpg-agent (GnuPG) 2.4.5`.
fn parse_version_line(output: &str) -> Option<String> {
    let first = output.lines().next()?;
    let mut words = first.split_whitespace();
    let version = words.nth(2)?;
    Some(version.to_string())
}

/// Dial the control socket, run one exchange, close the session.
async fn send_assuan_cmd<F>(socket: &Path, exchange: F) -> anyhow::Result<()>
where
    F: for<'a> FnOnce(
        &'a mut ControlSession,
    ) -> futures::future::BoxFuture<'a, anyhow::Result<()>>,
{
    let conn: TcpStream = wisp_assuan::socket::dial(socket)
        .await
        .with_context(|| format!("unable to dial assuan socket {socket:?}"))?;
    let (read, write) = conn.into_split();
    let mut session = Session::init(read, write)
        .await
        .with_context(|| format!("unable to init assuan session on {socket:?}"))?;
    let result = exchange(&mut session).await;
    if let Err(err) = session.close().await {
        debug!("error closing control session: {err}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_third_token_of_first_line() {
        let out = "gpg-agent (GnuPG) 2.4.5\nlibgcrypt 1.10.3\n";
        assert_eq!(parse_version_line(out).as_deref(), Some("2.4.5"));
    }

    #[test]
    fn short_version_line_is_rejected() {
        assert_eq!(parse_version_line("gpg-agent\n"), None);
        assert_eq!(parse_version_line(""), None);
    }

    #[tokio::test]
    async fn control_exchange_round_trip() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;

        // a minimal control server behind an assuan pseudo-socket file
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join(SOCKET_AGENT);
        let mut content = format!("{port}\n").into_bytes();
        content.extend_from_slice(&[1u8; 16]);
        std::fs::write(&socket, content).unwrap();

        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let (read, mut write) = conn.into_split();
            let mut lines = BufReader::new(read);
            let mut nonce = [0u8; 16];
            lines.read_exact(&mut nonce).await.unwrap();
            write.write_all(b"OK Pleased to meet you\n").await.unwrap();
            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            assert_eq!(line, "RESET\n");
            write.write_all(b"OK\n").await.unwrap();
            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            assert_eq!(line, "BYE\n");
        });

        send_assuan_cmd(&socket, |ses| {
            Box::pin(async move { ses.reset().await.map_err(Into::into) })
        })
        .await
        .unwrap();
        server.await.unwrap();
    }
}
