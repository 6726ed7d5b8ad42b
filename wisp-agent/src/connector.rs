//! Endpoint connectors.
//!
//! A [`Connector`] owns one listener on one named endpoint and, while
//! serving, spawns one task per accepted connection on the supervisor's
//! shared tracker.  Relay kinds copy bytes to the upstream's Assuan
//! pseudo-socket in both directions; SSH kinds run the Pageant bridge.
//!
//! Relay copy loops honor two signals between rounds: the session gate
//! (locked ⇒ stop moving bytes) and the idle deadline (no forward progress
//! for a full deadline ⇒ clean exit; any progress re-arms it).

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context as _, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use wisp_core::SessionGate;
use wisp_core::names::MAX_SOCKET_PATH_LEN;

use crate::cygwin;
use crate::pageant::{self, HostAgent};

/// The endpoint flavors a supervisor exposes.  At most one listener exists
/// per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    /// gpg-agent's main socket, relayed.
    UpstreamRelay,
    /// The restricted "extra" socket, relayed.
    ExtraRelay,
    /// The browser socket, relayed.
    BrowserRelay,
    /// ssh-agent framing on an AF_UNIX socket.
    SshSocket,
    /// ssh-agent framing on a named pipe.
    SshPipe,
    /// ssh-agent framing behind the Cygwin socket-file handshake.
    SshCygwinSocket,
    /// The extra socket relayed on a loopback TCP port.
    ExtraTcp,
}

impl std::fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectorKind::UpstreamRelay => "gpg-agent socket",
            ConnectorKind::ExtraRelay => "gpg-agent extra socket",
            ConnectorKind::BrowserRelay => "gpg-agent browser socket",
            ConnectorKind::SshSocket => "ssh-agent socket",
            ConnectorKind::SshPipe => "ssh-agent named pipe",
            ConnectorKind::SshCygwinSocket => "ssh-agent cygwin socket",
            ConnectorKind::ExtraTcp => "gpg-agent extra socket on local port",
        };
        f.write_str(name)
    }
}

impl ConnectorKind {
    /// Kinds that relay raw bytes to the upstream control socket.
    pub fn is_relay(&self) -> bool {
        matches!(
            self,
            ConnectorKind::UpstreamRelay
                | ConnectorKind::ExtraRelay
                | ConnectorKind::BrowserRelay
                | ConnectorKind::ExtraTcp
        )
    }

    /// Kinds whose external endpoint is a socket file we must unlink at
    /// teardown.
    fn owns_socket_file(&self) -> bool {
        matches!(
            self,
            ConnectorKind::UpstreamRelay
                | ConnectorKind::ExtraRelay
                | ConnectorKind::BrowserRelay
                | ConnectorKind::SshSocket
                | ConnectorKind::SshCygwinSocket
        )
    }
}

static CONN_SEQ: AtomicU64 = AtomicU64::new(0);

/// One listener plus the parameters its connections need.
pub struct Connector {
    kind: ConnectorKind,
    /// Directory of the upstream's own sockets (relay kinds).
    gpg_dir: PathBuf,
    /// Directory of our re-exposed sockets, or the TCP address / pipe name.
    gui_dir: PathBuf,
    name: String,
    gate: SessionGate,
    tracker: TaskTracker,
    host_agent: Arc<dyn HostAgent>,
    stop: std::sync::Mutex<Option<CancellationToken>>,
}

impl Connector {
    pub fn new(
        kind: ConnectorKind,
        gpg_dir: impl Into<PathBuf>,
        gui_dir: impl Into<PathBuf>,
        name: impl Into<String>,
        gate: SessionGate,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            kind,
            gpg_dir: gpg_dir.into(),
            gui_dir: gui_dir.into(),
            name: name.into(),
            gate,
            tracker,
            host_agent: pageant::default_host_agent(),
            stop: std::sync::Mutex::new(None),
        }
    }

    /// Substitute the host SSH agent (tests).
    pub fn with_host_agent(mut self, agent: Arc<dyn HostAgent>) -> Self {
        self.host_agent = agent;
        self
    }

    pub fn kind(&self) -> ConnectorKind {
        self.kind
    }

    /// Path of the upstream socket this connector relays to.
    pub fn path_gpg(&self) -> PathBuf {
        self.gpg_dir.join(&self.name)
    }

    /// Path of the external socket file (unix and cygwin kinds).
    pub fn path_gui(&self) -> PathBuf {
        self.gui_dir.join(&self.name)
    }

    /// Name part of the endpoint (socket file, pipe name or TCP address).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start listening and accepting.  Returns once the listener is bound;
    /// accepting happens on a tracked background task.
    pub async fn serve(&self, deadline: Option<Duration>) -> anyhow::Result<()> {
        let stop = {
            let mut guard = self.stop.lock().expect("connector mutex poisoned");
            if guard.is_some() {
                bail!("connector for {} is already serving", self.kind);
            }
            let token = CancellationToken::new();
            *guard = Some(token.clone());
            token
        };

        let res = match self.kind {
            ConnectorKind::UpstreamRelay
            | ConnectorKind::ExtraRelay
            | ConnectorKind::BrowserRelay => self.serve_relay_unix(deadline, stop).await,
            ConnectorKind::ExtraTcp => self.serve_relay_tcp(deadline, stop).await,
            ConnectorKind::SshSocket => self.serve_ssh_unix(stop).await,
            ConnectorKind::SshPipe => self.serve_ssh_pipe(stop).await,
            ConnectorKind::SshCygwinSocket => self.serve_ssh_cygwin(stop).await,
        };
        if res.is_err() {
            self.stop.lock().expect("connector mutex poisoned").take();
        }
        res
    }

    /// Stop accepting and remove the external socket file.  In-flight
    /// connections drain against the supervisor's tracker.
    pub fn close(&self) {
        let Some(token) = self.stop.lock().expect("connector mutex poisoned").take() else {
            return;
        };
        token.cancel();
        if self.kind.owns_socket_file() {
            let path = self.path_gui();
            if let Err(err) = std::fs::remove_file(&path)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(kind = %self.kind, path = %path.display(), "error removing socket file: {err}");
            }
        }
        debug!(kind = %self.kind, "connector closed");
    }

    fn checked_gui_path(&self) -> anyhow::Result<PathBuf> {
        let path = self.path_gui();
        let len = path.as_os_str().len();
        if len > MAX_SOCKET_PATH_LEN {
            bail!("socket name is too long: {len}, max allowed: {MAX_SOCKET_PATH_LEN}");
        }
        Ok(path)
    }

    #[cfg(unix)]
    async fn bind_unix(&self) -> anyhow::Result<tokio::net::UnixListener> {
        let path = self.checked_gui_path()?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed stale socket file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to unlink socket {path:?}"));
            }
        }
        tokio::net::UnixListener::bind(&path)
            .with_context(|| format!("could not open socket {path:?}"))
    }

    #[cfg(unix)]
    async fn serve_relay_unix(
        &self,
        deadline: Option<Duration>,
        stop: CancellationToken,
    ) -> anyhow::Result<()> {
        let listener = self.bind_unix().await?;
        let upstream = self.path_gpg();
        let kind = self.kind;
        let gate = self.gate.clone();
        let tracker = self.tracker.clone();
        info!(%kind, path = %self.path_gui().display(), "serving");

        self.tracker.spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((conn, _addr)) => conn,
                        Err(err) => {
                            if !is_closed(&err) {
                                warn!(%kind, "quitting, unable to accept: {err}");
                            }
                            break;
                        }
                    },
                };
                let upstream = upstream.clone();
                let gate = gate.clone();
                let inner = tracker.clone();
                tracker.spawn(async move {
                    handle_relay(conn, upstream, deadline, gate, inner).await;
                });
            }
        });
        Ok(())
    }

    #[cfg(not(unix))]
    async fn serve_relay_unix(
        &self,
        _deadline: Option<Duration>,
        _stop: CancellationToken,
    ) -> anyhow::Result<()> {
        bail!("AF_UNIX sockets are not supported on this platform");
    }

    async fn serve_relay_tcp(
        &self,
        deadline: Option<Duration>,
        stop: CancellationToken,
    ) -> anyhow::Result<()> {
        let addr = &self.name;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not open socket {addr}"))?;
        let upstream = self.path_gpg();
        let kind = self.kind;
        let gate = self.gate.clone();
        let tracker = self.tracker.clone();
        info!(%kind, %addr, "serving");

        self.tracker.spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((conn, _addr)) => conn,
                        Err(err) => {
                            if !is_closed(&err) {
                                warn!(%kind, "quitting, unable to accept: {err}");
                            }
                            break;
                        }
                    },
                };
                let upstream = upstream.clone();
                let gate = gate.clone();
                let inner = tracker.clone();
                tracker.spawn(async move {
                    handle_relay(conn, upstream, deadline, gate, inner).await;
                });
            }
        });
        Ok(())
    }

    #[cfg(unix)]
    async fn serve_ssh_unix(&self, stop: CancellationToken) -> anyhow::Result<()> {
        let listener = self.bind_unix().await?;
        let kind = self.kind;
        let gate = self.gate.clone();
        let agent = Arc::clone(&self.host_agent);
        let tracker = self.tracker.clone();
        info!(%kind, path = %self.path_gui().display(), "serving");

        self.tracker.spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((conn, _addr)) => conn,
                        Err(err) => {
                            if !is_closed(&err) {
                                warn!(%kind, "quitting, unable to accept: {err}");
                            }
                            break;
                        }
                    },
                };
                let gate = gate.clone();
                let agent = Arc::clone(&agent);
                tracker.spawn(async move {
                    let id = CONN_SEQ.fetch_add(1, Ordering::Relaxed);
                    debug!(id, %kind, "accepted ssh request");
                    if let Err(err) = pageant::serve_ssh(conn, gate, agent).await {
                        debug!(id, "ssh handler returned error: {err}");
                    }
                });
            }
        });
        Ok(())
    }

    #[cfg(not(unix))]
    async fn serve_ssh_unix(&self, _stop: CancellationToken) -> anyhow::Result<()> {
        bail!("AF_UNIX sockets are not supported on this platform");
    }

    #[cfg(windows)]
    async fn serve_ssh_pipe(&self, stop: CancellationToken) -> anyhow::Result<()> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let pipe_name = self.name.clone();
        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&pipe_name)
            .with_context(|| format!("unable to listen on pipe {pipe_name}"))?;
        let kind = self.kind;
        let gate = self.gate.clone();
        let agent = Arc::clone(&self.host_agent);
        let tracker = self.tracker.clone();
        info!(%kind, pipe = %pipe_name, "serving");

        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    connected = server.connect() => {
                        if let Err(err) = connected {
                            warn!(%kind, "quitting, unable to serve on named pipe: {err}");
                            break;
                        }
                        let next = match ServerOptions::new().create(&pipe_name) {
                            Ok(next) => next,
                            Err(err) => {
                                warn!(%kind, "cannot create next pipe instance: {err}");
                                break;
                            }
                        };
                        let conn = std::mem::replace(&mut server, next);
                        let gate = gate.clone();
                        let agent = Arc::clone(&agent);
                        tracker.spawn(async move {
                            let id = CONN_SEQ.fetch_add(1, Ordering::Relaxed);
                            debug!(id, %kind, "accepted ssh request");
                            if let Err(err) = pageant::serve_ssh(conn, gate, agent).await {
                                debug!(id, "ssh handler returned error: {err}");
                            }
                        });
                    }
                }
            }
        });
        Ok(())
    }

    #[cfg(not(windows))]
    async fn serve_ssh_pipe(&self, _stop: CancellationToken) -> anyhow::Result<()> {
        bail!("named pipes are not supported on this platform");
    }

    async fn serve_ssh_cygwin(&self, stop: CancellationToken) -> anyhow::Result<()> {
        let socket_file = self.checked_gui_path()?;
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("could not open cygwin socket")?;
        let port = listener.local_addr()?.port();
        let nonce = cygwin::create_socket_file(&socket_file, port).await?;

        let kind = self.kind;
        let gate = self.gate.clone();
        let agent = Arc::clone(&self.host_agent);
        let tracker = self.tracker.clone();
        info!(%kind, path = %socket_file.display(), port, "serving");

        self.tracker.spawn(async move {
            loop {
                let mut conn = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((conn, _addr)) => conn,
                        Err(err) => {
                            if !is_closed(&err) {
                                warn!(%kind, "quitting, unable to accept: {err}");
                            }
                            break;
                        }
                    },
                };
                let gate = gate.clone();
                let agent = Arc::clone(&agent);
                tracker.spawn(async move {
                    let id = CONN_SEQ.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = cygwin::perform_handshake(&mut conn, &nonce).await {
                        debug!(id, "cygwin handshake failed: {err}");
                        return;
                    }
                    debug!(id, %kind, "accepted ssh request");
                    if let Err(err) = pageant::serve_ssh(conn, gate, agent).await {
                        debug!(id, "ssh handler returned error: {err}");
                    }
                });
            }
        });
        Ok(())
    }
}

/// Transport errors that are expected during shutdown.
fn is_closed(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
    )
}

/// Run one relayed connection: dial the upstream pseudo-socket and copy in
/// both directions until EOF, lock, or idle deadline.
async fn handle_relay<S>(
    external: S,
    upstream_path: PathBuf,
    deadline: Option<Duration>,
    gate: SessionGate,
    tracker: TaskTracker,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = CONN_SEQ.fetch_add(1, Ordering::Relaxed);
    debug!(id, upstream = %upstream_path.display(), "accepted relay request");

    let upstream = match wisp_assuan::socket::dial(&upstream_path).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(id, "unable to dial assuan socket {upstream_path:?}: {err}");
            return;
        }
    };

    let (ext_read, ext_write) = tokio::io::split(external);
    let (up_read, up_write) = upstream.into_split();

    let gate_out = gate.clone();
    tracker.spawn(async move {
        copy_with_idle(ext_read, up_write, deadline, gate_out, id, "external→upstream").await;
    });
    copy_with_idle(up_read, ext_write, deadline, gate, id, "upstream→external").await;
}

/// Half-duplex copy loop with lock-gate sampling and idle-deadline
/// semantics.  Closing our write half on exit EOFs the peer task out.
async fn copy_with_idle<R, W>(
    mut read: R,
    mut write: W,
    deadline: Option<Duration>,
    gate: SessionGate,
    id: u64,
    direction: &'static str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 32 * 1024];
    let mut copied: u64 = 0;
    // progress since the last deadline expiry; one quiet deadline ends the
    // connection, a busy one re-arms it
    let mut progressed = false;
    loop {
        if gate.is_locked() {
            debug!(id, direction, "session is locked");
            break;
        }
        let read_result = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, read.read(&mut buf)).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    if progressed {
                        progressed = false;
                        continue;
                    }
                    debug!(id, direction, copied, "no activity, exiting");
                    break;
                }
            },
            None => read.read(&mut buf).await,
        };
        match read_result {
            Ok(0) => {
                debug!(id, direction, copied, "copy done");
                break;
            }
            Ok(n) => {
                if let Err(err) = write.write_all(&buf[..n]).await {
                    if !is_closed(&err) {
                        warn!(id, direction, "write error: {err}");
                    }
                    break;
                }
                copied += n as u64;
                progressed = true;
            }
            Err(err) => {
                if !is_closed(&err) {
                    warn!(id, direction, "read error: {err}");
                }
                break;
            }
        }
    }
    let _ = write.shutdown().await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UnixStream};

    use crate::pageant::HostAgent;

    /// A fake upstream: Assuan pseudo-socket file + echoing TCP acceptor.
    async fn fake_upstream(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let nonce = [0x5au8; 16];

        let path = dir.join(name);
        let mut content = format!("{port}\n").into_bytes();
        content.extend_from_slice(&nonce);
        std::fs::write(&path, content).unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut got = [0u8; 16];
                    if conn.read_exact(&mut got).await.is_err() || got != nonce {
                        return;
                    }
                    let mut buf = [0u8; 4096];
                    while let Ok(n) = conn.read(&mut buf).await {
                        if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        path
    }

    struct EchoAgent;
    impl HostAgent for EchoAgent {
        fn query(&self, request: &[u8]) -> Result<Vec<u8>, crate::pageant::HostError> {
            Ok(request.to_vec())
        }
    }

    #[tokio::test]
    async fn relay_round_trips_bytes() {
        let gpg_dir = tempfile::tempdir().unwrap();
        let gui_dir = tempfile::tempdir().unwrap();
        fake_upstream(gpg_dir.path(), "S.up").await;

        let tracker = TaskTracker::new();
        let connector = Connector::new(
            ConnectorKind::ExtraRelay,
            gpg_dir.path(),
            gui_dir.path(),
            "S.up",
            SessionGate::new(),
            tracker.clone(),
        );
        connector.serve(None).await.unwrap();

        let mut client = UnixStream::connect(gui_dir.path().join("S.up")).await.unwrap();
        client.write_all(b"GETINFO version\n").await.unwrap();
        let mut buf = [0u8; 16];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GETINFO version\n");

        connector.close();
        assert!(!gui_dir.path().join("S.up").exists());
    }

    #[tokio::test]
    async fn idle_relay_exits_cleanly_after_deadline() {
        let gpg_dir = tempfile::tempdir().unwrap();
        let gui_dir = tempfile::tempdir().unwrap();
        fake_upstream(gpg_dir.path(), "S.idle").await;

        let tracker = TaskTracker::new();
        let connector = Connector::new(
            ConnectorKind::ExtraRelay,
            gpg_dir.path(),
            gui_dir.path(),
            "S.idle",
            SessionGate::new(),
            tracker.clone(),
        );
        connector.serve(Some(Duration::from_millis(100))).await.unwrap();

        let mut client = UnixStream::connect(gui_dir.path().join("S.idle")).await.unwrap();
        // no traffic: both directions give up after one quiet deadline and
        // the client observes EOF
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf)).await;
        assert_eq!(read.expect("relay did not time out").unwrap(), 0);

        connector.close();
    }

    #[tokio::test]
    async fn busy_relay_survives_deadlines() {
        let gpg_dir = tempfile::tempdir().unwrap();
        let gui_dir = tempfile::tempdir().unwrap();
        fake_upstream(gpg_dir.path(), "S.busy").await;

        let tracker = TaskTracker::new();
        let connector = Connector::new(
            ConnectorKind::ExtraRelay,
            gpg_dir.path(),
            gui_dir.path(),
            "S.busy",
            SessionGate::new(),
            tracker.clone(),
        );
        connector.serve(Some(Duration::from_millis(80))).await.unwrap();

        let mut client = UnixStream::connect(gui_dir.path().join("S.busy")).await.unwrap();
        // a byte every 30ms keeps the idle timer armed well past several
        // deadline periods
        for _ in 0..8 {
            client.write_all(b"x").await.unwrap();
            let mut buf = [0u8; 1];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"x");
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        connector.close();
    }

    #[tokio::test]
    async fn locked_gate_stops_relay() {
        let gpg_dir = tempfile::tempdir().unwrap();
        let gui_dir = tempfile::tempdir().unwrap();
        fake_upstream(gpg_dir.path(), "S.lock").await;

        let gate = SessionGate::new();
        let tracker = TaskTracker::new();
        let connector = Connector::new(
            ConnectorKind::ExtraRelay,
            gpg_dir.path(),
            gui_dir.path(),
            "S.lock",
            gate.clone(),
            tracker.clone(),
        );
        connector.serve(Some(Duration::from_millis(50))).await.unwrap();

        let mut client = UnixStream::connect(gui_dir.path().join("S.lock")).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();

        gate.lock();
        // the next iteration boundary observes the lock and closes
        let mut end = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut end)).await;
        assert_eq!(read.expect("relay did not stop").unwrap(), 0);

        connector.close();
    }

    #[tokio::test]
    async fn ssh_socket_runs_bridge() {
        let gui_dir = tempfile::tempdir().unwrap();
        let tracker = TaskTracker::new();
        let connector = Connector::new(
            ConnectorKind::SshSocket,
            "",
            gui_dir.path(),
            "S.ssh",
            SessionGate::new(),
            tracker.clone(),
        )
        .with_host_agent(Arc::new(EchoAgent));
        connector.serve(None).await.unwrap();

        let mut client = UnixStream::connect(gui_dir.path().join("S.ssh")).await.unwrap();
        client.write_all(&5u32.to_be_bytes()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut len = [0u8; 4];
        client.read_exact(&mut len).await.unwrap();
        assert_eq!(u32::from_be_bytes(len), 5);
        let mut resp = [0u8; 5];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(&resp, b"hello");

        connector.close();
    }

    #[tokio::test]
    async fn cygwin_socket_hands_shake_then_bridges() {
        let gui_dir = tempfile::tempdir().unwrap();
        let tracker = TaskTracker::new();
        let connector = Connector::new(
            ConnectorKind::SshCygwinSocket,
            "",
            gui_dir.path(),
            "S.ssh.cyg",
            SessionGate::new(),
            tracker.clone(),
        )
        .with_host_agent(Arc::new(EchoAgent));
        connector.serve(None).await.unwrap();

        // parse the socket file the way a Cygwin client would
        let content = std::fs::read_to_string(gui_dir.path().join("S.ssh.cyg")).unwrap();
        let rest = content.strip_prefix("!<socket >").unwrap();
        let (port, nonce_str) = rest.split_once(" s ").unwrap();
        let mut nonce = [0u8; 16];
        for (i, word) in nonce_str.split('-').enumerate() {
            let value = u32::from_str_radix(word, 16).unwrap();
            nonce[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }

        let mut client =
            tokio::net::TcpStream::connect(("127.0.0.1", port.parse::<u16>().unwrap()))
                .await
                .unwrap();
        client.write_all(&nonce).await.unwrap();
        let mut echo = [0u8; 16];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(echo, nonce);
        client.write_all(&[0u8; 12]).await.unwrap();
        let mut creds = [0u8; 12];
        client.read_exact(&mut creds).await.unwrap();

        client.write_all(&3u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        let mut len = [0u8; 4];
        client.read_exact(&mut len).await.unwrap();
        let mut resp = vec![0u8; u32::from_be_bytes(len) as usize];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, b"abc");

        connector.close();
        assert!(!gui_dir.path().join("S.ssh.cyg").exists());
    }

    #[tokio::test]
    async fn double_serve_is_refused() {
        let gui_dir = tempfile::tempdir().unwrap();
        let tracker = TaskTracker::new();
        let connector = Connector::new(
            ConnectorKind::SshSocket,
            "",
            gui_dir.path(),
            "S.dup",
            SessionGate::new(),
            tracker.clone(),
        );
        connector.serve(None).await.unwrap();
        assert!(connector.serve(None).await.is_err());
        connector.close();
    }
}
