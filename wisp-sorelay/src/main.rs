//! wisp-sorelay — connect stdio to one of the daemon's sockets.
//!
//! WSL's openssh and gpg can reach a Windows-side agent only through a
//! helper that a `ProxyCommand`-style hook can spawn; this is that helper.
//! Dials either a plain AF_UNIX socket or an Assuan pseudo-socket file and
//! copies bytes both ways until one side closes.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "wisp-sorelay", version, about = "Socket relay program for WSL")]
struct Cli {
    /// Open an Assuan pseudo-socket instead of a Unix one
    #[arg(short, long)]
    assuan: bool,

    /// Turn on debugging
    #[arg(short, long)]
    debug: bool,

    /// Path to the socket
    #[arg(value_name = "path-to-socket")]
    socket: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(if cli.debug { "debug" } else { "warn" })
        .init();

    debug!(socket = %cli.socket.display(), assuan = cli.assuan, "dialing");
    if cli.assuan {
        let conn = wisp_assuan::socket::dial(&cli.socket)
            .await
            .with_context(|| format!("unable to dial socket {:?}", cli.socket))?;
        let (read, write) = conn.into_split();
        relay(read, write).await;
        return Ok(());
    }

    #[cfg(unix)]
    {
        let conn = tokio::net::UnixStream::connect(&cli.socket)
            .await
            .with_context(|| format!("unable to dial socket {:?}", cli.socket))?;
        let (read, write) = conn.into_split();
        relay(read, write).await;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("AF_UNIX sockets are not supported here; use --assuan");
    }
}

/// stdin→socket and socket→stdout, until either side reaches EOF.
async fn relay<R, W>(mut from_socket: R, mut to_socket: W)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let stdin_to_socket = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let copied = tokio::io::copy(&mut stdin, &mut to_socket).await;
        let _ = to_socket.shutdown().await;
        debug!(?copied, "stdin closed");
    });

    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; 32 * 1024];
    let mut copied: u64 = 0;
    loop {
        match from_socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stdout.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                copied += n as u64;
            }
        }
    }
    let _ = stdout.flush().await;
    debug!(copied, "socket closed");
    stdin_to_socket.abort();
}
