//! Dialer for gpg-agent's file-based pseudo-socket.
//!
//! Where AF_UNIX is unavailable, gpg-agent publishes its control socket as a
//! plain file: the first line is a loopback TCP port in ASCII decimal, the
//! next 16 bytes are a nonce the client must present after connecting.
//! Trailing bytes are ignored.

use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Nonce length shared by the Assuan and Cygwin socket-file conventions.
pub const NONCE_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("cannot open socket file {path:?}: {source}")]
    CannotOpenFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse port from socket file {0:?}")]
    PortParse(std::path::PathBuf),

    #[error("socket file {path:?} holds {got} nonce bytes, expected {NONCE_LEN}")]
    ShortNonce { path: std::path::PathBuf, got: usize },

    #[error("cannot dial 127.0.0.1:{port}: {source}")]
    DialFailed { port: u16, source: std::io::Error },
}

/// Read `path`, connect to the advertised loopback port and present the
/// nonce.  Returns the ready-to-use connection.
pub async fn dial(path: impl AsRef<Path>) -> Result<TcpStream, DialError> {
    let path = path.as_ref();
    let data = tokio::fs::read(path)
        .await
        .map_err(|source| DialError::CannotOpenFile {
            path: path.to_path_buf(),
            source,
        })?;

    let line_end = data
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| DialError::PortParse(path.to_path_buf()))?;
    let port: u16 = std::str::from_utf8(&data[..line_end])
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| DialError::PortParse(path.to_path_buf()))?;

    let nonce = &data[line_end + 1..];
    if nonce.len() < NONCE_LEN {
        return Err(DialError::ShortNonce {
            path: path.to_path_buf(),
            got: nonce.len(),
        });
    }
    let nonce = &nonce[..NONCE_LEN];

    debug!(path = %path.display(), port, "dialing assuan socket");

    let mut conn = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|source| DialError::DialFailed { port, source })?;
    conn.write_all(nonce)
        .await
        .map_err(|source| DialError::DialFailed { port, source })?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn socket_file(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn dials_and_presents_nonce() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let nonce: [u8; NONCE_LEN] = *b"0123456789abcdef";

        let mut content = format!("{port}\n").into_bytes();
        content.extend_from_slice(&nonce);
        content.extend_from_slice(b"trailing junk is ignored");
        let file = socket_file(&content);

        let accept = async {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut got = [0u8; NONCE_LEN];
            conn.read_exact(&mut got).await.unwrap();
            got
        };
        let (got, dialed) = tokio::join!(accept, dial(file.path()));
        dialed.unwrap();
        assert_eq!(got, nonce);
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = dial("/nonexistent/S.gpg-agent").await.unwrap_err();
        assert!(matches!(err, DialError::CannotOpenFile { .. }));
    }

    #[tokio::test]
    async fn bad_port_is_reported() {
        let file = socket_file(b"not-a-port\n0123456789abcdef");
        assert!(matches!(
            dial(file.path()).await.unwrap_err(),
            DialError::PortParse(_)
        ));
    }

    #[tokio::test]
    async fn short_nonce_is_reported() {
        let file = socket_file(b"4242\nshort");
        assert!(matches!(
            dial(file.path()).await.unwrap_err(),
            DialError::ShortNonce { got: 5, .. }
        ));
    }
}
