//! Cygwin pseudo-socket convention.
//!
//! A Cygwin "AF_UNIX socket" is a plain file containing
//! `!<socket >PORT s NONCE` flagged system+read-only.  Clients parse the
//! file, connect to the loopback port, echo the 16-byte nonce and exchange a
//! 12-byte `pid:uid:gid` credentials block before any payload flows.

use std::path::Path;

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Cygwin handshake nonce length.
pub const NONCE_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CygwinError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid nonce received")]
    InvalidNonce,
}

/// Render a nonce the way Cygwin prints it: four little-endian 32-bit words
/// as 8 hex digits each, joined by `-` (35 characters).
pub fn nonce_string(nonce: &[u8; NONCE_LEN]) -> String {
    let mut out = String::with_capacity(35);
    for (i, word) in nonce.chunks_exact(4).enumerate() {
        if i != 0 {
            out.push('-');
        }
        let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        out.push_str(&format!("{value:08x}"));
    }
    out
}

/// Create the socket file for `port` with a fresh random nonce.
///
/// The file is written mode 0600 and, on Windows, flagged
/// system + read-only as Cygwin expects.
pub async fn create_socket_file(
    path: impl AsRef<Path>,
    port: u16,
) -> Result<[u8; NONCE_LEN], CygwinError> {
    let path = path.as_ref();
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);

    let content = format!("!<socket >{port} s {}", nonce_string(&nonce));
    tokio::fs::write(path, content.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    #[cfg(windows)]
    set_system_readonly(path)?;

    debug!(path = %path.display(), port, "created cygwin socket file");
    Ok(nonce)
}

#[cfg(windows)]
fn set_system_readonly(path: &Path) -> std::io::Result<()> {
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Storage::FileSystem::{
        FILE_ATTRIBUTE_READONLY, FILE_ATTRIBUTE_SYSTEM, SetFileAttributesW,
    };

    let wide: Vec<u16> = path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    // SAFETY: wide is a NUL-terminated UTF-16 path owned by this frame.
    let ok = unsafe {
        SetFileAttributesW(wide.as_ptr(), FILE_ATTRIBUTE_SYSTEM | FILE_ATTRIBUTE_READONLY)
    };
    if ok == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Server side of the Cygwin handshake.
///
/// Reads the client's nonce and refuses the connection on mismatch; echoes
/// the nonce, then mirrors the client's 12-byte credentials block with our
/// own pid in the first four bytes.
pub async fn perform_handshake<S>(
    stream: &mut S,
    nonce: &[u8; NONCE_LEN],
) -> Result<(), CygwinError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut received = [0u8; NONCE_LEN];
    stream.read_exact(&mut received).await?;
    if &received != nonce {
        debug!(
            expected = %nonce_string(nonce),
            got = %nonce_string(&received),
            "cygwin nonce mismatch"
        );
        return Err(CygwinError::InvalidNonce);
    }
    stream.write_all(nonce).await?;

    let mut creds = [0u8; 12];
    stream.read_exact(&mut creds).await?;
    creds[..4].copy_from_slice(&std::process::id().to_le_bytes());
    stream.write_all(&creds).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_string_is_little_endian_hex_words() {
        let nonce: [u8; NONCE_LEN] = [
            0x01, 0x02, 0x03, 0x04, //
            0xaa, 0xbb, 0xcc, 0xdd, //
            0x00, 0x00, 0x00, 0x00, //
            0xff, 0x00, 0x00, 0x00,
        ];
        let s = nonce_string(&nonce);
        assert_eq!(s, "04030201-ddccbbaa-00000000-000000ff");
        assert_eq!(s.len(), 35);
    }

    #[tokio::test]
    async fn socket_file_has_expected_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("S.test.cyg");
        let nonce = create_socket_file(&path, 4242).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("!<socket >4242 s {}", nonce_string(&nonce)));
    }

    #[tokio::test]
    async fn handshake_round_trip() {
        let nonce = [7u8; NONCE_LEN];
        let (mut server, mut client) = tokio::io::duplex(256);

        let client_side = async {
            client.write_all(&nonce).await.unwrap();
            let mut echo = [0u8; NONCE_LEN];
            client.read_exact(&mut echo).await.unwrap();
            assert_eq!(echo, nonce);

            let creds = [9u8; 12];
            client.write_all(&creds).await.unwrap();
            let mut back = [0u8; 12];
            client.read_exact(&mut back).await.unwrap();
            // server substitutes its own pid, uid/gid mirror ours
            assert_eq!(&back[..4], std::process::id().to_le_bytes());
            assert_eq!(&back[4..], &creds[4..]);
        };
        let (res, ()) = tokio::join!(perform_handshake(&mut server, &nonce), client_side);
        res.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_nonce() {
        let nonce = [7u8; NONCE_LEN];
        let (mut server, mut client) = tokio::io::duplex(256);
        let client_side = async {
            client.write_all(&[8u8; NONCE_LEN]).await.unwrap();
        };
        let (res, ()) = tokio::join!(perform_handshake(&mut server, &nonce), client_side);
        assert!(matches!(res, Err(CygwinError::InvalidNonce)));
    }
}
