//! Line framer for the Assuan command stream.
//!
//! One [`Pipe`] per connection; it is never shared between tasks.  Reads are
//! bounded so a peer that never sends a newline cannot grow the buffer past
//! the line limit.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::Error;
use crate::error::ProtocolError;
use crate::escape::{escape_bytes, unescape, unescape_bytes};

/// Maximum length of a protocol line, including the space after the command
/// and the trailing newline.
pub const MAX_LINE_LEN: usize = 1000;

/// Buffered reader/writer pair speaking Assuan framing.
pub struct Pipe<R, W> {
    reader: BufReader<R>,
    writer: W,
    max_line: usize,
}

/// A [`Pipe`] over erased stream halves, as handed to server command
/// handlers.
pub type BoxedPipe = Pipe<
    Box<dyn AsyncRead + Send + Unpin>,
    Box<dyn AsyncWrite + Send + Unpin>,
>;

impl<R, W> Pipe<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(read: R, write: W) -> Self {
        Self {
            reader: BufReader::new(read),
            writer: write,
            max_line: MAX_LINE_LEN,
        }
    }

    /// Override the line limit.  Some peers violate the 1000-byte rule; the
    /// limit can be raised before any I/O happens.
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        assert!(max_line >= 16, "line limit too small for a data line");
        self.max_line = max_line;
        self
    }

    pub fn max_line(&self) -> usize {
        self.max_line
    }

    /// Read the next message line: `(COMMAND, raw parameters)`.
    ///
    /// Empty lines, `#` comments and `S` status lines are skipped; the
    /// command token is upper-cased.  Parameters are returned still escaped.
    pub async fn read_raw_line(&mut self) -> Result<(String, Vec<u8>), Error> {
        loop {
            let mut line: Vec<u8> = Vec::new();
            let n = (&mut self.reader)
                .take(self.max_line as u64)
                .read_until(b'\n', &mut line)
                .await?;
            if n == 0 {
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            if line.last() != Some(&b'\n') {
                if n == self.max_line {
                    return Err(Error::LineTooLong(self.max_line));
                }
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if line.starts_with(b"#") || line.starts_with(b"S ") {
                continue;
            }
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            let (cmd, params) = match line.iter().position(|b| *b == b' ') {
                Some(at) => (&line[..at], line[at + 1..].to_vec()),
                None => (&line[..], Vec::new()),
            };
            let cmd = String::from_utf8_lossy(cmd).to_ascii_uppercase();
            return Ok((cmd, params));
        }
    }

    /// Read the next message line with parameters percent-decoded.
    pub async fn read_line(&mut self) -> Result<(String, String), Error> {
        let (cmd, raw) = self.read_raw_line().await?;
        let params = unescape(&String::from_utf8_lossy(&raw))?;
        Ok((cmd, params))
    }

    /// Write `COMMAND [params]\n`, percent-escaping the parameters.
    ///
    /// Refuses to frame a line longer than the limit.
    pub async fn write_line(&mut self, cmd: &str, params: &str) -> Result<(), Error> {
        let cmd = cmd.to_ascii_uppercase();
        let escaped = crate::escape(params);

        let framed_len = if escaped.is_empty() {
            cmd.len() + 1
        } else {
            cmd.len() + 1 + escaped.len() + 1
        };
        if framed_len > self.max_line {
            return Err(Error::LineTooLong(self.max_line));
        }

        let mut line = Vec::with_capacity(framed_len);
        line.extend_from_slice(cmd.as_bytes());
        if !escaped.is_empty() {
            line.push(b' ');
            line.extend_from_slice(escaped.as_bytes());
        }
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send a byte payload as one or more `D ` lines.
    ///
    /// An error can occur after some chunks went out; callers should `CAN`
    /// the transaction rather than retry.
    pub async fn write_data(&mut self, payload: &[u8]) -> Result<(), Error> {
        let escaped = escape_bytes(payload);
        let chunk_len = self.max_line - 3; // "D " and the newline
        let mut rest = escaped.as_slice();
        while !rest.is_empty() {
            let mut take = chunk_len.min(rest.len());
            // never split a %HH escape across two lines
            if take < rest.len() {
                if rest[take - 1] == b'%' {
                    take -= 1;
                } else if take >= 2 && rest[take - 2] == b'%' {
                    take -= 2;
                }
            }
            let mut line = Vec::with_capacity(take + 3);
            line.extend_from_slice(b"D ");
            line.extend_from_slice(&rest[..take]);
            line.push(b'\n');
            self.writer.write_all(&line).await?;
            rest = &rest[take..];
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Like [`write_data`](Self::write_data) but streams from a reader until
    /// EOF.  Chunks are sized so even a fully-escaped read fits one line.
    pub async fn write_data_reader<I>(&mut self, input: &mut I) -> Result<(), Error>
    where
        I: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; (self.max_line - 3) / 3];
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                self.writer.flush().await?;
                return Ok(());
            }
            let escaped = escape_bytes(&buf[..n]);
            let mut line = Vec::with_capacity(escaped.len() + 3);
            line.extend_from_slice(b"D ");
            line.extend_from_slice(&escaped);
            line.push(b'\n');
            self.writer.write_all(&line).await?;
        }
    }

    /// Read a sequence of `D ` chunks terminated by `END`, concatenated and
    /// unescaped.
    pub async fn read_data(&mut self) -> Result<Vec<u8>, Error> {
        let mut data = Vec::new();
        loop {
            let (cmd, chunk) = self.read_raw_line().await?;
            match cmd.as_str() {
                "END" => return Ok(data),
                "CAN" => return Err(Error::Canceled),
                "D" => data.extend_from_slice(&unescape_bytes(&chunk)?),
                _ => return Err(Error::Unexpected(cmd)),
            }
        }
    }

    /// Write an `OK [params]` line.
    pub async fn write_ok(&mut self, params: &str) -> Result<(), Error> {
        self.write_line("OK", params).await
    }

    /// Write an `S <keyword>` status line.
    pub async fn write_status(&mut self, keyword: &str) -> Result<(), Error> {
        self.write_line("S", keyword).await
    }

    /// Write a `# <text>` comment line.
    pub async fn write_comment(&mut self, text: &str) -> Result<(), Error> {
        self.write_line("#", text).await
    }

    /// Report a structured error to the peer as an `ERR` line.
    pub async fn write_error(&mut self, err: &ProtocolError) -> Result<(), Error> {
        let params = format!("{} {} <{}>", err.wire_code(), err.message, err.src_name);
        self.write_line("ERR", &params).await
    }
}

impl BoxedPipe {
    /// Erase a bidirectional stream into a handler-friendly pipe.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Pipe::new(Box::new(read), Box::new(write))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::escape::escape;

    fn pair() -> (BoxedPipe, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        (BoxedPipe::from_stream(ours), theirs)
    }

    async fn feed(peer: &mut tokio::io::DuplexStream, text: &str) {
        use tokio::io::AsyncWriteExt;
        peer.write_all(text.as_bytes()).await.unwrap();
    }

    async fn drain(peer: &mut tokio::io::DuplexStream) -> String {
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 64 * 1024];
        let n = peer.read(&mut buf).await.unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[tokio::test]
    async fn parses_command_and_params() {
        let (mut pipe, mut peer) = pair();
        feed(&mut peer, "getinfo version\n").await;
        let (cmd, params) = pipe.read_line().await.unwrap();
        assert_eq!(cmd, "GETINFO");
        assert_eq!(params, "version");
    }

    #[tokio::test]
    async fn skips_comments_status_and_blank_lines() {
        let (mut pipe, mut peer) = pair();
        feed(&mut peer, "# greeting comment\nS KEEPALIVE\n\n  \nOK ready\n").await;
        let (cmd, params) = pipe.read_line().await.unwrap();
        assert_eq!(cmd, "OK");
        assert_eq!(params, "ready");
    }

    #[tokio::test]
    async fn rejects_overlong_incoming_line() {
        let (mut pipe, mut peer) = pair();
        let long = "X".repeat(MAX_LINE_LEN + 10);
        feed(&mut peer, &long).await;
        assert!(matches!(
            pipe.read_raw_line().await,
            Err(Error::LineTooLong(_))
        ));
    }

    #[tokio::test]
    async fn accepts_line_at_exactly_the_limit() {
        let (mut pipe, mut peer) = pair();
        // command plus params plus newline is exactly MAX_LINE_LEN bytes
        let params = "y".repeat(MAX_LINE_LEN - 3);
        feed(&mut peer, &format!("X {params}\n")).await;
        let (cmd, got) = pipe.read_line().await.unwrap();
        assert_eq!(cmd, "X");
        assert_eq!(got, params);
    }

    #[tokio::test]
    async fn refuses_overlong_outgoing_line() {
        let (mut pipe, _peer) = pair();
        let params = "z".repeat(MAX_LINE_LEN);
        assert!(matches!(
            pipe.write_line("SETDESC", &params).await,
            Err(Error::LineTooLong(_))
        ));
    }

    #[tokio::test]
    async fn write_line_escapes_parameters() {
        let (mut pipe, mut peer) = pair();
        pipe.write_line("setdesc", "two\nlines").await.unwrap();
        assert_eq!(drain(&mut peer).await, "SETDESC two%0Alines\n");
    }

    #[tokio::test]
    async fn data_chunks_concatenate_to_payload() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(4000).collect();
        let (mut pipe, peer) = pair();
        let mut peer_pipe = BoxedPipe::from_stream(peer);

        let write = async {
            pipe.write_data(&payload).await.unwrap();
            pipe.write_line("END", "").await.unwrap();
        };
        let read = peer_pipe.read_data();
        let (_, got) = tokio::join!(write, read);
        assert_eq!(got.unwrap(), payload);
    }

    #[tokio::test]
    async fn data_chunks_never_exceed_line_limit_or_split_escapes() {
        // all-percent payload escapes to 3x its size, the worst case
        let payload = vec![b'%'; 2000];
        let (mut pipe, mut peer) = pair();
        pipe.write_data(&payload).await.unwrap();
        let raw = drain(&mut peer).await;
        for line in raw.lines() {
            assert!(line.len() + 1 <= MAX_LINE_LEN, "line too long: {}", line.len());
            let body = line.strip_prefix("D ").unwrap();
            // every chunk must decode on its own
            assert!(crate::escape::unescape(body).is_ok(), "split escape in {body:?}");
        }
    }

    #[tokio::test]
    async fn read_data_cancel_and_unexpected() {
        let (mut pipe, mut peer) = pair();
        feed(&mut peer, "D abc\nCAN\n").await;
        assert!(matches!(pipe.read_data().await, Err(Error::Canceled)));

        let (mut pipe, mut peer) = pair();
        feed(&mut peer, "D abc\nGETPIN\n").await;
        assert!(matches!(pipe.read_data().await, Err(Error::Unexpected(c)) if c == "GETPIN"));
    }

    #[tokio::test]
    async fn error_line_round_trip() {
        let (mut pipe, mut peer) = pair();
        let err = ProtocolError::assuan(codes::ASS_UNKNOWN_CMD, "Unknown IPC command");
        pipe.write_error(&err).await.unwrap();
        let raw = drain(&mut peer).await;
        assert_eq!(raw, "ERR 536871187 Unknown IPC command <assuan>\n");
    }

    #[test]
    fn escape_helper_used_by_framer() {
        assert_eq!(escape("\r\n%foo\\"), "%0D%0A%25foo%5C");
    }
}
