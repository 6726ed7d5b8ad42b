//! Assuan line protocol.
//!
//! The protocol gpg-agent speaks on its control sockets and the one a
//! pinentry speaks on its stdio: ASCII lines terminated by `\n`, at most
//! 1000 bytes each, percent-escaped parameters, `D`/`END` data transfers and
//! `INQUIRE` callbacks.  Peers are asymmetric after the greeting, so the
//! client and server sides are separate types:
//!
//! - [`Pipe`] — the shared line framer and escape codec
//! - [`client::Session`] — command/response/inquire exchanges with a server
//! - [`server::Proto`] / [`server::serve`] — command dispatch with typed
//!   per-connection state
//! - [`socket::dial`] — the file-based pseudo-socket gpg-agent listens on
//!   where AF_UNIX is unavailable

pub mod client;
pub mod error;
pub mod escape;
pub mod pipe;
pub mod server;
pub mod socket;

pub use error::{ErrorCode, ErrorSource, ProtocolError, codes, sources};
pub use escape::{escape, unescape};
pub use pipe::{MAX_LINE_LEN, Pipe};

/// Errors produced by protocol I/O and framing.
///
/// Server command handlers return this as well: a [`Error::Protocol`] value
/// is reported to the peer as an `ERR` line and the session continues, any
/// other variant tears the session down.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line (incoming or outgoing) would exceed the framer's limit.
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    /// A `%` escape with missing or non-hex digits.
    #[error("malformed percent escape in {0:?}")]
    BadEscape(String),

    /// Peer sent `CAN` in the middle of a data transfer.
    #[error("IPC call has been cancelled")]
    Canceled,

    /// Peer sent something other than `D`/`END` in the middle of a data
    /// transfer.
    #[error("unexpected IPC command {0:?}")]
    Unexpected(String),

    /// `ERR` parameters that do not parse as `<code> <description> <source>`.
    #[error("malformed ERR arguments: {0:?}")]
    MalformedErr(String),

    /// The server inquired for a keyword the caller supplied no responder
    /// for.  The transaction was answered with `CAN`.
    #[error("missing data for inquired keyword {0:?}")]
    MissingInquireData(String),

    /// A structured error, either decoded from a peer's `ERR` line or
    /// produced by a server command handler.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl Error {
    /// True for end-of-stream conditions that mean the peer simply went away.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}
