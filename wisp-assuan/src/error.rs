//! Structured protocol errors.
//!
//! On the wire an error is a single 32-bit integer packing a 7-bit source
//! and a 16-bit code (8 bits are reserved), plus a human-readable
//! description and a bracketed source name:
//!
//! ```text
//! ERR 536871187 Unknown IPC command <User defined source 1>
//! ```

use crate::Error;

/// Error source as defined by libgpg-error (7 bits on the wire).
pub type ErrorSource = u8;

/// Error code as defined by libgpg-error (16 bits on the wire).
pub type ErrorCode = u16;

const SRC_MASK: u32 = 127;
const SRC_SHIFT: u32 = 24;
const CODE_MASK: u32 = 65535;

/// Wire error sources used by this workspace.
pub mod sources {
    use super::ErrorSource;

    /// `GPG_ERR_SOURCE_PINENTRY`.
    pub const PINENTRY: ErrorSource = 5;
    /// `GPG_ERR_SOURCE_USER_1`; rendered by GnuPG as "User defined source 1"
    /// and conventionally used for Assuan-level errors.
    pub const ASSUAN: ErrorSource = 32;
}

/// Wire error codes used by this workspace (libgpg-error values).
pub mod codes {
    use super::ErrorCode;

    pub const NOT_FOUND: ErrorCode = 27;
    pub const NOT_IMPLEMENTED: ErrorCode = 69;
    pub const CANCELED: ErrorCode = 99;
    pub const UNKNOWN_OPTION: ErrorCode = 174;
    pub const ASS_GENERAL: ErrorCode = 257;
    pub const ASS_INV_VALUE: ErrorCode = 261;
    pub const ASS_READ_ERROR: ErrorCode = 270;
    pub const ASS_WRITE_ERROR: ErrorCode = 271;
    pub const ASS_UNEXPECTED_CMD: ErrorCode = 274;
    pub const ASS_UNKNOWN_CMD: ErrorCode = 275;
    pub const ASS_CANCELED: ErrorCode = 277;
    pub const ASS_PARAMETER: ErrorCode = 280;
}

/// A structured error exchanged over the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub source: ErrorSource,
    pub code: ErrorCode,
    pub src_name: String,
    pub message: String,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.src_name, self.message)
    }
}

impl std::error::Error for ProtocolError {}

impl ProtocolError {
    /// An Assuan-sourced error with the conventional source name.
    pub fn assuan(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            source: sources::ASSUAN,
            code,
            src_name: "assuan".to_string(),
            message: message.into(),
        }
    }

    /// A pinentry-sourced error.
    pub fn pinentry(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            source: sources::PINENTRY,
            code,
            src_name: "pinentry".to_string(),
            message: message.into(),
        }
    }

    /// The packed 32-bit value sent on the wire.
    pub fn wire_code(&self) -> u32 {
        compose(self.source, self.code)
    }
}

/// Pack a (source, code) pair into the wire representation.
pub fn compose(source: ErrorSource, code: ErrorCode) -> u32 {
    (u32::from(source) & SRC_MASK) << SRC_SHIFT | (u32::from(code) & CODE_MASK)
}

/// Split a wire value back into its (source, code) pair.
pub fn split(wire: u32) -> (ErrorSource, ErrorCode) {
    ((wire >> SRC_SHIFT) as ErrorSource, (wire & CODE_MASK) as ErrorCode)
}

fn map_source_name(name: &str) -> &str {
    // GnuPG prints the user-defined source Assuan errors travel under by its
    // generic name.
    if name.eq_ignore_ascii_case("user defined source 1") {
        "Assuan"
    } else {
        name
    }
}

/// Decode the parameters of an `ERR` line: `<code> <description> <source>`.
///
/// The trailing `<source>` is optional; descriptions are free text up to it.
pub fn decode_err_params(params: &str) -> Result<ProtocolError, Error> {
    let params = params.trim();
    let (code_str, rest) = params
        .split_once(' ')
        .ok_or_else(|| Error::MalformedErr(params.to_string()))?;
    let wire: u32 = code_str
        .parse()
        .map_err(|_| Error::MalformedErr(params.to_string()))?;

    let rest = rest.trim();
    let (message, src_name) = match (rest.rfind('<'), rest.ends_with('>')) {
        (Some(open), true) => (
            rest[..open].trim(),
            map_source_name(&rest[open + 1..rest.len() - 1]),
        ),
        _ => (rest, "unknown source"),
    };

    let (source, code) = split(wire);
    Ok(ProtocolError {
        source,
        code,
        src_name: src_name.to_string(),
        message: message.to_string(),
    })
}
