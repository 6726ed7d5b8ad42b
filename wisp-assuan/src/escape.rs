//! Percent escaping for Assuan parameters.
//!
//! Writers escape exactly CR, LF, `%` and backslash; readers accept any
//! `%HH` sequence, same as percent-decoding the path part of a URL.

use crate::Error;

/// Percent-encode a byte payload (data chunks may carry arbitrary bytes).
///
/// All backslashes are escaped, not only trailing ones, which keeps the
/// codec symmetric.
pub fn escape_bytes(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for b in raw {
        match b {
            b'\r' => out.extend_from_slice(b"%0D"),
            b'\n' => out.extend_from_slice(b"%0A"),
            b'%' => out.extend_from_slice(b"%25"),
            b'\\' => out.extend_from_slice(b"%5C"),
            _ => out.push(*b),
        }
    }
    out
}

/// Reverse [`escape_bytes`], accepting any `%HH` escape.
pub fn unescape_bytes(encoded: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut i = 0;
    while i < encoded.len() {
        if encoded[i] == b'%' {
            let hi = encoded.get(i + 1).and_then(|b| (*b as char).to_digit(16));
            let lo = encoded.get(i + 2).and_then(|b| (*b as char).to_digit(16));
            match (hi, lo) {
                (Some(hi), Some(lo)) => {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                }
                _ => {
                    return Err(Error::BadEscape(
                        String::from_utf8_lossy(encoded).into_owned(),
                    ));
                }
            }
        } else {
            out.push(encoded[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// Percent-encode `raw` for use as a command parameter.
pub fn escape(raw: &str) -> String {
    // escaping never produces non-UTF-8 output from UTF-8 input
    String::from_utf8(escape_bytes(raw.as_bytes())).expect("escaped text is UTF-8")
}

/// Reverse [`escape`], accepting any `%HH` escape.  Fails if the decoded
/// bytes are not valid UTF-8.
pub fn unescape(encoded: &str) -> Result<String, Error> {
    let decoded = unescape_bytes(encoded.as_bytes())?;
    String::from_utf8(decoded).map_err(|_| Error::BadEscape(encoded.to_string()))
}
