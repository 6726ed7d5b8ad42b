//! Server side of an Assuan connection.
//!
//! A protocol is described once by a [`Proto`] value: greeting, command
//! handlers, help strings, an option setter and a factory for per-connection
//! state.  The state type is a generic parameter, so handlers get `&mut S`
//! with no downcasts.  The handler table is fixed at construction; `RESET`
//! dispatches exactly once per request — to the registered handler when one
//! exists, to a built-in no-op otherwise.

use std::collections::{BTreeMap, HashMap};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::error::{ProtocolError, codes};
use crate::Error;
use crate::pipe::BoxedPipe;

/// Boxed async command handler.
///
/// A returned [`Error::Protocol`] is reported to the peer as an `ERR` line
/// and the session continues; any other error drops the connection.
pub type Handler<S> = Box<
    dyn for<'a> Fn(&'a mut BoxedPipe, &'a mut S, &'a str) -> BoxFuture<'a, Result<(), Error>>
        + Send
        + Sync,
>;

/// Box a command-handler closure.
///
/// The explicit higher-ranked bound lets closure literals returning
/// `Box::pin(async move { … })` futures that borrow their arguments unify
/// with [`Handler`]'s signature.
pub fn handler_fn<S, F>(f: F) -> Handler<S>
where
    F: for<'a> Fn(&'a mut BoxedPipe, &'a mut S, &'a str) -> BoxFuture<'a, Result<(), Error>>
        + Send
        + Sync
        + 'static,
{
    Box::new(f)
}

/// Option setter: called for `OPTION key value` lines.
pub type OptionSetter<S> = Box<dyn Fn(&mut S, &str, &str) -> Result<(), Error> + Send + Sync>;

/// Protocol description; one instance serves any number of connections.
pub struct Proto<S> {
    greeting: String,
    handlers: BTreeMap<&'static str, Handler<S>>,
    help: BTreeMap<&'static str, Vec<&'static str>>,
    default_state: Box<dyn Fn() -> S + Send + Sync>,
    set_option: Option<OptionSetter<S>>,
}

impl<S> Proto<S> {
    pub fn new(
        greeting: impl Into<String>,
        default_state: impl Fn() -> S + Send + Sync + 'static,
    ) -> Self {
        Self {
            greeting: greeting.into(),
            handlers: BTreeMap::new(),
            help: BTreeMap::new(),
            default_state: Box::new(default_state),
            set_option: None,
        }
    }

    /// Register a command handler.  Handler names are upper-case.
    pub fn handler(mut self, name: &'static str, handler: Handler<S>) -> Self {
        self.handlers.insert(name, handler);
        self
    }

    /// Attach help lines for a command, printed as comments on `HELP <cmd>`.
    pub fn help(mut self, name: &'static str, lines: Vec<&'static str>) -> Self {
        self.help.insert(name, lines);
        self
    }

    /// Install the `OPTION` setter.
    pub fn set_option(
        mut self,
        setter: impl Fn(&mut S, &str, &str) -> Result<(), Error> + Send + Sync + 'static,
    ) -> Self {
        self.set_option = Some(Box::new(setter));
        self
    }
}

/// Commands every Assuan server understands without a registered handler.
const BUILTIN_COMMANDS: [&str; 7] = ["NOP", "OPTION", "CANCEL", "BYE", "RESET", "END", "HELP"];

/// Accept one connection: greet, then dispatch commands until the peer
/// disconnects.
///
/// Only I/O errors and non-protocol handler errors are returned; a clean
/// disconnect yields `Ok(())`.
pub async fn serve<S, St>(stream: St, proto: &Proto<S>) -> Result<(), Error>
where
    St: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut pipe = BoxedPipe::from_stream(stream);
    let mut state = (proto.default_state)();

    pipe.write_ok(&proto.greeting).await?;

    loop {
        let (cmd, params) = match pipe.read_line().await {
            Ok(line) => line,
            Err(err) if err.is_eof() => {
                trace!("peer disconnected");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match cmd.as_str() {
            "BYE" => {
                pipe.write_ok("").await?;
                debug!("session finished");
            }
            "NOP" => pipe.write_ok("").await?,
            "OPTION" => option_cmd(&mut pipe, &mut state, proto, &params).await?,
            "HELP" => help_cmd(&mut pipe, proto, &params).await?,
            "RESET" if !proto.handlers.contains_key("RESET") => {
                trace!("session reset");
                pipe.write_ok("").await?;
            }
            _ => match proto.handlers.get(cmd.as_str()) {
                None => {
                    debug!(%cmd, "unknown command");
                    pipe.write_error(&ProtocolError::assuan(
                        codes::ASS_UNKNOWN_CMD,
                        "unknown IPC command",
                    ))
                    .await?;
                }
                Some(handler) => match handler(&mut pipe, &mut state, &params).await {
                    Ok(()) => pipe.write_ok("").await?,
                    Err(Error::Protocol(perr)) => {
                        debug!(%cmd, err = %perr, "handler returned protocol error");
                        pipe.write_error(&perr).await?;
                    }
                    Err(err) => {
                        debug!(%cmd, err = %err, "handler failed, dropping session");
                        return Err(err);
                    }
                },
            },
        }
    }
}

/// Request data from the client by keyword, one `INQUIRE` round per entry.
///
/// No `OK`/`ERR` is sent on completion; the caller reports the outcome.  A
/// protocol error (the client sent `CAN`) is forwarded to the peer before it
/// is returned.
pub async fn inquire(
    pipe: &mut BoxedPipe,
    keywords: &[&str],
) -> Result<HashMap<String, Vec<u8>>, Error> {
    let mut res = HashMap::new();
    for keyword in keywords {
        pipe.write_line("INQUIRE", keyword).await?;
        match pipe.read_data().await {
            Ok(data) => {
                res.insert((*keyword).to_string(), data);
            }
            Err(Error::Canceled) => {
                let perr = ProtocolError::assuan(codes::ASS_CANCELED, "IPC call has been cancelled");
                pipe.write_error(&perr).await?;
                return Err(perr.into());
            }
            Err(err) => return Err(err),
        }
    }
    Ok(res)
}

fn invalid_option_syntax() -> ProtocolError {
    ProtocolError::assuan(codes::ASS_INV_VALUE, "invalid OPTION syntax")
}

/// Split `key[ =]value` option parameters.
///
/// The value may be prefixed with `= ` (clients send `OPTION name = value`);
/// the prefix is not part of the value.
fn split_option(params: &str) -> Result<(&str, &str), ProtocolError> {
    let params = params.trim();
    let key_end = params
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .unwrap_or(params.len());
    let key = &params[..key_end];
    if key.is_empty() {
        return Err(invalid_option_syntax());
    }
    let rest = &params[key_end..];
    let value = match rest.as_bytes().first() {
        None => "",
        Some(b' ') | Some(b'=') => {
            let v = rest[1..].trim_start_matches(' ');
            v.strip_prefix('=').map(|v| v.trim_start_matches(' ')).unwrap_or(v)
        }
        Some(_) => return Err(invalid_option_syntax()),
    };
    Ok((key, value))
}

async fn option_cmd<S>(
    pipe: &mut BoxedPipe,
    state: &mut S,
    proto: &Proto<S>,
    params: &str,
) -> Result<(), Error> {
    let Some(setter) = proto.set_option.as_ref() else {
        debug!("no options supported by this protocol");
        pipe.write_error(&ProtocolError::assuan(
            codes::NOT_IMPLEMENTED,
            "not implemented",
        ))
        .await?;
        return Ok(());
    };
    let (key, value) = match split_option(params) {
        Ok(kv) => kv,
        Err(perr) => {
            debug!(params, "malformed OPTION");
            pipe.write_error(&perr).await?;
            return Ok(());
        }
    };
    trace!(key, value, "setting option");
    match setter(state, key, value) {
        Ok(()) => {}
        Err(Error::Protocol(perr)) => {
            pipe.write_error(&perr).await?;
            return Ok(());
        }
        Err(err) => return Err(err),
    }
    pipe.write_ok("").await
}

async fn help_cmd<S>(pipe: &mut BoxedPipe, proto: &Proto<S>, params: &str) -> Result<(), Error> {
    let params = params.trim();
    if !params.is_empty() {
        match proto.help.get(params) {
            None => {
                debug!(cmd = params, "help requested for unknown command");
                pipe.write_error(&ProtocolError::assuan(codes::NOT_FOUND, "not found"))
                    .await?;
            }
            Some(lines) => {
                for line in lines {
                    pipe.write_comment(line).await?;
                }
                pipe.write_ok("").await?;
            }
        }
        return Ok(());
    }
    for cmd in BUILTIN_COMMANDS {
        pipe.write_comment(cmd).await?;
    }
    for cmd in proto.handlers.keys() {
        pipe.write_comment(cmd).await?;
    }
    pipe.write_ok("").await
}
