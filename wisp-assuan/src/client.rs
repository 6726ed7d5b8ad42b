//! Client side of an Assuan connection.
//!
//! After the greeting the two peers are not symmetric; [`Session`] is the
//! client half: it issues commands, collects `D` data, and answers the
//! server's `INQUIRE` callbacks.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::pipe::Pipe;
use crate::{Error, error};

/// A value used to answer a server inquiry, keyed by inquiry keyword.
pub enum Responder {
    /// A byte payload sent as-is.
    Bytes(Vec<u8>),
    /// A reader streamed in chunks until EOF.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    /// A deferred textual value, rendered when the inquiry arrives.
    Text(Box<dyn Fn() -> Vec<u8> + Send>),
}

impl Responder {
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        Responder::Text(Box::new(move || value.clone().into_bytes()))
    }
}

/// An alive client connection.
pub struct Session<R, W> {
    pipe: Pipe<R, W>,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Start a session on the given stream halves, consuming the server's
    /// greeting line (its content is advisory).
    pub async fn init(read: R, write: W) -> Result<Self, Error> {
        let mut pipe = Pipe::new(read, write);
        let (cmd, _) = pipe.read_raw_line().await?;
        trace!(greeting = %cmd, "session started");
        Ok(Self { pipe })
    }

    /// Direct access to the underlying framer.
    pub fn pipe(&mut self) -> &mut Pipe<R, W> {
        &mut self.pipe
    }

    /// Send a command and collect the response: accumulated `D` data on
    /// `OK`, a decoded structured error on `ERR`.
    pub async fn simple_cmd(&mut self, cmd: &str, params: &str) -> Result<Vec<u8>, Error> {
        trace!(%cmd, "sending command");
        self.pipe.write_line(cmd, params).await?;
        let mut data = Vec::new();
        loop {
            let (scmd, sparams) = self.pipe.read_raw_line().await?;
            match scmd.as_str() {
                "OK" => return Ok(data),
                "ERR" => {
                    let params = String::from_utf8_lossy(&sparams);
                    debug!(%cmd, err = %params, "server returned ERR");
                    return Err(error::decode_err_params(&params)?.into());
                }
                "D" => data.extend_from_slice(&crate::escape::unescape_bytes(&sparams)?),
                // INQUIRE is not expected here; anything else is chatter
                _ => trace!(ignored = %scmd, "ignoring line in simple command"),
            }
        }
    }

    /// Send a command and answer the server's inquiries from `responders`.
    ///
    /// An inquiry for a keyword with no responder is answered with `CAN` and
    /// surfaces [`Error::MissingInquireData`].
    pub async fn transact(
        &mut self,
        cmd: &str,
        params: &str,
        mut responders: HashMap<String, Responder>,
    ) -> Result<Vec<u8>, Error> {
        trace!(%cmd, "starting transaction");
        self.pipe.write_line(cmd, params).await?;
        let mut data = Vec::new();
        loop {
            let (scmd, sparams) = self.pipe.read_raw_line().await?;
            match scmd.as_str() {
                "OK" => return Ok(data),
                "ERR" => {
                    let params = String::from_utf8_lossy(&sparams);
                    debug!(%cmd, err = %params, "server returned ERR");
                    return Err(error::decode_err_params(&params)?.into());
                }
                "D" => data.extend_from_slice(&crate::escape::unescape_bytes(&sparams)?),
                "INQUIRE" => {
                    let keyword = String::from_utf8_lossy(&sparams).trim().to_string();
                    match responders.get_mut(&keyword) {
                        Some(Responder::Bytes(bytes)) => {
                            self.pipe.write_data(bytes).await?;
                        }
                        Some(Responder::Stream(reader)) => {
                            self.pipe.write_data_reader(reader.as_mut()).await?;
                        }
                        Some(Responder::Text(render)) => {
                            let bytes = render();
                            self.pipe.write_data(&bytes).await?;
                        }
                        None => {
                            debug!(%keyword, "no responder for inquiry");
                            self.pipe.write_line("CAN", "").await?;
                            return Err(Error::MissingInquireData(keyword));
                        }
                    }
                    self.pipe.write_line("END", "").await?;
                }
                _ => trace!(ignored = %scmd, "ignoring line in transaction"),
            }
        }
    }

    /// Send `RESET`: the server releases per-connection resources.
    pub async fn reset(&mut self) -> Result<(), Error> {
        self.simple_cmd("RESET", "").await.map(|_| ())
    }

    /// Set a connection option (`OPTION name = value`).
    pub async fn option(&mut self, name: &str, value: &str) -> Result<(), Error> {
        self.simple_cmd("OPTION", &format!("{name} = {value}"))
            .await
            .map(|_| ())
    }

    /// Send `BYE` and drop the transport.  The server's final `OK` is not
    /// waited for.
    pub async fn close(mut self) -> Result<(), Error> {
        debug!("closing session");
        self.pipe.write_line("BYE", "").await
    }
}
