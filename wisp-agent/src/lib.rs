//! Supervision of a gpg-agent process and the IPC surface around it.
//!
//! [`Agent`] owns the upstream process and one [`Connector`] per exposed
//! endpoint.  Relayed endpoints copy bytes between a local listener and the
//! upstream's Assuan pseudo-socket; SSH endpoints speak agent framing and
//! forward each request to the host SSH agent through
//! [`pageant::HostAgent`].
//!
//! ## Lifecycle
//!
//! 1. [`Agent::new`] — probe the gpg-agent binary, build connectors, clear
//!    stale sockets.
//! 2. [`Agent::start`] — launch the agent daemonized, wait for its control
//!    socket, verify it with an Assuan `RESET`.
//! 3. [`Agent::serve`] / [`Agent::close`] — bring individual endpoints up
//!    and down.
//! 4. [`Agent::stop`] — close every endpoint, ask the agent to exit with
//!    `KILLAGENT`, and fall back to killing it.
//!
//! Every accepted connection is a task counted by one shared
//! [`tokio_util::task::TaskTracker`]; no connection task outlives
//! [`Agent::stop`].

pub mod connector;
pub mod cygwin;
pub mod fswait;
pub mod pageant;
pub mod ring;
pub mod supervisor;

pub use connector::{Connector, ConnectorKind};
pub use supervisor::Agent;
