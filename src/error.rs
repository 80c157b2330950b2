//! Error taxonomy shared by the host and the operator.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised while publishing, attaching or running a session.
#[derive(Debug, Error)]
pub enum Error {
    /// The rendezvous address is already bound by another publication.
    #[error("address {0} is already in use")]
    AddressInUse(SocketAddr),

    /// The peer is unreachable or went away in the middle of a call.
    #[error("connection error: {0}")]
    Connection(String),

    /// The session handle was already taken by another operator. Worth trying again.
    #[error("session busy: {0}")]
    Busy(String),

    /// The peer does not implement the requested method or capability.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A relayed shell command exited unsuccessfully.
    #[error("command `{command}` failed: {status}")]
    Subprocess { command: String, status: String },

    /// The evaluator returned an error. Teardown has already run.
    #[error("evaluator failed: {0}")]
    Evaluator(Box<dyn std::error::Error>),

    #[error("rpc error: {0}")]
    Rpc(capnp::Error),

    #[error("unable to spawn task: {0}")]
    Spawn(#[from] futures::task::SpawnError),

    #[error(transparent)]
    Io(std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the error means the peer could not be reached.
    ///
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Whether attaching again later may succeed. The operator only retries on these.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Busy(_))
    }
}

impl From<capnp::Error> for Error {
    fn from(err: capnp::Error) -> Self {
        match err.kind {
            capnp::ErrorKind::Disconnected => Error::Connection(err.extra),
            capnp::ErrorKind::Unimplemented => Error::Unsupported(err.extra),
            capnp::ErrorKind::Overloaded => Error::Busy(err.extra),
            _ => Error::Rpc(err),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
            | BrokenPipe | UnexpectedEof | TimedOut => Error::Connection(err.to_string()),
            _ => Error::Io(err),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error::Rpc(err.into())
    }
}

impl From<Error> for capnp::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Connection(msg) => capnp::Error::disconnected(msg),
            Error::Unsupported(msg) => capnp::Error::unimplemented(msg),
            Error::Busy(msg) => capnp::Error::overloaded(msg),
            Error::Rpc(err) => err,
            other => capnp::Error::failed(other.to_string()),
        }
    }
}
