// ABOUTME: Error taxonomy for session, transport, and payload failures
// ABOUTME: Maps each error kind onto the HTTP status the dispatcher answers with

use std::io;
use thiserror::Error;

/// Error type covering every failure surfaced by the engine.
///
/// Application-facing operations (`accept`, `next_reader`, `next_writer`)
/// return these directly and never panic. Dispatch maps them onto HTTP
/// status codes via [`Error::http_status`].
#[derive(Debug, Error)]
pub enum Error {
    /// Decoder saw a malformed frame. Fatal for the transport connection
    /// it arrived on.
    #[error("invalid payload")]
    InvalidPayload,

    /// Request carried a session id that is not in the directory.
    #[error("invalid sid: {0}")]
    InvalidSid(String),

    /// Request named a transport that is not registered, or one that is
    /// not a legal upgrade target for the session.
    #[error("invalid transport: {0}")]
    InvalidTransport(String),

    /// The request-check callback rejected the handshake.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No packet arrived within the liveness window.
    #[error("liveness timeout")]
    Timeout,

    /// Operation issued against a closed session or transport.
    #[error("closed")]
    Closed,

    /// Underlying transport I/O failure.
    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status code the dispatcher answers with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidPayload
            | Error::InvalidSid(_)
            | Error::InvalidTransport(_)
            | Error::Timeout
            | Error::Closed => 400,
            Error::Unauthorized(_) | Error::Io(_) => 502,
        }
    }
}

// A session stores the error it closed with and hands it back from every
// subsequent call, so the kind must be reproducible. `io::Error` is not
// `Clone`; rebuild it from kind and message.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::InvalidPayload => Error::InvalidPayload,
            Error::InvalidSid(sid) => Error::InvalidSid(sid.clone()),
            Error::InvalidTransport(name) => Error::InvalidTransport(name.clone()),
            Error::Unauthorized(reason) => Error::Unauthorized(reason.clone()),
            Error::Timeout => Error::Timeout,
            Error::Closed => Error::Closed,
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}
