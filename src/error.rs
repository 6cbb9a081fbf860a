//! Error types for mqhive.

use thiserror::Error;

/// Main error type for broker operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("bad username or password")]
    BadCredentials,

    #[error("store error: {0}")]
    Store(#[from] crate::persistence::StoreError),
}

/// Protocol violations. Fatal to the offending session only.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Receive-Maximum must not be zero")]
    ReceiveMaximumZero,

    #[error("unexpected {0} packet")]
    UnexpectedPacket(&'static str),

    #[error("no session registered for this id")]
    UnknownSession,
}

pub type Result<T> = std::result::Result<T, Error>;
