//! # Error Taxonomy
//!
//! Transport failures, framing failures and application-level replies are
//! kept apart: a server `-ERR` reply is an ordinary `RespValue`, and only
//! becomes an [`Error::Server`] when a caller asks for a typed accessor.

use std::io;

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by MuxKV.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection (or its pool) is shut down; calls fail fast.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Establishing a socket to `addr` failed.
    #[error("failed to dial {addr}: {source}")]
    Dial { addr: String, source: io::Error },

    /// The server rejected the connection setup (HELLO, AUTH, SELECT, TRACKING).
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Malformed or unexpected frame; fatal to the connection that saw it.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Application-level error reply extracted by an accessor.
    #[error("server error: {0}")]
    Server(String),

    /// Null reply extracted by an accessor.
    #[error("nil reply")]
    Nil,

    /// The reply variant does not match the requested accessor.
    #[error("unexpected reply type: expected {expected}, got {actual}")]
    UnexpectedType {
        expected: &'static str,
        actual: &'static str,
    },

    /// `execute_cached` was called with a command that cannot be cached.
    #[error("command is not cacheable")]
    NotCacheable,

    /// Keys of a request do not hash to the same cluster slot.
    #[error("keys in request do not hash to the same slot")]
    CrossSlot,

    /// The current topology has no owner for the slot.
    #[error("slot {0} is not served by any known node")]
    SlotUnassigned(u16),

    /// Cluster topology discovery failed.
    #[error("cluster topology error: {0}")]
    Topology(String),

    /// The caller's deadline elapsed before the reply arrived.
    #[error("deadline elapsed before the reply arrived")]
    Timeout,

    /// TLS setup or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// Address could not be parsed as `host:port`.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// RESP framing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid frame type byte 0x{0:02x}")]
    InvalidType(u8),

    #[error("invalid length {0}")]
    InvalidLength(i64),

    #[error("invalid integer")]
    InvalidInteger,

    #[error("invalid double")]
    InvalidDouble,

    #[error("invalid boolean")]
    InvalidBoolean,

    #[error("missing CRLF terminator")]
    MissingCrlf,

    #[error("frame nesting deeper than {0}")]
    TooDeep(usize),

    #[error("reply received with no request outstanding")]
    UnsolicitedReply,
}

/// Returns true when the error is the nil sentinel produced by accessors.
pub fn is_nil(err: &Error) -> bool {
    matches!(err, Error::Nil)
}

impl Error {
    /// Returns true for failures that took the underlying connection down.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::Io(_) | Error::Protocol(_) | Error::Dial { .. }
        )
    }
}
