use std::num::TryFromIntError;
use std::string::FromUtf8Error;

use thiserror::Error;

/// Errors produced while decoding RESP frames from the wire.
#[derive(Debug, Error)]
pub enum RelinkParseError {
    /// Not enough buffered data to decode a complete frame. The reader keeps
    /// the buffer and waits for more bytes; this never reaches callers.
    #[error("not enough data to decode a frame")]
    Incomplete,

    #[error("protocol error: {0}")]
    Parse(String),

    #[error("unimplemented frame type")]
    Unimplemented,

    #[error("invalid utf-8 in frame: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),

    #[error("invalid frame length: {0}")]
    InvalidLength(#[from] TryFromIntError),
}

/// Errors surfaced through command futures and connection notifications.
#[derive(Debug, Error)]
pub enum RelinkConnectionError {
    /// Socket-level failure while connecting or connected. Always retried by
    /// the lifecycle manager, subject to the attempt budget.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// The connection carrying this command was closed before its reply
    /// arrived.
    #[error("redis connection lost")]
    ConnectionLost,

    /// A reply was decoded with no pending command to match it. Fatal to the
    /// connection instance; the lifecycle manager reconnects.
    #[error("reply received with no pending command; connection out of sync")]
    OutOfSync,

    /// Authentication or database selection was rejected during connection
    /// setup. Treated exactly like a connection failure.
    #[error("connection setup failed: {0}")]
    Setup(String),

    /// The reconnect attempt budget is exhausted. Terminal until `reconnect()`
    /// is called manually.
    #[error("redis connection in failed state")]
    ClientFailed,

    /// An application-level error reply to a single command. Does not affect
    /// connection state.
    #[error("command error: {0}")]
    Command(String),

    #[error("invalid frame type for this operation")]
    InvalidFrameType,

    #[error(transparent)]
    Parse(#[from] RelinkParseError),
}

/// Umbrella error for binary entry points.
#[derive(Debug, Error)]
pub enum RelinkClientError {
    #[error(transparent)]
    Connection(#[from] RelinkConnectionError),

    #[error(transparent)]
    Parse(#[from] RelinkParseError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
