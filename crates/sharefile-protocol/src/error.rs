//! Closed error taxonomy shared by every transport-engine crate.

use thiserror::Error;

/// The single error type surfaced across signal codec, rendezvous client,
/// peer session and file transfer. Kept as one closed set rather than one
/// enum per crate: failures at any layer ultimately resolve to the same
/// small vocabulary a caller needs to react to.
#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("decompression unavailable")]
    DecompressionUnavailable,

    #[error("not connected")]
    NotConnected,

    #[error("channel closed")]
    ChannelClosed,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("send queue is full")]
    QueueFull,

    #[error("cancelled")]
    Cancelled,

    #[error("peer cancelled: {0}")]
    PeerCancelled(String),

    #[error("sink error: {0}")]
    SinkError(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Result type alias used throughout the workspace's library crates.
pub type ShareResult<T> = Result<T, ErrorKind>;
