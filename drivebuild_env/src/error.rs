//! Error types for the DriveBuild transport layer.

use thiserror::Error;

/// Errors that can occur while framing, sending or decoding messages.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Underlying socket failure that is not a graceful close
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed or reset the connection
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Payload exceeds the framing limit and was never sent
    #[error("Message of {size} bytes exceeds the limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// Length header could not be parsed
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Payload is not the expected protocol-buffer message
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Request stream did not follow action/count/items
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a connection-closed error.
    pub fn closed(peer: impl std::fmt::Display) -> Self {
        Self::ConnectionClosed(peer.to_string())
    }

    /// Creates a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True when the error means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed(_) => true,
            Self::Io(e) => is_disconnect_kind(e.kind()),
            _ => false,
        }
    }
}

/// I/O error kinds that signal a peer close rather than a local fault.
pub(crate) fn is_disconnect_kind(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        kind,
        ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof | NotConnected
    )
}
