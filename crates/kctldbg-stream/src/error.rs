//! Error types for stream upgrading.

use thiserror::Error;

/// Result type alias for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors that can occur while upgrading or pumping a debug stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The request is not an upgrade request.
    #[error("request is not an upgrade request")]
    NotAnUpgrade,

    /// The client offered no supported subprotocol.
    #[error("unable to negotiate a stream protocol; client offered {0:?}")]
    ProtocolNegotiation(Vec<String>),

    /// The upgraded IO did not become available in time.
    #[error("stream creation timed out")]
    CreationTimeout,

    /// IO failure on the upgraded connection.
    #[error("stream io error: {0}")]
    Io(#[from] std::io::Error),

    /// The upgrade handshake failed.
    #[error("upgrade failed: {0}")]
    Upgrade(#[from] hyper::Error),

    /// A response could not be constructed.
    #[error("failed to build upgrade response: {0}")]
    Response(#[from] axum::http::Error),
}
