//! Error types for the HTTP front end.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors surfaced before a debug stream is upgraded.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed query parameters or an unsupported runtime scheme.
    #[error("{0}")]
    BadRequest(String),

    /// The connection could not be upgraded.
    #[error(transparent)]
    Stream(#[from] kctldbg_stream::StreamError),

    /// A runtime adapter failed before the stream was upgraded.
    #[error(transparent)]
    Runtime(#[from] kctldbg_runtime::RuntimeError),

    /// Audit FIFO setup failed.
    #[error("audit setup failed; {0}")]
    AuditSetup(String),

    /// The listener could not be bound.
    #[error("failed to bind {address}; {source}")]
    Bind {
        /// Configured listen address.
        address: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Accept-loop IO failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Strips colons from an error body. The upgradeable-stream path on the
/// client side treats a colon as a typed-payload delimiter, so a colon in a
/// plain 400 body gets misparsed.
#[must_use]
pub fn sanitize_error(message: &str) -> String {
    message.replace(':', "")
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, sanitize_error(&self.to_string())).into_response()
    }
}
