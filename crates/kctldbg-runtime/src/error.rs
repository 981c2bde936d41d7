//! Error types for runtime adapters.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while driving a container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The target URI names a runtime this agent does not speak.
    #[error("only docker and containerd container runtimes are supported, got {0}")]
    UnsupportedScheme(String),

    /// The runtime daemon cannot be reached.
    #[error("runtime unavailable at {endpoint}: {reason}")]
    Unavailable {
        /// Socket the connection was attempted against.
        endpoint: String,
        /// Failure detail.
        reason: String,
    },

    /// The target container does not exist.
    #[error("target container {0} not found")]
    TargetNotFound(String),

    /// The target container exists but cannot host a debug session.
    #[error("target container {id} is not debuggable; {reason}")]
    InvalidTarget {
        /// Target container id.
        id: String,
        /// Why the session must fail.
        reason: String,
    },

    /// The image pull was rejected or failed.
    #[error("failed to pull image {image}; {reason}")]
    Pull {
        /// Image reference.
        image: String,
        /// Failure detail.
        reason: String,
    },

    /// The runtime rejected creating or starting the debug container.
    #[error("runtime rejected debug container: {0}")]
    Rejected(String),

    /// The host LXCFS mount is missing.
    #[error("/var/lib/lxc/lxcfs is not a mount point, run lxcfs on the host before debugging")]
    LxcfsNotMounted,

    /// An nsenter-driven bind mount failed.
    #[error("bind mount of {file} in target mount namespace failed: {stderr}")]
    Nsenter {
        /// File being rebound.
        file: String,
        /// Stderr of the nsenter subprocess.
        stderr: String,
    },

    /// The OCI spec for the debug container could not be assembled.
    #[error("failed to assemble debug container spec: {0}")]
    Spec(String),

    /// A gRPC call to containerd failed.
    #[error("containerd request failed: {0}")]
    Grpc(#[from] tonic::Status),

    /// Local IO failure (sockets, FIFOs, proc files).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A Docker Engine API response could not be decoded.
    #[error("unexpected docker response: {0}")]
    DockerResponse(String),

    /// The session was cancelled before the operation completed.
    #[error("debug session cancelled")]
    Cancelled,
}
