//! Container runtime adapters.
//!
//! A debug session targets a container owned by one of two runtimes, named
//! by the scheme of the target URI (`docker://<id>` or `containerd://<id>`).
//! Both adapters implement the same [`ContainerRuntime`] contract: pull the
//! debug image, inspect the target for its init PID and mount table, then
//! create, start and attach a privileged container bound to the target's
//! network, IPC and PID namespaces, tearing everything down on any exit
//! path.
//!
//! The adapters never see the wire protocol; they read and write a
//! [`SessionIo`] handed to them by the session orchestrator.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod containerd;
pub mod docker;
pub mod error;
pub mod lxcfs;
pub mod nsenter;
pub mod nspath;

pub use error::{Result, RuntimeError};

use async_trait::async_trait;
use containerd::progress::PullTracker;
use kctldbg_stream::TerminalSize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Container runtime named by the target URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeScheme {
    /// Docker daemon (Engine API over a unix socket).
    Docker,
    /// containerd daemon (gRPC over a unix socket).
    Containerd,
}

impl std::str::FromStr for RuntimeScheme {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(Self::Docker),
            "containerd" => Ok(Self::Containerd),
            other => Err(RuntimeError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl std::fmt::Display for RuntimeScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => f.write_str("docker"),
            Self::Containerd => f.write_str("containerd"),
        }
    }
}

/// Registry credentials parsed from a `user:password` string.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    /// Registry username.
    pub username: String,
    /// Registry password or token.
    pub password: String,
}

impl RegistryAuth {
    /// Parses a `user:password` credential string.
    #[must_use]
    pub fn parse(auth_str: &str) -> Option<Self> {
        let (username, password) = auth_str.split_once(':')?;
        if username.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// What a runtime adapter learns about the target container.
#[derive(Debug, Clone, Default)]
pub struct TargetInfo {
    /// Host PID of the target's init process.
    pub pid: i64,
    /// Mountpoint destinations inside the target.
    pub mount_destinations: Vec<String>,
}

/// Audit shim wiring for the debug container.
#[derive(Debug, Clone)]
pub struct AuditBind {
    /// FIFO path, bind-mounted read-write into the debug container.
    pub fifo: PathBuf,
    /// Full argv with the shim prepended and the FIFO path substituted.
    pub argv: Vec<String>,
}

/// Immutable per-session parameters handed to an adapter.
#[derive(Debug, Clone)]
pub struct RunOpts {
    /// Target container id (scheme already stripped).
    pub container_id: String,
    /// Debug image reference.
    pub image: String,
    /// Operator command.
    pub command: Vec<String>,
    /// Registry credentials, if supplied.
    pub auth: Option<RegistryAuth>,
    /// Skip registry TLS verification.
    pub registry_skip_tls: bool,
    /// Bound on each individual runtime operation, including cleanup steps.
    pub timeout: Duration,
    /// Effective verbosity; 0 silences progress output.
    pub verbosity: u32,
    /// Operator hostname, label only.
    pub client_hostname: String,
    /// Operator username, label only.
    pub client_username: String,
    /// Audit wiring, when the shim is enabled.
    pub audit: Option<AuditBind>,
    /// Cancelled when the client disconnects or the session times out.
    pub cancel: CancellationToken,
}

impl RunOpts {
    /// The argv the debug container actually runs: the audit-wrapped
    /// command when the shim is enabled, the raw command otherwise.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        self.audit.as_ref().map_or(&self.command, |a| &a.argv)
    }
}

/// A clonable async writer shared between the progress renderer and the
/// container output pump, which write to the same client stream.
#[derive(Clone)]
pub struct SharedWriter(Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>);

impl SharedWriter {
    /// Wraps a writer.
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self(Arc::new(tokio::sync::Mutex::new(Box::new(writer))))
    }

    /// Writes the whole buffer.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error.
    pub async fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        let mut w = self.0.lock().await;
        w.write_all(data).await?;
        w.flush().await
    }

    /// Writes a string.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error.
    pub async fn write_str(&self, s: &str) -> std::io::Result<()> {
        self.write_all(s.as_bytes()).await
    }

    /// Shuts the writer down, closing the client-facing stream.
    pub async fn shutdown(&self) {
        let _ = self.0.lock().await.shutdown().await;
    }
}

impl std::fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedWriter")
    }
}

/// The session's IO endpoints as the adapters see them.
pub struct SessionIo {
    /// Operator input; `None` once consumed or when stdin was not declared.
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// Container output and progress messages.
    pub stdout: SharedWriter,
    /// Separate error output; absent under a TTY, where it fuses into
    /// stdout.
    pub stderr: Option<SharedWriter>,
    /// Terminal resize events.
    pub resize: Option<mpsc::Receiver<TerminalSize>>,
}

/// Endpoints the adapters connect to.
#[derive(Debug, Clone)]
pub struct RuntimeEndpoints {
    /// Docker daemon endpoint, e.g. `unix:///var/run/docker.sock`.
    pub docker: String,
    /// containerd socket path, e.g. `/run/containerd/containerd.sock`.
    pub containerd: String,
}

/// One debug-container runtime.
///
/// `run_debug` owns the debug container for the session lifetime: it blocks
/// until the PTY closes or the session is cancelled, and it does not return
/// until its cleanup has completed. Cleanup runs under fresh timeouts so a
/// cancelled session cannot orphan the container.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pulls the debug image, rendering progress when verbosity > 0.
    /// Idempotent with respect to locally present content.
    async fn pull_image(&self, opts: &RunOpts, io: &mut SessionIo) -> Result<()>;

    /// Resolves the target container's init PID and mount destinations.
    async fn inspect_target(&self, opts: &RunOpts) -> Result<TargetInfo>;

    /// Creates, starts and attaches the debug container; blocks until it
    /// exits or the session is cancelled; tears it down; returns the exit
    /// status when one was observed.
    async fn run_debug(&self, opts: &RunOpts, io: &mut SessionIo) -> Result<i64>;
}

/// Builds the adapter for a scheme.
///
/// The pull tracker is the only state shared between sessions; it is handed
/// to every containerd adapter so concurrent pulls render a consistent
/// table.
///
/// # Errors
///
/// Returns [`RuntimeError::Unavailable`] for an unusable endpoint.
pub fn new_runtime(
    scheme: RuntimeScheme,
    endpoints: &RuntimeEndpoints,
    tracker: Arc<PullTracker>,
) -> Result<Arc<dyn ContainerRuntime>> {
    Ok(match scheme {
        RuntimeScheme::Docker => Arc::new(docker::DockerRuntime::new(&endpoints.docker)?),
        RuntimeScheme::Containerd => {
            Arc::new(containerd::ContainerdRuntime::new(&endpoints.containerd, tracker))
        }
    })
}
