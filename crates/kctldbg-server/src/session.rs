//! Debug session orchestration.
//!
//! One session per accepted request: LXCFS rebinds (optional), image pull,
//! then the blocking debug-container run. The session owns the cancellable
//! context every subordinate task hangs off; closing the client stream
//! cancels it, and adapter cleanup still runs because it uses fresh
//! timeouts rather than the session context.

use crate::audit::AuditSession;
use crate::handlers::SessionDescriptor;
use kctldbg_config::Config;
use kctldbg_runtime::{lxcfs, ContainerRuntime, RunOpts, RuntimeError, SessionIo, SharedWriter};
use kctldbg_stream::SessionStreams;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

/// A single debug session bound to one upgraded connection.
pub struct DebugSession {
    descriptor: SessionDescriptor,
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<Config>,
}

impl DebugSession {
    /// Creates a session from a validated descriptor.
    #[must_use]
    pub fn new(
        descriptor: SessionDescriptor,
        runtime: Arc<dyn ContainerRuntime>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            descriptor,
            runtime,
            config,
        }
    }

    /// Runs the session to completion, reporting failures on the client
    /// stream and closing it on every path.
    pub async fn run(self, mut streams: SessionStreams) {
        let cancel = streams.cancel_token();
        let Some(stdout) = streams.stdout.take() else {
            return;
        };
        let mut io = SessionIo {
            stdin: streams
                .stdin
                .take()
                .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            stdout: SharedWriter::new(stdout),
            stderr: streams.stderr.take().map(SharedWriter::new),
            resize: streams.resize.take(),
        };

        let audit = if self.config.audit {
            match AuditSession::create(
                &self.config.audit_fifo,
                &self.config.audit_shim,
                &self.descriptor.command,
                &self.descriptor.username,
                &self.descriptor.container_id,
            ) {
                Ok(audit) => Some(audit),
                Err(e) => {
                    warn!("audit setup failed, aborting session: {e}");
                    io.stdout.write_str(&format!("{e}\r\n")).await.ok();
                    io.stdout.shutdown().await;
                    cancel.cancel();
                    return;
                }
            }
        } else {
            None
        };

        let opts = RunOpts {
            container_id: self.descriptor.container_id.clone(),
            image: self.descriptor.image.clone(),
            command: self.descriptor.command.clone(),
            auth: self.descriptor.auth.clone(),
            registry_skip_tls: self.descriptor.registry_skip_tls,
            timeout: self.config.runtime_timeout,
            verbosity: self.descriptor.verbosity,
            client_hostname: self.descriptor.hostname.clone(),
            client_username: self.descriptor.username.clone(),
            audit: audit.as_ref().map(AuditSession::bind),
            cancel: cancel.clone(),
        };

        match self.drive(&opts, &mut io).await {
            Ok(status) => {
                info!(
                    target = %self.descriptor.container_id,
                    status,
                    "debug session finished"
                );
            }
            Err(RuntimeError::Pull { image, reason }) => {
                warn!(image = %image, "image pull failed: {reason}");
                io.stdout
                    .write_str(&format!("Failed to download image {image}; {reason}\r\n"))
                    .await
                    .ok();
            }
            Err(RuntimeError::Cancelled) => {
                debug!(target = %self.descriptor.container_id, "debug session cancelled");
            }
            Err(e) => {
                warn!(target = %self.descriptor.container_id, "debug session failed: {e}");
                io.stdout.write_str(&format!("{e}\r\n")).await.ok();
            }
        }

        if let Some(audit) = audit {
            audit.close();
        }
        io.stdout.shutdown().await;
        cancel.cancel();
    }

    /// The session state machine: lxcfs-checked, image-pulled,
    /// container-run. Each arrow is a hard ordering; a failure at any step
    /// skips the rest but never the caller's cleanup.
    async fn drive(&self, opts: &RunOpts, io: &mut SessionIo) -> kctldbg_runtime::Result<i64> {
        let descriptor = &self.descriptor;

        if descriptor.verbosity > 0 {
            io.stdout
                .write_str(&format!(
                    "set container procfs correct {} .. \r\n",
                    descriptor.lxcfs_enabled
                ))
                .await
                .ok();
        }
        if descriptor.lxcfs_enabled {
            lxcfs::check_host_mount()?;
            let target = self.runtime.inspect_target(opts).await?;
            if target
                .mount_destinations
                .iter()
                .any(|m| m == lxcfs::LXCFS_ROOT_DIR)
            {
                debug!(pid = target.pid, "target mounts lxcfs root, rebinding proc files");
                lxcfs::rebind_proc_files(target.pid).await?;
            }
        }

        if descriptor.verbosity > 0 {
            io.stdout
                .write_str(&format!(
                    "pulling image {}, skip TLS {}... \r\n",
                    descriptor.image, descriptor.registry_skip_tls
                ))
                .await
                .ok();
        }
        self.runtime.pull_image(opts, io).await?;

        if descriptor.verbosity > 0 {
            io.stdout
                .write_str("starting debug container...\r\n")
                .await
                .ok();
        }
        self.runtime.run_debug(opts, io).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kctldbg_runtime::{RuntimeScheme, TargetInfo};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Records adapter calls in order; optionally fails the pull.
    struct MockRuntime {
        calls: Mutex<Vec<&'static str>>,
        fail_pull: bool,
    }

    impl MockRuntime {
        fn new(fail_pull: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_pull,
            })
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn pull_image(
            &self,
            opts: &RunOpts,
            _io: &mut SessionIo,
        ) -> kctldbg_runtime::Result<()> {
            self.calls.lock().unwrap().push("pull");
            if self.fail_pull {
                return Err(RuntimeError::Pull {
                    image: opts.image.clone(),
                    reason: "registry unreachable".to_string(),
                });
            }
            Ok(())
        }

        async fn inspect_target(&self, _opts: &RunOpts) -> kctldbg_runtime::Result<TargetInfo> {
            self.calls.lock().unwrap().push("inspect");
            Ok(TargetInfo {
                pid: 4242,
                mount_destinations: vec![],
            })
        }

        async fn run_debug(
            &self,
            _opts: &RunOpts,
            io: &mut SessionIo,
        ) -> kctldbg_runtime::Result<i64> {
            self.calls.lock().unwrap().push("run");
            io.stdout.write_str("hi\n").await.ok();
            Ok(0)
        }
    }

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor {
            scheme: RuntimeScheme::Docker,
            container_id: "target".into(),
            image: "busybox".into(),
            command: vec!["sh".into()],
            auth: None,
            registry_skip_tls: false,
            lxcfs_enabled: false,
            verbosity: 0,
            hostname: String::new(),
            username: String::new(),
        }
    }

    fn test_io() -> (SessionIo, tokio::io::DuplexStream) {
        let (client_end, session_end) = tokio::io::duplex(4096);
        let io = SessionIo {
            stdin: None,
            stdout: SharedWriter::new(session_end),
            stderr: None,
            resize: None,
        };
        (io, client_end)
    }

    fn opts() -> RunOpts {
        RunOpts {
            container_id: "target".into(),
            image: "busybox".into(),
            command: vec!["sh".into()],
            auth: None,
            registry_skip_tls: false,
            timeout: std::time::Duration::from_secs(5),
            verbosity: 0,
            client_hostname: String::new(),
            client_username: String::new(),
            audit: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_pull_strictly_before_run() {
        let runtime = MockRuntime::new(false);
        let session = DebugSession::new(
            descriptor(),
            runtime.clone(),
            Arc::new(Config::default()),
        );
        let (mut io, _client) = test_io();

        let status = session.drive(&opts(), &mut io).await.unwrap();
        assert_eq!(status, 0);
        assert_eq!(runtime.calls(), vec!["pull", "run"]);
    }

    #[tokio::test]
    async fn test_pull_failure_skips_run() {
        let runtime = MockRuntime::new(true);
        let session = DebugSession::new(
            descriptor(),
            runtime.clone(),
            Arc::new(Config::default()),
        );
        let (mut io, _client) = test_io();

        let err = session.drive(&opts(), &mut io).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Pull { .. }));
        assert_eq!(runtime.calls(), vec!["pull"]);
    }

    #[tokio::test]
    async fn test_run_writes_to_session_stream() {
        use tokio::io::AsyncReadExt;

        let runtime = MockRuntime::new(false);
        let session = DebugSession::new(
            descriptor(),
            runtime.clone(),
            Arc::new(Config::default()),
        );
        let (mut io, mut client) = test_io();

        session.drive(&opts(), &mut io).await.unwrap();
        drop(io);

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hi\n");
    }
}
