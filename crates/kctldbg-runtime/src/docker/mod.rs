//! Docker runtime adapter.
//!
//! Talks the Engine API over the configured unix socket. The debug
//! container joins the target's namespaces through the daemon's
//! `container:<id>` modes, so no `/proc` paths are handled here; the
//! daemon resolves them itself.

pub mod client;
pub mod types;

use crate::error::{Result, RuntimeError};
use crate::{ContainerRuntime, RunOpts, SessionIo, SharedWriter, TargetInfo};
use async_trait::async_trait;
use base64::Engine;
use client::{DockerClient, API_PREFIX};
use http_body_util::BodyExt;
use hyper::header::{HeaderName, HeaderValue};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use types::{
    ContainerInspect, CreateContainerRequest, CreateContainerResponse, HostConfig, PullEvent,
    WaitResponse,
};

/// Capabilities granted to the debug container.
const DEBUG_CAPABILITIES: [&str; 2] = ["SYS_PTRACE", "SYS_ADMIN"];

/// Docker-backed [`ContainerRuntime`].
pub struct DockerRuntime {
    client: Arc<DockerClient>,
}

impl DockerRuntime {
    /// Creates an adapter for a `unix://` docker endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Unavailable`] for a non-unix endpoint.
    pub fn new(endpoint: &str) -> Result<Self> {
        Ok(Self {
            client: Arc::new(DockerClient::new(endpoint)?),
        })
    }

    fn container_mode(target_id: &str) -> String {
        format!("container:{target_id}")
    }

    async fn create_container(&self, opts: &RunOpts) -> Result<String> {
        let binds = opts.audit.as_ref().map_or_else(Vec::new, |a| {
            vec![format!("{0}:{0}:rw", a.fifo.display())]
        });
        let body = CreateContainerRequest {
            entrypoint: opts.argv().to_vec(),
            image: opts.image.clone(),
            tty: true,
            open_stdin: true,
            stdin_once: true,
            host_config: HostConfig {
                network_mode: Self::container_mode(&opts.container_id),
                userns_mode: Self::container_mode(&opts.container_id),
                ipc_mode: Self::container_mode(&opts.container_id),
                pid_mode: Self::container_mode(&opts.container_id),
                cap_add: DEBUG_CAPABILITIES.iter().map(ToString::to_string).collect(),
                binds,
            },
        };

        // The name is left to the daemon so concurrent sessions against one
        // target cannot collide.
        let created: CreateContainerResponse = tokio::time::timeout(
            opts.timeout,
            self.client
                .post_json(&format!("{API_PREFIX}/containers/create"), Some(&body)),
        )
        .await
        .map_err(|_| RuntimeError::Rejected("create timed out".to_string()))?
        .map_err(reject)?;
        for warning in &created.warnings {
            warn!(container = %created.id, "create warning: {warning}");
        }
        Ok(created.id)
    }

    async fn start_container(&self, opts: &RunOpts, id: &str) -> Result<()> {
        tokio::time::timeout(
            opts.timeout,
            self.client
                .post_empty(&format!("{API_PREFIX}/containers/{id}/start")),
        )
        .await
        .map_err(|_| RuntimeError::Rejected("start timed out".to_string()))?
        .map_err(reject)
    }

    /// Attaches to the debug container and pumps bytes until its PTY closes
    /// or the session is cancelled.
    async fn attach(&self, opts: &RunOpts, io: &mut SessionIo, id: &str) -> Result<()> {
        let want_stdin = io.stdin.is_some();
        // The container always has a PTY, so the daemon fuses stderr into a
        // raw stdout stream and no demultiplexing is needed.
        let path = format!(
            "{API_PREFIX}/containers/{id}/attach?stream=true&stdin={want_stdin}&stdout=true&stderr=false"
        );
        let attached = self.client.upgrade(&path).await.map_err(reject)?;
        let (mut rd, mut wr) = tokio::io::split(attached);

        // Resize events are forwarded as they arrive; failures are logged
        // and never abort the session.
        let resize_task = io.resize.take().map(|mut resize| {
            let client = Arc::clone(&self.client);
            let id = id.to_string();
            tokio::spawn(async move {
                while let Some(size) = resize.recv().await {
                    let path = format!(
                        "{API_PREFIX}/containers/{id}/resize?h={}&w={}",
                        size.height, size.width
                    );
                    if let Err(e) = client.post_empty(&path).await {
                        warn!(container = %id, "tty resize failed: {e}");
                    }
                }
            })
        });

        // Stdin close half-closes the write side; output reads continue
        // until the daemon ends the stream.
        let stdin_task = io.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stdin, &mut wr).await;
                let _ = wr.shutdown().await;
            })
        });

        let result = Self::pump_raw(&mut rd, &io.stdout, opts).await;

        if let Some(t) = stdin_task {
            t.abort();
        }
        if let Some(t) = resize_task {
            t.abort();
        }
        result
    }

    async fn pump_raw(
        rd: &mut (impl tokio::io::AsyncRead + Unpin),
        stdout: &SharedWriter,
        opts: &RunOpts,
    ) -> Result<()> {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            tokio::select! {
                () = opts.cancel.cancelled() => return Ok(()),
                read = rd.read(&mut buf) => match read {
                    Ok(0) => return Ok(()),
                    Ok(n) => stdout.write_all(&buf[..n]).await?,
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    /// Waits for the container to stop and removes it, under fresh timeouts
    /// so a cancelled session still cleans up. Returns the exit status when
    /// the wait succeeded.
    async fn clean_container(&self, opts: &RunOpts, id: &str) -> Option<i64> {
        let wait = tokio::time::timeout(
            opts.timeout,
            self.client.post_json::<WaitResponse, ()>(
                &format!("{API_PREFIX}/containers/{id}/wait?condition=not-running"),
                None,
            ),
        )
        .await;

        let (status, force) = match wait {
            Ok(Ok(w)) => (Some(w.status_code), false),
            Ok(Err(e)) => {
                warn!(container = %id, "error waiting for debug container exit, removing with force: {e}");
                (None, true)
            }
            Err(_) => {
                warn!(container = %id, "timed out waiting for debug container exit, removing with force");
                (None, true)
            }
        };

        let remove = tokio::time::timeout(
            opts.timeout,
            self.client
                .delete(&format!("{API_PREFIX}/containers/{id}?force={force}")),
        )
        .await;
        match remove {
            Ok(Ok(())) => {
                if opts.verbosity > 0 {
                    info!(container = %id, "debug session ended, debug container removed");
                }
            }
            Ok(Err(e)) => warn!(container = %id, "error removing debug container: {e}"),
            Err(_) => warn!(container = %id, "timed out removing debug container"),
        }
        status
    }
}

fn reject(e: RuntimeError) -> RuntimeError {
    match e {
        e @ (RuntimeError::Unavailable { .. } | RuntimeError::Rejected(_)) => e,
        other => RuntimeError::Rejected(other.to_string()),
    }
}

fn registry_auth_header(opts: &RunOpts) -> Option<(HeaderName, HeaderValue)> {
    let auth = opts.auth.as_ref()?;
    let config = serde_json::json!({
        "username": auth.username,
        "password": auth.password,
    });
    let encoded = base64::engine::general_purpose::URL_SAFE.encode(config.to_string());
    Some((
        HeaderName::from_static("x-registry-auth"),
        HeaderValue::from_str(&encoded).ok()?,
    ))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, opts: &RunOpts, io: &mut SessionIo) -> Result<()> {
        let path = format!(
            "{API_PREFIX}/images/create?fromImage={}",
            urlencoding::encode(&opts.image)
        );
        let headers: Vec<_> = registry_auth_header(opts).into_iter().collect();
        let mut body = self.client.post_streaming(&path, &headers).await.map_err(|e| {
            RuntimeError::Pull {
                image: opts.image.clone(),
                reason: e.to_string(),
            }
        })?;

        // The daemon streams NDJSON progress events for the whole pull; an
        // `error` event is fatal.
        let mut pending = String::new();
        loop {
            let frame = tokio::select! {
                () = opts.cancel.cancelled() => return Err(RuntimeError::Cancelled),
                frame = body.frame() => frame,
            };
            let Some(frame) = frame else { break };
            let frame = frame.map_err(|e| RuntimeError::Pull {
                image: opts.image.clone(),
                reason: e.to_string(),
            })?;
            let Some(data) = frame.data_ref() else { continue };
            pending.push_str(&String::from_utf8_lossy(data));

            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let event: PullEvent = serde_json::from_str(line).unwrap_or_default();
                if let Some(error) = event.error {
                    return Err(RuntimeError::Pull {
                        image: opts.image.clone(),
                        reason: error,
                    });
                }
                if opts.verbosity > 0 {
                    io.stdout.write_str(&event.render()).await.ok();
                }
            }
        }
        debug!(image = %opts.image, "image pull complete");
        Ok(())
    }

    async fn inspect_target(&self, opts: &RunOpts) -> Result<TargetInfo> {
        let id = &opts.container_id;
        let inspect = tokio::time::timeout(
            opts.timeout,
            self.client
                .get_json::<ContainerInspect>(&format!("{API_PREFIX}/containers/{id}/json")),
        )
        .await
        .map_err(|_| RuntimeError::Unavailable {
            endpoint: "docker".to_string(),
            reason: "inspect timed out".to_string(),
        })?
        .map_err(|e| match e {
            RuntimeError::TargetNotFound(_) => RuntimeError::TargetNotFound(id.clone()),
            other => other,
        })?;

        if inspect.state.pid == 0 {
            return Err(RuntimeError::InvalidTarget {
                id: id.clone(),
                reason: "init pid is zero (container not running)".to_string(),
            });
        }
        Ok(TargetInfo {
            pid: inspect.state.pid,
            mount_destinations: inspect.mounts.into_iter().map(|m| m.destination).collect(),
        })
    }

    async fn run_debug(&self, opts: &RunOpts, io: &mut SessionIo) -> Result<i64> {
        let id = self.create_container(opts).await?;

        if let Err(e) = self.start_container(opts, &id).await {
            self.clean_container(opts, &id).await;
            return Err(e);
        }

        io.stdout
            .write_str("container created, open tty...\r\n")
            .await
            .ok();

        let attach_result = self.attach(opts, io, &id).await;
        // Cleanup runs on every path before this function returns.
        let status = self.clean_container(opts, &id).await;
        attach_result?;
        Ok(status.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn opts_with_auth(auth: Option<crate::RegistryAuth>) -> RunOpts {
        RunOpts {
            container_id: "target".into(),
            image: "busybox".into(),
            command: vec!["sh".into()],
            auth,
            registry_skip_tls: false,
            timeout: Duration::from_secs(30),
            verbosity: 0,
            client_hostname: String::new(),
            client_username: String::new(),
            audit: None,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_container_mode() {
        assert_eq!(DockerRuntime::container_mode("abc123"), "container:abc123");
    }

    #[test]
    fn test_registry_auth_header() {
        assert!(registry_auth_header(&opts_with_auth(None)).is_none());

        let (name, value) = registry_auth_header(&opts_with_auth(Some(crate::RegistryAuth {
            username: "alice".into(),
            password: "s3cret".into(),
        })))
        .unwrap();
        assert_eq!(name.as_str(), "x-registry-auth");

        let decoded = base64::engine::general_purpose::URL_SAFE
            .decode(value.to_str().unwrap())
            .unwrap();
        let config: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(config["username"], "alice");
        assert_eq!(config["password"], "s3cret");
    }
}
