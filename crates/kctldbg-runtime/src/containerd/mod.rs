//! containerd runtime adapter.
//!
//! Speaks gRPC to the containerd socket. Targets are looked up in the
//! kubelet's `k8s.io` namespace; everything the agent creates lives in its
//! own `kctldbg` namespace so debug containers never collide with pod
//! state. Each session creates a fresh UUID-named container and snapshot,
//! which allows several concurrent debug sessions against one target.

pub mod image;
pub mod progress;
pub mod pull;
pub mod spec;
pub mod task_io;

use crate::error::{Result, RuntimeError};
use crate::{ContainerRuntime, RunOpts, SessionIo, SharedWriter, TargetInfo};
use async_trait::async_trait;
use containerd_client::services::v1::container::Runtime as ContainerRuntimeInfo;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{PrepareSnapshotRequest, RemoveSnapshotRequest};
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::{
    Container, CreateContainerRequest, CreateTaskRequest, DeleteContainerRequest,
    DeleteTaskRequest, GetContainerRequest, GetRequest, KillRequest, ResizePtyRequest,
    StartRequest, UpdateContainerRequest, WaitRequest,
};
use containerd_client::with_namespace;
use progress::PullTracker;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use task_io::TaskIo;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::{Code, Request};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Namespace the kubelet keeps pod containers in.
pub const K8S_NAMESPACE: &str = "k8s.io";

/// Namespace for everything this agent creates.
pub const KCTLDBG_NAMESPACE: &str = "kctldbg";

/// Snapshot key prefix; the suffix is the session UUID.
pub const SNAPSHOT_PREFIX: &str = "netshoot-snapshot-";

const SNAPSHOTTER: &str = "overlayfs";
const RUNC_V2: &str = "io.containerd.runc.v2";
const RUNC_V1: &str = "io.containerd.runc.v1";
const SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";
const SIGKILL: u32 = 9;

/// containerd-backed [`ContainerRuntime`].
pub struct ContainerdRuntime {
    endpoint: String,
    tracker: Arc<PullTracker>,
    runtime_name: &'static str,
}

impl ContainerdRuntime {
    /// Creates an adapter for a containerd socket path.
    ///
    /// `KCTLDBG_CONTAINERDV1_SHIM` selects the v1 runc shim.
    #[must_use]
    pub fn new(endpoint: &str, tracker: Arc<PullTracker>) -> Self {
        let v1_shim = std::env::var("KCTLDBG_CONTAINERDV1_SHIM").is_ok_and(|v| !v.is_empty());
        if v1_shim {
            info!("using containerd v1 runc shim");
        }
        Self {
            endpoint: endpoint.to_string(),
            tracker,
            runtime_name: if v1_shim { RUNC_V1 } else { RUNC_V2 },
        }
    }

    async fn channel(&self) -> Result<Channel> {
        containerd_client::connect(&self.endpoint)
            .await
            .map_err(|e| RuntimeError::Unavailable {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })
    }

    async fn launch(
        &self,
        channel: Channel,
        opts: &RunOpts,
        io: &mut SessionIo,
        teardown: &mut Teardown,
    ) -> Result<i64> {
        let target = self.inspect_target(opts).await?;
        let resolved = image::resolve(channel.clone(), KCTLDBG_NAMESPACE, &opts.image).await?;
        let audit_fifo = opts.audit.as_ref().map(|a| a.fifo.as_path());
        let oci_spec =
            spec::build_debug_spec(&resolved.config, opts.argv(), target.pid, audit_fifo)?;

        // Rootfs snapshot off the image's unpacked top layer.
        let mut snapshots = SnapshotsClient::new(channel.clone());
        let req = PrepareSnapshotRequest {
            snapshotter: SNAPSHOTTER.to_string(),
            key: teardown.snapshot_key.clone(),
            parent: resolved.chain_id.clone(),
            labels: HashMap::new(),
        };
        let mounts = grpc_with_timeout(
            opts.timeout,
            snapshots.prepare(with_namespace!(req, KCTLDBG_NAMESPACE)),
        )
        .await?
        .into_inner()
        .mounts;
        teardown.snapshot_created = true;

        let container = Container {
            id: teardown.session_id.clone(),
            image: opts.image.clone(),
            runtime: Some(ContainerRuntimeInfo {
                name: self.runtime_name.to_string(),
                options: None,
            }),
            spec: Some(prost_types::Any {
                type_url: SPEC_TYPE_URL.to_string(),
                value: serde_json::to_vec(&oci_spec)
                    .map_err(|e| RuntimeError::Spec(e.to_string()))?,
            }),
            snapshotter: SNAPSHOTTER.to_string(),
            snapshot_key: teardown.snapshot_key.clone(),
            ..Container::default()
        };
        let mut containers = ContainersClient::new(channel.clone());
        let req = CreateContainerRequest {
            container: Some(container),
        };
        grpc_with_timeout(
            opts.timeout,
            containers.create(with_namespace!(req, KCTLDBG_NAMESPACE)),
        )
        .await?;
        teardown.container_created = true;

        self.apply_labels(&mut containers, opts, &teardown.session_id)
            .await;

        // FIFOs must have opener tasks running before the shim is asked to
        // connect to them.
        let tio = TaskIo::create(&teardown.session_id, io.stderr.is_some())?;
        teardown.pumps = spawn_io_pumps(&tio, io, &opts.cancel);

        let mut tasks = TasksClient::new(channel.clone());
        let req = CreateTaskRequest {
            container_id: teardown.session_id.clone(),
            rootfs: mounts,
            stdin: tio.stdin.display().to_string(),
            stdout: tio.stdout.display().to_string(),
            stderr: tio.stderr.display().to_string(),
            terminal: true,
            ..CreateTaskRequest::default()
        };
        teardown.task_io = Some(tio);
        grpc_with_timeout(
            opts.timeout,
            tasks.create(with_namespace!(req, KCTLDBG_NAMESPACE)),
        )
        .await?;
        teardown.task_created = true;

        // The exit channel must exist before the task starts.
        let mut wait_client = TasksClient::new(channel.clone());
        let wait_req = WaitRequest {
            container_id: teardown.session_id.clone(),
            exec_id: String::new(),
        };
        let mut wait_handle = tokio::spawn(async move {
            wait_client
                .wait(with_namespace!(wait_req, KCTLDBG_NAMESPACE))
                .await
        });

        spawn_resize_forwarder(channel.clone(), teardown.session_id.clone(), io);

        let req = StartRequest {
            container_id: teardown.session_id.clone(),
            exec_id: String::new(),
        };
        grpc_with_timeout(
            opts.timeout,
            tasks.start(with_namespace!(req, KCTLDBG_NAMESPACE)),
        )
        .await?;

        debug!(container = %teardown.session_id, target = %opts.container_id, "debug task started");

        tokio::select! {
            () = opts.cancel.cancelled() => {
                debug!(container = %teardown.session_id, "session cancelled, tearing down debug task");
                wait_handle.abort();
                Ok(0)
            }
            wait = &mut wait_handle => {
                let status = wait
                    .map_err(|e| RuntimeError::Rejected(format!("wait task failed: {e}")))?
                    .map(|resp| i64::from(resp.into_inner().exit_status))?;
                Ok(status)
            }
        }
    }

    /// Labels record who opened the session and against what.
    async fn apply_labels(
        &self,
        containers: &mut ContainersClient<Channel>,
        opts: &RunOpts,
        session_id: &str,
    ) {
        let mut labels = HashMap::new();
        labels.insert("ClientHostName".to_string(), opts.client_hostname.clone());
        labels.insert("ClientUserName".to_string(), opts.client_username.clone());
        labels.insert("IdOfDebuggee".to_string(), opts.container_id.clone());
        let req = UpdateContainerRequest {
            container: Some(Container {
                id: session_id.to_string(),
                labels,
                ..Container::default()
            }),
            update_mask: Some(prost_types::FieldMask {
                paths: vec!["labels".to_string()],
            }),
        };
        if let Err(e) = containers
            .update(with_namespace!(req, KCTLDBG_NAMESPACE))
            .await
        {
            warn!(container = %session_id, "failed to label debug container: {e}");
        }
    }
}

#[async_trait]
impl ContainerRuntime for ContainerdRuntime {
    async fn pull_image(&self, opts: &RunOpts, io: &mut SessionIo) -> Result<()> {
        let channel = self.channel().await?;

        if pull::image_exists(channel.clone(), KCTLDBG_NAMESPACE, &opts.image).await? {
            debug!(image = %opts.image, "image already present, skipping pull");
            if opts.verbosity > 0 {
                io.stdout
                    .write_str(&format!("{}:\texists\t\r\n", opts.image))
                    .await
                    .ok();
            }
            return Ok(());
        }

        let progress_cancel = CancellationToken::new();
        let progress_task = (opts.verbosity > 0).then(|| {
            let channel = channel.clone();
            let image = opts.image.clone();
            let tracker = Arc::clone(&self.tracker);
            let out = io.stdout.clone();
            let cancel = progress_cancel.clone();
            tokio::spawn(async move {
                progress::render_pull_progress(
                    channel,
                    KCTLDBG_NAMESPACE,
                    image,
                    &tracker,
                    out,
                    cancel,
                )
                .await;
            })
        });

        let result = tokio::select! {
            () = opts.cancel.cancelled() => Err(RuntimeError::Cancelled),
            result = pull::transfer_pull(channel, KCTLDBG_NAMESPACE, SNAPSHOTTER, opts) => result,
        };

        progress_cancel.cancel();
        if let Some(task) = progress_task {
            let _ = task.await;
        }
        self.tracker.forget(&opts.image);
        result
    }

    async fn inspect_target(&self, opts: &RunOpts) -> Result<TargetInfo> {
        let channel = self.channel().await?;
        let id = &opts.container_id;

        let mut tasks = TasksClient::new(channel.clone());
        let req = GetRequest {
            container_id: id.clone(),
            exec_id: String::new(),
        };
        let resp = tasks
            .get(with_namespace!(req, K8S_NAMESPACE))
            .await
            .map_err(|status| {
                if status.code() == Code::NotFound {
                    RuntimeError::TargetNotFound(id.clone())
                } else {
                    status.into()
                }
            })?
            .into_inner();

        let pid = resp.process.map_or(0, |p| i64::from(p.pid));
        if pid == 0 {
            return Err(RuntimeError::InvalidTarget {
                id: id.clone(),
                reason: "task has no running init process".to_string(),
            });
        }

        // The mount table lives in the stored OCI spec; a target with an
        // unreadable spec is still debuggable, just without LXCFS rebinds.
        let mut containers = ContainersClient::new(channel);
        let req = GetContainerRequest { id: id.clone() };
        let mount_destinations = match containers.get(with_namespace!(req, K8S_NAMESPACE)).await {
            Ok(resp) => resp
                .into_inner()
                .container
                .and_then(|c| c.spec)
                .map(|any| spec_mount_destinations(&any.value))
                .unwrap_or_default(),
            Err(e) => {
                warn!(container = %id, "failed to load target container record: {e}");
                Vec::new()
            }
        };

        Ok(TargetInfo {
            pid,
            mount_destinations,
        })
    }

    async fn run_debug(&self, opts: &RunOpts, io: &mut SessionIo) -> Result<i64> {
        let channel = self.channel().await?;
        let session_id = Uuid::new_v4().to_string();
        let mut teardown = Teardown::new(channel.clone(), session_id, opts.timeout);

        let result = self.launch(channel, opts, io, &mut teardown).await;
        // Teardown runs on every path, success or not, before returning.
        teardown.run().await;
        result
    }
}

/// Mount destinations recorded in a stored OCI spec.
fn spec_mount_destinations(spec_json: &[u8]) -> Vec<String> {
    match serde_json::from_slice::<oci_spec::runtime::Spec>(spec_json) {
        Ok(spec) => spec
            .mounts()
            .as_ref()
            .map(|mounts| {
                mounts
                    .iter()
                    .map(|m| m.destination().display().to_string())
                    .collect()
            })
            .unwrap_or_default(),
        Err(e) => {
            warn!("unreadable target container spec: {e}");
            Vec::new()
        }
    }
}

/// Connects the task FIFOs to the session streams.
fn spawn_io_pumps(
    tio: &TaskIo,
    io: &mut SessionIo,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut pumps = Vec::new();

    if let Some(mut stdin) = io.stdin.take() {
        let path = tio.stdin.clone();
        pumps.push(tokio::spawn(async move {
            let Ok(mut fifo) = tokio::fs::OpenOptions::new().write(true).open(&path).await
            else {
                return;
            };
            // EOF from the client closes the fifo, which the task sees as
            // its stdin closing; output pumps keep draining.
            let _ = tokio::io::copy(&mut stdin, &mut fifo).await;
        }));
    }

    pumps.push(spawn_output_pump(
        tio.stdout.clone(),
        io.stdout.clone(),
        cancel.clone(),
    ));
    if let (Some(stderr), true) = (io.stderr.clone(), tio.stderr != tio.stdout) {
        pumps.push(spawn_output_pump(tio.stderr.clone(), stderr, cancel.clone()));
    }
    pumps
}

fn spawn_output_pump(
    path: PathBuf,
    out: SharedWriter,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(mut fifo) = tokio::fs::File::open(&path).await else {
            return;
        };
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                read = fifo.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                },
            }
        }
    })
}

/// Forwards client resize events to the task PTY, best-effort.
fn spawn_resize_forwarder(channel: Channel, session_id: String, io: &mut SessionIo) {
    let Some(mut resize) = io.resize.take() else {
        return;
    };
    tokio::spawn(async move {
        let mut tasks = TasksClient::new(channel);
        while let Some(size) = resize.recv().await {
            let req = ResizePtyRequest {
                container_id: session_id.clone(),
                exec_id: String::new(),
                width: u32::from(size.width),
                height: u32::from(size.height),
            };
            if let Err(e) = tasks.resize_pty(with_namespace!(req, KCTLDBG_NAMESPACE)).await {
                warn!(container = %session_id, "tty resize failed: {e}");
            }
        }
    });
}

async fn grpc_with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = std::result::Result<T, tonic::Status>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| RuntimeError::Rejected("containerd request timed out".to_string()))?
        .map_err(|status| RuntimeError::Rejected(status.message().to_string()))
}

/// Everything a session may leave behind, torn down in order with fresh
/// timeouts: task, container, snapshot, FIFOs.
struct Teardown {
    channel: Channel,
    session_id: String,
    snapshot_key: String,
    timeout: Duration,
    task_created: bool,
    container_created: bool,
    snapshot_created: bool,
    task_io: Option<TaskIo>,
    pumps: Vec<JoinHandle<()>>,
}

impl Teardown {
    fn new(channel: Channel, session_id: String, timeout: Duration) -> Self {
        let snapshot_key = format!("{SNAPSHOT_PREFIX}{session_id}");
        Self {
            channel,
            session_id,
            snapshot_key,
            timeout,
            task_created: false,
            container_created: false,
            snapshot_created: false,
            task_io: None,
            pumps: Vec::new(),
        }
    }

    async fn run(&mut self) {
        if self.task_created {
            let mut tasks = TasksClient::new(self.channel.clone());

            let req = KillRequest {
                container_id: self.session_id.clone(),
                exec_id: String::new(),
                signal: SIGKILL,
                all: true,
            };
            self.step("kill task", tasks.kill(with_namespace!(req, KCTLDBG_NAMESPACE)))
                .await;

            let req = WaitRequest {
                container_id: self.session_id.clone(),
                exec_id: String::new(),
            };
            self.step("await task exit", tasks.wait(with_namespace!(req, KCTLDBG_NAMESPACE)))
                .await;

            let req = DeleteTaskRequest {
                container_id: self.session_id.clone(),
            };
            self.step("delete task", tasks.delete(with_namespace!(req, KCTLDBG_NAMESPACE)))
                .await;
        }

        if self.container_created {
            let mut containers = ContainersClient::new(self.channel.clone());
            let req = DeleteContainerRequest {
                id: self.session_id.clone(),
            };
            self.step(
                "delete container",
                containers.delete(with_namespace!(req, KCTLDBG_NAMESPACE)),
            )
            .await;
        }

        if self.snapshot_created {
            let mut snapshots = SnapshotsClient::new(self.channel.clone());
            let req = RemoveSnapshotRequest {
                snapshotter: SNAPSHOTTER.to_string(),
                key: self.snapshot_key.clone(),
            };
            self.step(
                "remove snapshot",
                snapshots.remove(with_namespace!(req, KCTLDBG_NAMESPACE)),
            )
            .await;
        }

        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        if let Some(tio) = self.task_io.take() {
            tio.cleanup();
        }
    }

    async fn step<T>(
        &self,
        what: &str,
        fut: impl Future<Output = std::result::Result<T, tonic::Status>>,
    ) {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(_)) => {}
            Ok(Err(status)) if status.code() == Code::NotFound => {}
            Ok(Err(status)) => {
                warn!(container = %self.session_id, "cleanup failed to {what}: {status}");
            }
            Err(_) => {
                warn!(container = %self.session_id, "cleanup timed out trying to {what}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_key_shape() {
        let session_id = Uuid::new_v4().to_string();
        let key = format!("{SNAPSHOT_PREFIX}{session_id}");
        assert!(key.starts_with("netshoot-snapshot-"));
        assert_eq!(key.len(), SNAPSHOT_PREFIX.len() + 36);
    }

    #[test]
    fn test_spec_mount_destinations() {
        let spec_json = br#"{
            "ociVersion": "1.0.2",
            "mounts": [
                {"destination": "/proc", "type": "proc", "source": "proc"},
                {"destination": "/var/lib/lxc", "type": "bind", "source": "/var/lib/lxc"}
            ]
        }"#;
        let destinations = spec_mount_destinations(spec_json);
        assert_eq!(destinations, vec!["/proc", "/var/lib/lxc"]);

        assert!(spec_mount_destinations(b"not json").is_empty());
    }
}
