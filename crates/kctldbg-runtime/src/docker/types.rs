//! Docker Engine API wire types.
//!
//! Only the fields the debug flow touches; the daemon tolerates the rest
//! being absent.

use serde::{Deserialize, Serialize};

/// Create-container request body.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerRequest {
    /// Argv run as the container entrypoint.
    pub entrypoint: Vec<String>,
    /// Debug image reference.
    pub image: String,
    /// Allocate a PTY.
    pub tty: bool,
    /// Keep stdin open.
    pub open_stdin: bool,
    /// Close stdin after the first detach.
    pub stdin_once: bool,
    /// Host-side configuration.
    pub host_config: HostConfig,
}

/// Host configuration joining the target's namespaces.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    /// `container:<target-id>`.
    pub network_mode: String,
    /// `container:<target-id>`.
    pub userns_mode: String,
    /// `container:<target-id>`.
    pub ipc_mode: String,
    /// `container:<target-id>`.
    pub pid_mode: String,
    /// Added capabilities.
    pub cap_add: Vec<String>,
    /// Bind mounts (`src:dst:mode`), used for the audit FIFO.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<String>,
}

/// Create-container response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerResponse {
    /// Daemon-issued container id.
    pub id: String,
    /// Non-fatal warnings.
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// The slice of a container-inspect response the agent needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    /// Runtime state.
    pub state: ContainerState,
    /// Mount table.
    #[serde(default)]
    pub mounts: Vec<MountPoint>,
}

/// Container state from inspect.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    /// Host PID of the init process; zero when not running.
    #[serde(default)]
    pub pid: i64,
    /// Whether the container is running.
    #[serde(default)]
    pub running: bool,
}

/// One mount entry from inspect.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountPoint {
    /// Mountpoint path inside the container.
    pub destination: String,
}

/// Container-wait response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitResponse {
    /// Exit status of the waited container.
    pub status_code: i64,
}

/// One NDJSON event from an image pull.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullEvent {
    /// Human-readable phase ("Downloading", "Pull complete", ...).
    #[serde(default)]
    pub status: String,
    /// Layer id the event refers to.
    #[serde(default)]
    pub id: Option<String>,
    /// Pre-rendered progress bar text.
    #[serde(default)]
    pub progress: Option<String>,
    /// Fatal pull error.
    #[serde(default)]
    pub error: Option<String>,
}

impl PullEvent {
    /// Renders the event the way the docker CLI does, CR-LF terminated so it
    /// survives a raw TTY.
    #[must_use]
    pub fn render(&self) -> String {
        match (&self.id, &self.progress) {
            (Some(id), Some(progress)) => format!("{id}: {} {progress}\r\n", self.status),
            (Some(id), None) => format!("{id}: {}\r\n", self.status),
            _ => format!("{}\r\n", self.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_shape() {
        let req = CreateContainerRequest {
            entrypoint: vec!["sh".into()],
            image: "busybox".into(),
            tty: true,
            open_stdin: true,
            stdin_once: true,
            host_config: HostConfig {
                network_mode: "container:abc".into(),
                userns_mode: "container:abc".into(),
                ipc_mode: "container:abc".into(),
                pid_mode: "container:abc".into(),
                cap_add: vec!["SYS_PTRACE".into(), "SYS_ADMIN".into()],
                binds: vec![],
            },
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["Image"], "busybox");
        assert_eq!(v["Tty"], true);
        assert_eq!(v["HostConfig"]["PidMode"], "container:abc");
        assert_eq!(v["HostConfig"]["CapAdd"][1], "SYS_ADMIN");
        // Empty binds are omitted entirely.
        assert!(v["HostConfig"].get("Binds").is_none());
    }

    #[test]
    fn test_inspect_decode() {
        let body = r#"{
            "Id": "deadbeef",
            "State": {"Pid": 4242, "Running": true, "Status": "running"},
            "Mounts": [
                {"Destination": "/var/lib/lxc", "Source": "/var/lib/lxc"},
                {"Destination": "/etc/hosts"}
            ]
        }"#;
        let inspect: ContainerInspect = serde_json::from_str(body).unwrap();
        assert_eq!(inspect.state.pid, 4242);
        assert!(inspect.state.running);
        assert_eq!(inspect.mounts[0].destination, "/var/lib/lxc");
    }

    #[test]
    fn test_pull_event_render() {
        let ev: PullEvent = serde_json::from_str(
            r#"{"status":"Downloading","progressDetail":{"current":10,"total":100},"progress":"[=>   ]","id":"aaa"}"#,
        )
        .unwrap();
        assert_eq!(ev.render(), "aaa: Downloading [=>   ]\r\n");

        let ev: PullEvent = serde_json::from_str(r#"{"status":"Pulling from library/busybox"}"#).unwrap();
        assert_eq!(ev.render(), "Pulling from library/busybox\r\n");

        let ev: PullEvent = serde_json::from_str(r#"{"error":"no such image"}"#).unwrap();
        assert_eq!(ev.error.as_deref(), Some("no such image"));
    }
}
