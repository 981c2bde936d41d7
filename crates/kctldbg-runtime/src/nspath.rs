//! Namespace path resolution.
//!
//! A debug container joins the target by opening the target init process's
//! namespace files under `/proc/<pid>/ns/`. Only network, IPC and PID are
//! ever bound; the debug container gets a fresh mount namespace, and the
//! user namespace stays host-default.

/// Network namespace of a process.
#[must_use]
pub fn network_namespace(pid: i64) -> String {
    format!("/proc/{pid}/ns/net")
}

/// IPC namespace of a process.
#[must_use]
pub fn ipc_namespace(pid: i64) -> String {
    format!("/proc/{pid}/ns/ipc")
}

/// PID namespace of a process.
#[must_use]
pub fn pid_namespace(pid: i64) -> String {
    format!("/proc/{pid}/ns/pid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_paths() {
        assert_eq!(network_namespace(1), "/proc/1/ns/net");
        assert_eq!(ipc_namespace(42), "/proc/42/ns/ipc");
        assert_eq!(pid_namespace(99_999), "/proc/99999/ns/pid");
    }
}
