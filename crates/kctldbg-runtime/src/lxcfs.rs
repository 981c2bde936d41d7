//! LXCFS proc-file rebinding.
//!
//! When the host runs LXCFS, the target container sees correct
//! `/proc/meminfo` and friends only if the LXCFS views are bind-mounted
//! over the kernel ones. The agent performs those binds inside the target's
//! mount namespace before attaching the debug container.

use crate::error::{Result, RuntimeError};
use crate::nsenter::MountNsEnter;
use tracing::debug;

/// Mount destination that marks a target as LXCFS-aware.
pub const LXCFS_ROOT_DIR: &str = "/var/lib/lxc";

/// Host directory the LXCFS filesystem is mounted on.
pub const LXCFS_HOME_DIR: &str = "/var/lib/lxc/lxcfs";

/// Proc files LXCFS virtualises.
pub const LXCFS_PROC_FILES: &[&str] = &[
    "/proc/meminfo",
    "/proc/cpuinfo",
    "/proc/uptime",
    "/proc/swaps",
    "/proc/stat",
    "/proc/diskstats",
    "/proc/loadavg",
];

/// Verifies that the host has LXCFS mounted.
///
/// # Errors
///
/// Returns [`RuntimeError::LxcfsNotMounted`] when `/proc/1/mountinfo` has no
/// LXCFS entry, or an IO error if mountinfo cannot be read.
pub fn check_host_mount() -> Result<()> {
    let mountinfo = std::fs::read_to_string("/proc/1/mountinfo")?;
    if mountinfo_has_lxcfs(&mountinfo) {
        Ok(())
    } else {
        Err(RuntimeError::LxcfsNotMounted)
    }
}

fn mountinfo_has_lxcfs(mountinfo: &str) -> bool {
    mountinfo.lines().any(|line| line.contains(LXCFS_HOME_DIR))
}

/// Rebinds every LXCFS proc file over the kernel one inside the mount
/// namespace of `pid`.
///
/// # Errors
///
/// Returns the first failed bind with the nsenter stderr attached.
pub async fn rebind_proc_files(pid: i64) -> Result<()> {
    let ns = MountNsEnter::new(pid);
    for file in LXCFS_PROC_FILES {
        let source = format!("{LXCFS_HOME_DIR}{file}");
        debug!(pid, file, "rebinding lxcfs proc file");
        ns.execute("mount", &["-B", &source, file])
            .await
            .map_err(|e| match e {
                RuntimeError::Nsenter { stderr, .. } => RuntimeError::Nsenter {
                    file: (*file).to_string(),
                    stderr,
                },
                other => other,
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mountinfo_matching() {
        let with = "409 406 0:49 / /var/lib/lxc/lxcfs rw,nosuid,nodev shared:218 - fuse.lxcfs lxcfs rw\n";
        assert!(mountinfo_has_lxcfs(with));

        let without = "25 30 0:23 / /sys rw,nosuid,nodev,noexec - sysfs sysfs rw\n\
                       26 30 0:24 / /proc rw,nosuid,nodev,noexec - proc proc rw\n";
        assert!(!mountinfo_has_lxcfs(without));

        assert!(!mountinfo_has_lxcfs(""));
    }

    #[test]
    fn test_proc_file_set() {
        assert_eq!(LXCFS_PROC_FILES.len(), 7);
        assert!(LXCFS_PROC_FILES.contains(&"/proc/meminfo"));
        assert!(LXCFS_PROC_FILES.iter().all(|f| f.starts_with("/proc/")));
    }
}
