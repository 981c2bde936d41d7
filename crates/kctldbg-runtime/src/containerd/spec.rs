//! OCI runtime spec assembly for the debug container.
//!
//! The spec starts from the image config, gains a privileged process
//! profile, and has its network, IPC and PID namespaces pointed at the
//! target's `/proc/<pid>/ns` files. The user namespace stays host-default:
//! kubelet-managed containers share the host user namespace, and binding it
//! fails with uid-mapping errors.

use crate::error::{Result, RuntimeError};
use crate::nspath;
use oci_spec::image::ImageConfiguration;
use oci_spec::runtime::{
    Capability, LinuxCapabilitiesBuilder, LinuxNamespace, LinuxNamespaceBuilder,
    LinuxNamespaceType, Mount, MountBuilder, RootBuilder, Spec,
};
use std::collections::HashSet;
use std::path::Path;

/// Every capability a privileged debug shell gets.
const FULL_CAPABILITIES: &[Capability] = &[
    Capability::AuditControl,
    Capability::AuditRead,
    Capability::AuditWrite,
    Capability::BlockSuspend,
    Capability::Bpf,
    Capability::CheckpointRestore,
    Capability::Chown,
    Capability::DacOverride,
    Capability::DacReadSearch,
    Capability::Fowner,
    Capability::Fsetid,
    Capability::IpcLock,
    Capability::IpcOwner,
    Capability::Kill,
    Capability::Lease,
    Capability::LinuxImmutable,
    Capability::MacAdmin,
    Capability::MacOverride,
    Capability::Mknod,
    Capability::NetAdmin,
    Capability::NetBindService,
    Capability::NetBroadcast,
    Capability::NetRaw,
    Capability::Perfmon,
    Capability::Setfcap,
    Capability::Setgid,
    Capability::Setpcap,
    Capability::Setuid,
    Capability::SysAdmin,
    Capability::SysBoot,
    Capability::SysChroot,
    Capability::SysModule,
    Capability::SysNice,
    Capability::SysPacct,
    Capability::SysPtrace,
    Capability::SysRawio,
    Capability::SysResource,
    Capability::SysTime,
    Capability::SysTtyConfig,
    Capability::Syslog,
    Capability::WakeAlarm,
];

/// Assembles the debug container spec.
///
/// # Errors
///
/// Returns [`RuntimeError::Spec`] when a builder rejects its inputs.
pub fn build_debug_spec(
    image_config: &ImageConfiguration,
    argv: &[String],
    target_pid: i64,
    audit_fifo: Option<&Path>,
) -> Result<Spec> {
    let mut spec = Spec::default();

    spec.set_root(Some(
        RootBuilder::default()
            .path("rootfs")
            .readonly(false)
            .build()
            .map_err(spec_err)?,
    ));

    let mut process = spec.process().clone().unwrap_or_default();
    process.set_args(Some(argv.to_vec()));
    process.set_terminal(Some(true));

    let (mut env, cwd) = image_defaults(image_config);
    env.push("TERM=xterm".to_string());
    process.set_env(Some(env));
    process.set_cwd(cwd.into());

    let caps: HashSet<Capability> = FULL_CAPABILITIES.iter().copied().collect();
    process.set_capabilities(Some(
        LinuxCapabilitiesBuilder::default()
            .bounding(caps.clone())
            .effective(caps.clone())
            .permitted(caps.clone())
            .inheritable(caps.clone())
            .ambient(caps)
            .build()
            .map_err(spec_err)?,
    ));
    process.set_no_new_privileges(Some(false));
    spec.set_process(Some(process));

    let mut linux = spec.linux().clone().unwrap_or_default();
    linux.set_namespaces(Some(debug_namespaces(target_pid)?));
    // A privileged shell sees the real /proc and /sys.
    linux.set_masked_paths(None);
    linux.set_readonly_paths(None);
    linux.set_seccomp(None);
    linux.set_resources(None);
    spec.set_linux(Some(linux));

    if let Some(fifo) = audit_fifo {
        let mut mounts = spec.mounts().clone().unwrap_or_default();
        mounts.push(audit_fifo_mount(fifo)?);
        spec.set_mounts(Some(mounts));
    }

    Ok(spec)
}

/// Namespaces for the debug container: fresh mount and UTS, target-bound
/// network, IPC and PID, and no user namespace entry at all.
fn debug_namespaces(target_pid: i64) -> Result<Vec<LinuxNamespace>> {
    let own = |typ: LinuxNamespaceType| {
        LinuxNamespaceBuilder::default()
            .typ(typ)
            .build()
            .map_err(spec_err)
    };
    let joined = |typ: LinuxNamespaceType, path: String| {
        LinuxNamespaceBuilder::default()
            .typ(typ)
            .path(path)
            .build()
            .map_err(spec_err)
    };

    Ok(vec![
        own(LinuxNamespaceType::Mount)?,
        own(LinuxNamespaceType::Uts)?,
        joined(
            LinuxNamespaceType::Network,
            nspath::network_namespace(target_pid),
        )?,
        joined(LinuxNamespaceType::Ipc, nspath::ipc_namespace(target_pid))?,
        joined(LinuxNamespaceType::Pid, nspath::pid_namespace(target_pid))?,
    ])
}

/// Read-write bind of the audit FIFO at the same path inside the container.
fn audit_fifo_mount(fifo: &Path) -> Result<Mount> {
    MountBuilder::default()
        .destination(fifo)
        .typ("bind")
        .source(fifo)
        .options(vec!["bind".to_string(), "rw".to_string()])
        .build()
        .map_err(spec_err)
}

/// Env and working directory carried over from the image config.
fn image_defaults(image_config: &ImageConfiguration) -> (Vec<String>, String) {
    let config = image_config.config().as_ref();
    let env = config
        .and_then(|c| c.env().clone())
        .unwrap_or_default();
    let cwd = config
        .and_then(|c| c.working_dir().clone())
        .filter(|w| !w.is_empty())
        .unwrap_or_else(|| "/".to_string());
    (env, cwd)
}

fn spec_err(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Spec(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(audit: Option<&Path>) -> Spec {
        let config = ImageConfiguration::default();
        build_debug_spec(&config, &["sh".to_string(), "-c".to_string(), "id".to_string()], 4242, audit)
            .unwrap()
    }

    #[test]
    fn test_namespaces_bind_target_and_skip_user() {
        let spec = build(None);
        let namespaces = spec.linux().as_ref().unwrap().namespaces().clone().unwrap();

        let find = |typ: LinuxNamespaceType| {
            namespaces
                .iter()
                .find(|n| n.typ() == typ)
                .map(|n| n.path().clone())
        };

        assert_eq!(
            find(LinuxNamespaceType::Network).unwrap().unwrap(),
            std::path::PathBuf::from("/proc/4242/ns/net")
        );
        assert_eq!(
            find(LinuxNamespaceType::Ipc).unwrap().unwrap(),
            std::path::PathBuf::from("/proc/4242/ns/ipc")
        );
        assert_eq!(
            find(LinuxNamespaceType::Pid).unwrap().unwrap(),
            std::path::PathBuf::from("/proc/4242/ns/pid")
        );
        // Fresh mount namespace, no path.
        assert_eq!(find(LinuxNamespaceType::Mount).unwrap(), None);
        // No user namespace entry at all.
        assert!(find(LinuxNamespaceType::User).is_none());
    }

    #[test]
    fn test_process_is_privileged_tty() {
        let spec = build(None);
        let process = spec.process().as_ref().unwrap();
        assert_eq!(process.terminal(), Some(true));
        assert_eq!(
            process.args().as_ref().unwrap(),
            &vec!["sh".to_string(), "-c".to_string(), "id".to_string()]
        );
        assert!(process
            .env()
            .as_ref()
            .unwrap()
            .iter()
            .any(|e| e == "TERM=xterm"));

        let caps = process.capabilities().as_ref().unwrap();
        assert!(caps
            .effective()
            .as_ref()
            .unwrap()
            .contains(&Capability::SysPtrace));
        assert!(caps
            .bounding()
            .as_ref()
            .unwrap()
            .contains(&Capability::SysAdmin));
    }

    #[test]
    fn test_audit_fifo_bind_mount() {
        let fifo = std::path::Path::new("/var/data/fifo/abc");
        let spec = build(Some(fifo));
        let mounts = spec.mounts().as_ref().unwrap();
        let bind = mounts
            .iter()
            .find(|m| m.destination().as_path() == fifo)
            .expect("audit fifo mount present");
        assert_eq!(bind.typ().as_deref(), Some("bind"));
        assert_eq!(bind.source().as_deref(), Some(fifo));
        assert!(bind
            .options()
            .as_ref()
            .unwrap()
            .contains(&"rw".to_string()));
    }

    #[test]
    fn test_no_seccomp_or_masked_paths() {
        let spec = build(None);
        let linux = spec.linux().as_ref().unwrap();
        assert!(linux.seccomp().is_none());
        assert!(linux.masked_paths().is_none());
        assert!(linux.readonly_paths().is_none());
    }
}
