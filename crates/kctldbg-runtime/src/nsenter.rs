//! Mount-namespace command execution via nsenter.

use crate::error::{Result, RuntimeError};
use std::path::PathBuf;
use tokio::process::Command;

/// Runs commands inside another process's mount namespace.
#[derive(Debug, Clone)]
pub struct MountNsEnter {
    /// Target PID whose mount namespace is entered.
    pub target: i64,
    /// Explicit namespace file; defaults to `/proc/<pid>/ns/mnt`.
    pub mount_file: Option<PathBuf>,
}

impl MountNsEnter {
    /// Enters the mount namespace of `target`.
    #[must_use]
    pub const fn new(target: i64) -> Self {
        Self {
            target,
            mount_file: None,
        }
    }

    /// Executes `command` with `args` inside the target mount namespace and
    /// returns its stdout.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Nsenter`] with the subprocess stderr on a
    /// non-zero exit, or an IO error if nsenter itself cannot be spawned.
    pub async fn execute(&self, command: &str, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("nsenter");
        cmd.arg("--target").arg(self.target.to_string());
        match &self.mount_file {
            Some(file) => cmd.arg(format!("--mount={}", file.display())),
            None => cmd.arg("--mount"),
        };
        cmd.arg("--").arg(command).args(args);

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(RuntimeError::Nsenter {
                file: command.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
