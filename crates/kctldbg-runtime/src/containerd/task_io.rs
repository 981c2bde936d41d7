//! FIFO-backed task IO.
//!
//! containerd tasks take their stdio as FIFO paths on the node. The shim
//! rejects an empty stderr path even for terminal tasks, so when the session
//! has no separate stderr stream the stdout FIFO is passed for both.

use crate::error::Result;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::path::{Path, PathBuf};

/// Per-session FIFO set for one containerd task.
#[derive(Debug)]
pub struct TaskIo {
    dir: PathBuf,
    /// Task stdin FIFO (agent writes).
    pub stdin: PathBuf,
    /// Task stdout FIFO (agent reads).
    pub stdout: PathBuf,
    /// Task stderr FIFO; equals `stdout` when the session has no separate
    /// stderr stream.
    pub stderr: PathBuf,
}

impl TaskIo {
    /// Creates the FIFO directory and FIFOs for a session.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory or a FIFO cannot be created.
    pub fn create(session_id: &str, separate_stderr: bool) -> Result<Self> {
        let dir = std::env::temp_dir().join("kctldbg-fifo").join(session_id);
        std::fs::create_dir_all(&dir)?;

        let stdin = dir.join("stdin");
        let stdout = dir.join("stdout");
        make_fifo(&stdin)?;
        make_fifo(&stdout)?;

        let stderr = if separate_stderr {
            let stderr = dir.join("stderr");
            make_fifo(&stderr)?;
            stderr
        } else {
            stdout.clone()
        };

        Ok(Self {
            dir,
            stdin,
            stdout,
            stderr,
        })
    }

    /// Removes the FIFOs and their directory.
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %self.dir.display(), "failed to remove task fifos: {e}");
            }
        }
    }
}

fn make_fifo(path: &Path) -> Result<()> {
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}
