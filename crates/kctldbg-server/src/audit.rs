//! Audit shim wiring.
//!
//! When auditing is enabled the operator's command is wrapped with an
//! external exec tracer (strace by default) whose output lands in a
//! per-session FIFO. The agent reads the FIFO and logs one line per traced
//! exec with the session's identity labels, so the node log answers "who
//! ran what inside which container".

use crate::error::{Result, ServerError};
use kctldbg_runtime::AuditBind;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Placeholder in the FIFO path template replaced by the session UUID.
pub const FIFO_ID_TOKEN: &str = "KCTLDBG-CONTAINER-ID";

/// Placeholder in the shim argv replaced by the FIFO path.
pub const FIFO_PATH_TOKEN: &str = "KCTLDBG-FIFO";

/// One session's audit FIFO plus its reader task.
#[derive(Debug)]
pub struct AuditSession {
    fifo: PathBuf,
    argv: Vec<String>,
    reader: JoinHandle<()>,
}

impl AuditSession {
    /// Creates the FIFO, starts the reader and builds the wrapped argv.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AuditSetup`] when the FIFO or its parent
    /// directories cannot be created.
    pub fn create(
        fifo_template: &str,
        shim_template: &[String],
        command: &[String],
        username: &str,
        debuggee: &str,
    ) -> Result<Self> {
        let session_uuid = Uuid::new_v4().to_string();
        let fifo = PathBuf::from(substitute_fifo_path(fifo_template, &session_uuid));

        if let Some(parent) = fifo.parent() {
            std::fs::create_dir_all(parent)
                .and_then(|()| std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o777)))
                .map_err(|e| {
                    ServerError::AuditSetup(format!(
                        "cannot create fifo directory {}; {e}",
                        parent.display()
                    ))
                })?;
        }
        mkfifo(&fifo, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
            ServerError::AuditSetup(format!("cannot create fifo {}; {e}", fifo.display()))
        })?;
        debug!(fifo = %fifo.display(), "created audit fifo");

        let reader = spawn_reader(fifo.clone(), username.to_string(), debuggee.to_string());
        let argv = wrap_command(shim_template, &fifo, command);

        Ok(Self { fifo, argv, reader })
    }

    /// Wiring for the runtime adapter: the FIFO to bind-mount and the
    /// wrapped argv to run.
    #[must_use]
    pub fn bind(&self) -> AuditBind {
        AuditBind {
            fifo: self.fifo.clone(),
            argv: self.argv.clone(),
        }
    }

    /// Unlinks the FIFO and stops the reader. The debug container is gone
    /// by the time this runs, so every tracer record has been flushed.
    pub fn close(self) {
        if let Err(e) = std::fs::remove_file(&self.fifo) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(fifo = %self.fifo.display(), "failed to remove audit fifo: {e}");
            }
        }
        // The reader normally exits on EOF; aborting covers sessions that
        // died before the shim ever opened the FIFO.
        self.reader.abort();
    }
}

fn spawn_reader(fifo: PathBuf, username: String, debuggee: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(fifo = %fifo.display(), "audit reader started");
        let file = match tokio::fs::File::open(&fifo).await {
            Ok(file) => file,
            Err(e) => {
                warn!(fifo = %fifo.display(), "audit reader failed to open fifo: {e}");
                return;
            }
        };
        let mut lines = tokio::io::BufReader::new(file).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    info!("audit - user:{username} debugee:{debuggee} exec:{line}");
                }
                Ok(None) => {
                    debug!(fifo = %fifo.display(), "audit fifo reached EOF, reader exiting");
                    return;
                }
                Err(e) => {
                    warn!(fifo = %fifo.display(), "audit reader error: {e}");
                    return;
                }
            }
        }
    })
}

/// Substitutes the session UUID into the FIFO path template.
#[must_use]
pub fn substitute_fifo_path(template: &str, session_uuid: &str) -> String {
    template.replace(FIFO_ID_TOKEN, session_uuid)
}

/// Prepends the shim to the operator command, substituting the FIFO path.
#[must_use]
pub fn wrap_command(shim_template: &[String], fifo: &Path, command: &[String]) -> Vec<String> {
    let fifo = fifo.display().to_string();
    shim_template
        .iter()
        .map(|arg| arg.replace(FIFO_PATH_TOKEN, &fifo))
        .chain(command.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_path_substitution() {
        let path = substitute_fifo_path(
            "/var/data/kubectl-debug-audit-fifo/KCTLDBG-CONTAINER-ID",
            "1234-abcd",
        );
        assert_eq!(path, "/var/data/kubectl-debug-audit-fifo/1234-abcd");

        // A template without the token is used verbatim.
        assert_eq!(substitute_fifo_path("/tmp/static-fifo", "x"), "/tmp/static-fifo");
    }

    #[test]
    fn test_wrap_command() {
        let shim = vec![
            "/usr/bin/strace".to_string(),
            "-o".to_string(),
            "KCTLDBG-FIFO".to_string(),
            "-f".to_string(),
            "-e".to_string(),
            "trace=/exec".to_string(),
        ];
        let command = vec!["sh".to_string(), "-c".to_string(), "id".to_string()];
        let argv = wrap_command(&shim, Path::new("/var/data/fifo/xyz"), &command);
        assert_eq!(
            argv,
            vec![
                "/usr/bin/strace",
                "-o",
                "/var/data/fifo/xyz",
                "-f",
                "-e",
                "trace=/exec",
                "sh",
                "-c",
                "id",
            ]
        );
    }

    #[tokio::test]
    async fn test_create_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/audit/{FIFO_ID_TOKEN}", dir.path().display());
        let shim = vec!["/bin/true".to_string(), "KCTLDBG-FIFO".to_string()];
        let command = vec!["ls".to_string()];

        let session =
            AuditSession::create(&template, &shim, &command, "alice", "target-1").unwrap();
        let bind = session.bind();
        assert!(bind.fifo.exists());
        assert_eq!(bind.argv.len(), 3);
        assert_eq!(bind.argv[1], bind.fifo.display().to_string());
        assert_eq!(bind.argv[2], "ls");

        let fifo = bind.fifo.clone();
        session.close();
        assert!(!fifo.exists());
    }
}
