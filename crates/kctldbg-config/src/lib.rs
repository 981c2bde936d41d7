//! Agent configuration.
//!
//! The agent is configured with a single flat YAML file. Unknown keys are
//! rejected so that typos surface at startup instead of silently falling
//! back to defaults. An empty file body, or no file at all, yields the
//! default configuration.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading the agent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config body is not valid YAML or contains unknown keys.
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Agent configuration.
///
/// Every field has a default; a missing key means "use the default".
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Docker daemon endpoint.
    pub docker_endpoint: String,

    /// containerd gRPC socket path.
    pub containerd_endpoint: String,

    /// Bound on every individual runtime operation, including cleanup.
    #[serde(with = "humantime_serde")]
    pub runtime_timeout: Duration,

    /// Maximum time with no byte flowing in either stream direction.
    #[serde(with = "humantime_serde")]
    pub stream_idle_timeout: Duration,

    /// Maximum time between connection upgrade and all streams being open.
    #[serde(with = "humantime_serde")]
    pub stream_creation_timeout: Duration,

    /// host:port the HTTP server binds to.
    pub listen_address: String,

    /// Server-side verbosity floor; the effective session verbosity is the
    /// max of this and the client-requested value.
    pub verbosity: u32,

    /// Whether to wrap debug commands with the audit shim.
    pub audit: bool,

    /// FIFO path template; `KCTLDBG-CONTAINER-ID` is replaced per session.
    pub audit_fifo: String,

    /// Shim argv template; `KCTLDBG-FIFO` is replaced with the FIFO path.
    pub audit_shim: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker_endpoint: "unix:///var/run/docker.sock".to_string(),
            containerd_endpoint: "/run/containerd/containerd.sock".to_string(),
            runtime_timeout: Duration::from_secs(30),
            stream_idle_timeout: Duration::from_secs(10 * 60),
            stream_creation_timeout: Duration::from_secs(15),
            listen_address: "0.0.0.0:10027".to_string(),
            verbosity: 0,
            audit: false,
            audit_fifo: "/var/data/kubectl-debug-audit-fifo/KCTLDBG-CONTAINER-ID"
                .to_string(),
            audit_shim: vec![
                "/usr/bin/strace".to_string(),
                "-o".to_string(),
                "KCTLDBG-FIFO".to_string(),
                "-f".to_string(),
                "-e".to_string(),
                "trace=/exec".to_string(),
            ],
        }
    }
}

impl Config {
    /// Parses a configuration from a YAML document.
    ///
    /// An empty (or whitespace-only) body yields the defaults; YAML never
    /// invokes the deserializer for an empty input, so this case is handled
    /// up front.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed YAML or unknown keys.
    pub fn load(body: &str) -> Result<Self> {
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(body)?)
    }

    /// Loads a configuration from a file.
    ///
    /// An empty path means "no file": the defaults are returned.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it cannot be parsed.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Ok(Self::default());
        }
        let body = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.docker_endpoint, "unix:///var/run/docker.sock");
        assert_eq!(cfg.containerd_endpoint, "/run/containerd/containerd.sock");
        assert_eq!(cfg.runtime_timeout, Duration::from_secs(30));
        assert_eq!(cfg.stream_idle_timeout, Duration::from_secs(600));
        assert_eq!(cfg.stream_creation_timeout, Duration::from_secs(15));
        assert_eq!(cfg.listen_address, "0.0.0.0:10027");
        assert_eq!(cfg.verbosity, 0);
        assert!(!cfg.audit);
        assert!(cfg.audit_fifo.contains("KCTLDBG-CONTAINER-ID"));
        assert_eq!(cfg.audit_shim[0], "/usr/bin/strace");
    }

    #[test]
    fn test_empty_body_is_defaults() {
        let cfg = Config::load("").unwrap();
        assert_eq!(cfg.listen_address, "0.0.0.0:10027");

        let cfg = Config::load("   \n  \n").unwrap();
        assert_eq!(cfg.verbosity, 0);
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let cfg = Config::load("listen_address: 127.0.0.1:9000\nverbosity: 2\n").unwrap();
        assert_eq!(cfg.listen_address, "127.0.0.1:9000");
        assert_eq!(cfg.verbosity, 2);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.runtime_timeout, Duration::from_secs(30));
        assert!(!cfg.audit);
    }

    #[test]
    fn test_duration_strings() {
        let cfg = Config::load(
            "runtime_timeout: 45s\nstream_idle_timeout: 5m\nstream_creation_timeout: 1m 30s\n",
        )
        .unwrap();
        assert_eq!(cfg.runtime_timeout, Duration::from_secs(45));
        assert_eq!(cfg.stream_idle_timeout, Duration::from_secs(300));
        assert_eq!(cfg.stream_creation_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = Config::load("docker_endpont: unix:///tmp/d.sock\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_audit_settings() {
        let cfg = Config::load(
            "audit: true\naudit_fifo: /tmp/fifo/KCTLDBG-CONTAINER-ID\naudit_shim: [\"/bin/sh\", \"-c\", \"echo hi > KCTLDBG-FIFO\"]\n",
        )
        .unwrap();
        assert!(cfg.audit);
        assert_eq!(cfg.audit_fifo, "/tmp/fifo/KCTLDBG-CONTAINER-ID");
        assert_eq!(cfg.audit_shim.len(), 3);
    }

    #[test]
    fn test_load_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "listen_address: 0.0.0.0:10099").unwrap();
        let cfg = Config::load_file(f.path()).unwrap();
        assert_eq!(cfg.listen_address, "0.0.0.0:10099");
    }

    #[test]
    fn test_empty_path_means_no_file() {
        let cfg = Config::load_file("").unwrap();
        assert_eq!(cfg.listen_address, "0.0.0.0:10027");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Config::load_file("/nonexistent/kctldbg.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
