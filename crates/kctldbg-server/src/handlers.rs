//! Request handlers.
//!
//! `/api/v1/debug` validates its query parameters while the connection is
//! still plain HTTP; anything wrong comes back as a 400 with a colon-free
//! text body. Once the parameters check out the connection is upgraded and
//! the session runs detached from the handler.

use crate::api::AppState;
use crate::error::ServerError;
use crate::session::DebugSession;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use kctldbg_runtime::{new_runtime, RegistryAuth, RuntimeEndpoints, RuntimeScheme};
use kctldbg_stream::{serve_upgrade, StreamOptions, StreamTimeouts};
use serde::Deserialize;
use tracing::{debug, info};

/// Environment variable pinning the debug image server-side. When set, any
/// client-supplied image is overridden; operators use this to restrict what
/// can be loaded onto sensitive hosts.
pub const RESTRICT_IMAGE_ENV: &str = "KCTLDBG_RESTRICT_IMAGE_TO";

/// Query parameters of `/api/v1/debug`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebugQuery {
    /// Target URI, `<scheme>://<id>`.
    pub container: Option<String>,
    /// Debug image reference.
    pub image: Option<String>,
    /// JSON-encoded argv list.
    pub command: Option<String>,
    /// `user:password` registry credentials.
    #[serde(rename = "authStr")]
    pub auth_str: Option<String>,
    /// Enable LXCFS proc-file rebinding.
    #[serde(rename = "lxcfsEnabled")]
    pub lxcfs_enabled: Option<String>,
    /// Skip registry TLS verification.
    #[serde(rename = "registrySkipTLS")]
    pub registry_skip_tls: Option<String>,
    /// Client-requested verbosity.
    pub verbosity: Option<String>,
    /// Operator hostname, audit label only.
    pub hostname: Option<String>,
    /// Operator username, audit label only.
    pub username: Option<String>,
}

/// Everything a session needs, fixed at request receipt.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    /// Which runtime owns the target.
    pub scheme: RuntimeScheme,
    /// Target container id.
    pub container_id: String,
    /// Debug image, after any server-side pin.
    pub image: String,
    /// Operator argv.
    pub command: Vec<String>,
    /// Registry credentials.
    pub auth: Option<RegistryAuth>,
    /// Skip registry TLS verification.
    pub registry_skip_tls: bool,
    /// LXCFS rebinding requested.
    pub lxcfs_enabled: bool,
    /// Effective verbosity: max of client request and server config.
    pub verbosity: u32,
    /// Operator hostname label.
    pub hostname: String,
    /// Operator username label.
    pub username: String,
}

/// Builds a session descriptor from the query string.
///
/// Pure in its inputs: the same query, server verbosity and image pin
/// always produce the same descriptor.
///
/// # Errors
///
/// Returns [`ServerError::BadRequest`] for missing or malformed parameters
/// and unsupported runtime schemes.
pub fn build_descriptor(
    query: &DebugQuery,
    server_verbosity: u32,
    image_pin: Option<&str>,
) -> crate::Result<SessionDescriptor> {
    let container = query
        .container
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ServerError::BadRequest("target container id must be provided".into()))?;
    let (scheme, container_id) = container.split_once("://").ok_or_else(|| {
        ServerError::BadRequest(format!(
            "target container id must have form scheme://id but was {container}"
        ))
    })?;
    let scheme: RuntimeScheme = scheme
        .parse()
        .map_err(|e: kctldbg_runtime::RuntimeError| ServerError::BadRequest(e.to_string()))?;
    if container_id.is_empty() {
        return Err(ServerError::BadRequest(
            "target container id must be provided".into(),
        ));
    }

    let image = match image_pin.filter(|pin| !pin.is_empty()) {
        Some(pin) => pin.to_string(),
        None => query
            .image
            .clone()
            .filter(|i| !i.is_empty())
            .ok_or_else(|| ServerError::BadRequest("image must be provided".into()))?,
    };

    let command: Vec<String> = query
        .command
        .as_deref()
        .and_then(|c| serde_json::from_str(c).ok())
        .filter(|c: &Vec<String>| !c.is_empty())
        .ok_or_else(|| ServerError::BadRequest("cannot parse command".into()))?;

    let client_verbosity = query
        .verbosity
        .as_deref()
        .filter(|v| !v.is_empty())
        .map_or(Ok(0), str::parse)
        .map_err(|_| ServerError::BadRequest("verbosity must be a non-negative integer".into()))?;

    Ok(SessionDescriptor {
        scheme,
        container_id: container_id.to_string(),
        image,
        command,
        auth: query.auth_str.as_deref().and_then(RegistryAuth::parse),
        registry_skip_tls: flag(query.registry_skip_tls.as_deref()),
        lxcfs_enabled: flag(query.lxcfs_enabled.as_deref()),
        verbosity: client_verbosity.max(server_verbosity),
        hostname: query.hostname.clone().unwrap_or_default(),
        username: query.username.clone().unwrap_or_default(),
    })
}

/// Only the literal "true" enables a flag; everything else is false.
fn flag(value: Option<&str>) -> bool {
    value == Some("true")
}

/// `GET /healthz`.
pub async fn healthz() -> &'static str {
    "I'm OK!"
}

/// `POST /api/v1/debug`: validate, upgrade, hand off to a session.
pub async fn debug(
    State(state): State<AppState>,
    Query(query): Query<DebugQuery>,
    mut req: Request<Body>,
) -> Response {
    info!("received debug request");

    let image_pin = std::env::var(RESTRICT_IMAGE_ENV).ok();
    let descriptor = match build_descriptor(&query, state.config.verbosity, image_pin.as_deref()) {
        Ok(descriptor) => descriptor,
        Err(e) => return e.into_response(),
    };
    debug!(
        target = %descriptor.container_id,
        image = %descriptor.image,
        command = ?descriptor.command,
        "accepted debug request"
    );

    let endpoints = RuntimeEndpoints {
        docker: state.config.docker_endpoint.clone(),
        containerd: state.config.containerd_endpoint.clone(),
    };
    let runtime = match new_runtime(descriptor.scheme, &endpoints, state.tracker.clone()) {
        Ok(runtime) => runtime,
        Err(e) => return ServerError::from(e).into_response(),
    };

    // The kubelet attach contract: interactive PTY, stderr fused into
    // stdout, so only stdin and stdout are declared.
    let opts = StreamOptions {
        stdin: true,
        stdout: true,
        stderr: false,
    };
    let timeouts = StreamTimeouts {
        creation: state.config.stream_creation_timeout,
        idle: state.config.stream_idle_timeout,
    };
    let (response, streams) = match serve_upgrade(&mut req, opts, timeouts) {
        Ok(upgraded) => upgraded,
        Err(e) => return ServerError::from(e).into_response(),
    };

    let session = DebugSession::new(descriptor, runtime, state.config.clone());
    tokio::spawn(session.run(streams));

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_query() -> DebugQuery {
        DebugQuery {
            container: Some("docker://abc123".into()),
            image: Some("busybox:latest".into()),
            command: Some(r#"["sh","-c","echo hi"]"#.into()),
            ..DebugQuery::default()
        }
    }

    #[test]
    fn test_descriptor_happy_path() {
        let descriptor = build_descriptor(&valid_query(), 0, None).unwrap();
        assert_eq!(descriptor.scheme, RuntimeScheme::Docker);
        assert_eq!(descriptor.container_id, "abc123");
        assert_eq!(descriptor.image, "busybox:latest");
        assert_eq!(descriptor.command, vec!["sh", "-c", "echo hi"]);
        assert!(descriptor.auth.is_none());
        assert!(!descriptor.lxcfs_enabled);
        assert!(!descriptor.registry_skip_tls);
        assert_eq!(descriptor.verbosity, 0);
    }

    #[test]
    fn test_descriptor_is_deterministic() {
        let query = valid_query();
        let a = build_descriptor(&query, 1, None).unwrap();
        let b = build_descriptor(&query, 1, None).unwrap();
        assert_eq!(a.container_id, b.container_id);
        assert_eq!(a.image, b.image);
        assert_eq!(a.command, b.command);
        assert_eq!(a.verbosity, b.verbosity);
    }

    #[test]
    fn test_missing_container_rejected() {
        let mut query = valid_query();
        query.container = None;
        assert!(build_descriptor(&query, 0, None).is_err());

        query.container = Some(String::new());
        assert!(build_descriptor(&query, 0, None).is_err());
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let mut query = valid_query();
        query.container = Some("cri-o://abc".into());
        let err = build_descriptor(&query, 0, None).unwrap_err();
        assert!(err.to_string().contains("docker and containerd"));

        query.container = Some("no-scheme-at-all".into());
        assert!(build_descriptor(&query, 0, None).is_err());
    }

    #[test]
    fn test_command_must_decode_to_nonempty_list() {
        let mut query = valid_query();
        query.command = Some("not json".into());
        assert!(build_descriptor(&query, 0, None).is_err());

        query.command = Some("[]".into());
        assert!(build_descriptor(&query, 0, None).is_err());

        query.command = None;
        assert!(build_descriptor(&query, 0, None).is_err());
    }

    #[test]
    fn test_image_pin_overrides_client_image() {
        let descriptor = build_descriptor(&valid_query(), 0, Some("pinned/debug:1")).unwrap();
        assert_eq!(descriptor.image, "pinned/debug:1");

        // An empty pin does not count.
        let descriptor = build_descriptor(&valid_query(), 0, Some("")).unwrap();
        assert_eq!(descriptor.image, "busybox:latest");

        // The pin also satisfies a request with no image at all.
        let mut query = valid_query();
        query.image = None;
        let descriptor = build_descriptor(&query, 0, Some("pinned/debug:1")).unwrap();
        assert_eq!(descriptor.image, "pinned/debug:1");
    }

    #[test]
    fn test_effective_verbosity_is_max() {
        let mut query = valid_query();
        query.verbosity = Some("2".into());
        assert_eq!(build_descriptor(&query, 0, None).unwrap().verbosity, 2);
        assert_eq!(build_descriptor(&query, 5, None).unwrap().verbosity, 5);

        query.verbosity = None;
        assert_eq!(build_descriptor(&query, 3, None).unwrap().verbosity, 3);
    }

    #[test]
    fn test_flags_and_labels() {
        let mut query = valid_query();
        query.lxcfs_enabled = Some("true".into());
        query.registry_skip_tls = Some("false".into());
        query.auth_str = Some("bob:hunter2".into());
        query.hostname = Some("op-laptop".into());
        query.username = Some("bob".into());

        let descriptor = build_descriptor(&query, 0, None).unwrap();
        assert!(descriptor.lxcfs_enabled);
        assert!(!descriptor.registry_skip_tls);
        assert_eq!(descriptor.auth.as_ref().unwrap().username, "bob");
        assert_eq!(descriptor.hostname, "op-laptop");
        assert_eq!(descriptor.username, "bob");

        // Anything but the literal "true" is false.
        query.lxcfs_enabled = Some("yes".into());
        assert!(!build_descriptor(&query, 0, None).unwrap().lxcfs_enabled);
    }
}
