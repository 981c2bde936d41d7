//! Minimal Docker Engine API client over a unix socket.
//!
//! One connection per request; the attach path upgrades its connection and
//! hands the raw stream back to the adapter.

use crate::error::{Result, RuntimeError};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{HeaderName, HeaderValue};
use hyper::upgrade::Upgraded;
use hyper::{header, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;

/// Docker Engine API version prefix used on every request path.
pub const API_PREFIX: &str = "/v1.41";

/// Docker Engine API client bound to a unix socket.
#[derive(Debug)]
pub struct DockerClient {
    socket_path: PathBuf,
    endpoint: String,
}

impl DockerClient {
    /// Creates a client for a `unix://` endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Unavailable`] for non-unix endpoints.
    pub fn new(endpoint: &str) -> Result<Self> {
        let path = endpoint.strip_prefix("unix://").ok_or_else(|| {
            RuntimeError::Unavailable {
                endpoint: endpoint.to_string(),
                reason: "only unix:// docker endpoints are supported".to_string(),
            }
        })?;
        Ok(Self {
            socket_path: PathBuf::from(path),
            endpoint: endpoint.to_string(),
        })
    }

    /// Socket path this client connects to.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn handshake(&self) -> Result<http1::SendRequest<Full<Bytes>>> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            RuntimeError::Unavailable {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            }
        })?;
        let (sender, conn) = http1::Builder::new()
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|e| RuntimeError::Unavailable {
                endpoint: self.endpoint.clone(),
                reason: format!("handshake failed: {e}"),
            })?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!("docker connection ended: {e}");
            }
        });
        Ok(sender)
    }

    fn build_request(
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
        headers: &[(HeaderName, HeaderValue)],
    ) -> Result<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://localhost{path}"))
            .header(header::HOST, "localhost");
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let request = match body {
            Some(body) => {
                let bytes = serde_json::to_vec(body)
                    .map_err(|e| RuntimeError::DockerResponse(e.to_string()))?;
                builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::CONTENT_LENGTH, bytes.len())
                    .body(Full::new(Bytes::from(bytes)))
            }
            None => builder.body(Full::new(Bytes::new())),
        };
        request.map_err(|e| RuntimeError::DockerResponse(e.to_string()))
    }

    /// Performs a request and returns the status plus the collected body.
    ///
    /// # Errors
    ///
    /// Returns an error on connection or IO failure; HTTP error statuses are
    /// returned to the caller for interpretation.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
        headers: &[(HeaderName, HeaderValue)],
    ) -> Result<(StatusCode, Bytes)> {
        let mut sender = self.handshake().await?;
        let request = Self::build_request(method, path, body, headers)?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| RuntimeError::DockerResponse(format!("request failed: {e}")))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RuntimeError::DockerResponse(format!("failed to read response: {e}")))?
            .to_bytes();
        Ok((status, body))
    }

    /// GET returning a decoded JSON body; non-success statuses become
    /// [`RuntimeError::DockerResponse`] except 404, which becomes
    /// [`RuntimeError::TargetNotFound`].
    ///
    /// # Errors
    ///
    /// See above.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let (status, body) = self.request(Method::GET, path, None::<&()>, &[]).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::TargetNotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(error_from_body(status, &body));
        }
        serde_json::from_slice(&body).map_err(|e| RuntimeError::DockerResponse(e.to_string()))
    }

    /// POST with an optional JSON body, returning a decoded JSON response.
    ///
    /// # Errors
    ///
    /// As [`DockerClient::get_json`].
    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let (status, bytes) = self.request(Method::POST, path, body, &[]).await?;
        if !status.is_success() {
            return Err(error_from_body(status, &bytes));
        }
        serde_json::from_slice(&bytes).map_err(|e| RuntimeError::DockerResponse(e.to_string()))
    }

    /// POST expecting no response body.
    ///
    /// # Errors
    ///
    /// As [`DockerClient::get_json`].
    pub async fn post_empty(&self, path: &str) -> Result<()> {
        let (status, body) = self.request(Method::POST, path, None::<&()>, &[]).await?;
        if !status.is_success() {
            return Err(error_from_body(status, &body));
        }
        Ok(())
    }

    /// DELETE expecting no response body.
    ///
    /// # Errors
    ///
    /// As [`DockerClient::get_json`].
    pub async fn delete(&self, path: &str) -> Result<()> {
        let (status, body) = self
            .request(Method::DELETE, path, None::<&()>, &[])
            .await?;
        if !status.is_success() {
            return Err(error_from_body(status, &body));
        }
        Ok(())
    }

    /// POST returning the streaming response body (image pull progress).
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the daemon responds with a
    /// non-success status.
    pub async fn post_streaming(
        &self,
        path: &str,
        headers: &[(HeaderName, HeaderValue)],
    ) -> Result<Incoming> {
        let mut sender = self.handshake().await?;
        let request = Self::build_request(Method::POST, path, None::<&()>, headers)?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| RuntimeError::DockerResponse(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map(http_body_util::Collected::to_bytes)
                .unwrap_or_default();
            return Err(error_from_body(status, &body));
        }
        Ok(response.into_body())
    }

    /// POSTs an upgrade request and returns the hijacked stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon refuses the upgrade.
    pub async fn upgrade(&self, path: &str) -> Result<TokioIo<Upgraded>> {
        let mut sender = self.handshake().await?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("http://localhost{path}"))
            .header(header::HOST, "localhost")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "tcp")
            .body(Full::new(Bytes::new()))
            .map_err(|e| RuntimeError::DockerResponse(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| RuntimeError::DockerResponse(format!("attach request failed: {e}")))?;

        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS && !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map(http_body_util::Collected::to_bytes)
                .unwrap_or_default();
            return Err(error_from_body(status, &body));
        }

        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| RuntimeError::DockerResponse(format!("attach upgrade failed: {e}")))?;
        Ok(TokioIo::new(upgraded))
    }
}

fn error_from_body(status: StatusCode, body: &Bytes) -> RuntimeError {
    // Docker errors come as {"message": "..."}; fall back to the raw body.
    let message = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    RuntimeError::DockerResponse(format!("{status}; {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let client = DockerClient::new("unix:///var/run/docker.sock").unwrap();
        assert_eq!(
            client.socket_path(),
            Path::new("/var/run/docker.sock")
        );

        assert!(matches!(
            DockerClient::new("tcp://127.0.0.1:2375"),
            Err(RuntimeError::Unavailable { .. })
        ));
    }
}
