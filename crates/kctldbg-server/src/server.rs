//! Agent HTTP server.
//!
//! Serves the router over plain HTTP/1.1 with upgrade support; the debug
//! endpoint hijacks its connection after the 101 response, so every
//! connection is served with `with_upgrades`.

use crate::api::create_router;
use crate::error::{Result, ServerError};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use kctldbg_config::Config;
use kctldbg_runtime::containerd::progress::PullTracker;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::Service;
use tower_http::trace::TraceLayer;
use tracing::info;

/// The debug-agent HTTP server.
pub struct AgentServer {
    config: Arc<Config>,
    tracker: Arc<PullTracker>,
}

impl AgentServer {
    /// Creates a server from loaded configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            tracker: Arc::new(PullTracker::new()),
        }
    }

    /// Binds the configured address and serves until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] when the listen address cannot be
    /// bound and [`ServerError::Io`] on accept failures.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_address)
            .await
            .map_err(|source| ServerError::Bind {
                address: self.config.listen_address.clone(),
                source,
            })?;
        info!("listening on {}", self.config.listen_address);

        let app = create_router(self.config.clone(), self.tracker.clone())
            .layer(TraceLayer::new_for_http());

        tokio::pin!(shutdown);
        loop {
            let (stream, _) = tokio::select! {
                () = &mut shutdown => {
                    info!("shutting down server");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            let tower_service = app.clone();
            tokio::spawn(async move {
                let hyper_service =
                    hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                        tower_service.clone().call(request)
                    });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), hyper_service)
                    .with_upgrades()
                    .await
                {
                    let err_str = err.to_string().to_lowercase();
                    if !err_str.contains("shutting down")
                        && !err_str.contains("connection reset")
                        && !err_str.contains("broken pipe")
                    {
                        tracing::error!("error serving connection: {err}");
                    }
                }
            });
        }
    }
}
