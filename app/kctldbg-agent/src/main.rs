//! The kctldbg debug agent.
//!
//! Runs on a cluster node with host PID namespace and access to the
//! runtime sockets; serves debug-container sessions over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use kctldbg_config::Config;
use kctldbg_server::AgentServer;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "kctldbg-agent")]
#[command(author, version, about, long_about = None)]
struct AgentArgs {
    /// Config file location. An empty value means built-in defaults.
    #[arg(long = "config.file", default_value = "")]
    config_file: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kctldbg=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(e) = run(AgentArgs::parse()).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: AgentArgs) -> Result<()> {
    let config =
        Config::load_file(&args.config_file).context("failed to load configuration")?;
    info!(
        listen = %config.listen_address,
        docker = %config.docker_endpoint,
        containerd = %config.containerd_endpoint,
        audit = config.audit,
        "starting debug agent"
    );

    let server = AgentServer::new(config);
    server.run(shutdown_signal()).await?;

    info!("debug agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
