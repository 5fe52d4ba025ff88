//! previewd - build and run submitted projects in throwaway sandboxes.
//!
//! Usage:
//!   previewd serve [--port 8080] [--runtime docker|local]

use anyhow::Context;
use clap::{Parser, Subcommand};
use previewd::config::{
    OrchestratorConfig, RuntimeKind, DEFAULT_BUILD_IMAGE, DEFAULT_BUILD_SCRIPT,
    DEFAULT_SERVICE_IMAGE, DEFAULT_SERVICE_SCRIPT, RESERVATION_TTL_SECS, SESSION_TTL_SECS,
};
use previewd::{http_server, AppState, Orchestrator};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "previewd")]
#[command(about = "Ephemeral build/run sessions with session-scoped routing")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP orchestrator
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Directory holding per-session workspaces
    #[arg(long, default_value = "/tmp/previewd/workspaces")]
    workspace_root: PathBuf,

    /// Directory finished build artifacts are moved to
    #[arg(long, default_value = "/tmp/previewd/public")]
    public_root: PathBuf,

    /// Sandbox backend
    #[arg(long, value_enum, default_value = "docker")]
    runtime: RuntimeKind,

    /// Image used for builds
    #[arg(long, default_value = DEFAULT_BUILD_IMAGE)]
    build_image: String,

    /// Image used for long-running services
    #[arg(long, default_value = DEFAULT_SERVICE_IMAGE)]
    service_image: String,

    /// Shell script run inside the build sandbox
    #[arg(long, default_value = DEFAULT_BUILD_SCRIPT)]
    build_script: String,

    /// Shell script run inside the service sandbox
    #[arg(long, default_value = DEFAULT_SERVICE_SCRIPT)]
    service_script: String,

    /// First host port handed to run sessions
    #[arg(long, default_value = "9000")]
    port_range_start: u16,

    /// Maximum number of concurrent run sessions
    #[arg(long, default_value = "256")]
    max_sessions: u16,

    /// Session lifetime in seconds
    #[arg(long, default_value_t = SESSION_TTL_SECS)]
    session_ttl_secs: u64,

    /// Lifetime of an unused reservation in seconds
    #[arg(long, default_value_t = RESERVATION_TTL_SECS)]
    reservation_ttl_secs: u64,

    /// Maximum request body size in bytes
    #[arg(long, default_value = "33554432")]
    max_body_bytes: usize,
}

impl ServeArgs {
    fn into_config(self) -> OrchestratorConfig {
        OrchestratorConfig {
            workspace_root: self.workspace_root,
            public_root: self.public_root,
            runtime: self.runtime,
            build_image: self.build_image,
            service_image: self.service_image,
            build_script: self.build_script,
            service_script: self.service_script,
            port_range_start: self.port_range_start,
            max_sessions: self.max_sessions,
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            reservation_ttl: Duration::from_secs(self.reservation_ttl_secs),
            max_body_bytes: self.max_body_bytes,
            ..OrchestratorConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve) => {
            let addr = SocketAddr::new(serve.bind, serve.port);
            let config = serve.into_config();

            std::fs::create_dir_all(&config.workspace_root).with_context(|| {
                format!("creating workspace root {}", config.workspace_root.display())
            })?;
            std::fs::create_dir_all(&config.public_root).with_context(|| {
                format!("creating public root {}", config.public_root.display())
            })?;

            let orchestrator = Arc::new(Orchestrator::new(&config));
            let state = AppState::new(orchestrator, config.max_body_bytes);
            http_server::run_server(addr, state, shutdown_signal())
                .await
                .context("HTTP server failed")?;
            info!("Shutdown complete");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
