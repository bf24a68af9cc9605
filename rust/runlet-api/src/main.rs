//! runlet - Main Entry Point
//!
//! Stores scripted procedures, runs them on demand or on a schedule.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use mimalloc::MiMalloc;

use runlet_api::config::{AppConfig, ConfigValidator};
use runlet_api::logging::init_tracing;
use runlet_api::server::create_app;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments. Each one overrides the layered configuration.
#[derive(Parser, Debug)]
#[command(name = "runlet")]
#[command(about = "runlet - store, run and schedule scripted procedures over HTTP")]
#[command(version)]
struct Args {
    /// Listen address; `:port` binds every interface.
    #[arg(long, env = "RUNLET_HTTP")]
    http: Option<String>,

    /// Comma-separated hosts scripts may fetch from; empty allows all.
    #[arg(long, env = "RUNLET_ALLOWED_HOSTS")]
    allowed_hosts: Option<String>,

    /// Maximum wall-clock seconds per script.
    #[arg(long, env = "RUNLET_MAX_EXEC_TIME")]
    max_exec_time: Option<u64>,

    /// Maximum inbound body size, e.g. 5M.
    #[arg(long, env = "RUNLET_MAX_BODY_SIZE")]
    max_body_size: Option<String>,

    /// Directory holding the persistent index.
    #[arg(long, env = "RUNLET_INDEX")]
    index: Option<PathBuf>,

    /// Bearer token for admin routes; generated when absent.
    #[arg(long, env = "RUNLET_ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// Log level.
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long, env = "RUNLET_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(http) = self.http {
            config.server.http = http;
        }
        if let Some(hosts) = self.allowed_hosts {
            config.sandbox.allowed_hosts = hosts;
        }
        if let Some(secs) = self.max_exec_time {
            config.sandbox.max_exec_time = secs;
        }
        if let Some(size) = self.max_body_size {
            config.server.max_body_size = size;
        }
        if let Some(index) = self.index {
            config.store.index = index;
        }
        if let Some(token) = self.admin_token {
            config.auth.admin_token = Some(token);
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.log_json {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load()?;
    args.apply(&mut config);

    init_tracing(&config.logging);
    tracing::info!("Starting runlet v{}", env!("CARGO_PKG_VERSION"));

    if config.auth.admin_token.is_none() {
        let token = uuid::Uuid::new_v4().simple().to_string();
        runlet_api::log_init_warning!(
            "No admin token configured; generated one for this run: {}",
            token
        );
        config.auth.admin_token = Some(token);
    }

    ConfigValidator::validate(&config)
        .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;
    let addr = config.listen_addr()?;

    let app = create_app(config).await?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
