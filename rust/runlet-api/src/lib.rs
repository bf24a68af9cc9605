//! Runlet API - HTTP gateway for stored procedures.
//!
//! Exposes the [`runlet_core`] store, sandbox and scheduler over HTTP:
//!
//! - [`config`]: layered configuration and validation
//! - [`api`]: route handlers and the JSON response envelope
//! - [`server`]: router assembly, middleware and startup
//! - [`logging`]: subscriber setup and startup logging helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use runlet_api::config::{AppConfig, ConfigValidator};
//! use runlet_api::server::create_app;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     ConfigValidator::validate(&config)?;
//!     let app = create_app(config).await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:6030").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod logging;
pub mod server;

use std::sync::Arc;

use runlet_core::{CapabilityConfig, NetworkCapability, Sandbox, Store};

use config::AppConfig;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Procedure index plus the globals and cron maps.
    pub store: Arc<Store>,
    /// Script engine bound to `store`.
    pub sandbox: Sandbox,
    /// Outbound allow-list parsed once from the configuration.
    pub net: NetworkCapability,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"AppConfig")
            .field("store", &self.store.path())
            .field("net", &self.net)
            .finish()
    }
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<Store>) -> Self {
        let net = config.network();
        Self {
            sandbox: Sandbox::new(Arc::clone(&store)),
            config: Arc::new(config),
            store,
            net,
        }
    }

    /// Capabilities for one invocation started by a request.
    pub fn capabilities(&self, allow_cron: bool) -> CapabilityConfig {
        CapabilityConfig::new(self.net.clone(), self.config.exec_timeout()).with_cron(allow_cron)
    }
}
