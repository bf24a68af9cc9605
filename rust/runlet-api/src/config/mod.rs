//! Configuration management for the runlet gateway.
//!
//! Settings are layered: built-in defaults, an optional `config/runlet` file,
//! `RUNLET__*` environment variables (after loading `.env`), then the
//! command-line flags applied by the binary.
//!
//! ```rust,ignore
//! use runlet_api::config::{AppConfig, ConfigValidator};
//!
//! let config = AppConfig::load()?;
//! ConfigValidator::validate(&config)?;
//! ```

pub mod error;
pub mod validator;

pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use runlet_core::NetworkCapability;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address; `:port` binds every interface.
    #[serde(default = "default_http")]
    pub http: String,
    /// Inbound body limit with an optional `K`/`M`/`G` suffix.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: String,
    /// Whole-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http: default_http(),
            max_body_size: default_max_body_size(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Script execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Comma-separated `host[:port]` allow-list for `fetch`; empty allows all.
    #[serde(default)]
    pub allowed_hosts: String,
    /// Per-script wall-clock budget in seconds.
    #[serde(default = "default_max_exec_time")]
    pub max_exec_time: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: String::new(),
            max_exec_time: default_max_exec_time(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the persistent index.
    #[serde(default = "default_index_dir")]
    pub index: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            index: default_index_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Bearer token for admin routes. Generated at startup when absent.
    #[serde(default)]
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_http() -> String {
    ":6030".to_string()
}

fn default_max_body_size() -> String {
    "5M".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_exec_time() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `~/.runlet`, or `.runlet` in the working directory when there is no home.
pub fn default_index_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map_or_else(|| PathBuf::from(".runlet"), |dirs| dirs.home_dir().join(".runlet"))
}

impl AppConfig {
    /// Load the file and environment layers. Validation is left to the
    /// caller so command-line overrides can be applied first.
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .set_default("server.http", default_http())?
            .set_default("server.max_body_size", default_max_body_size())?
            .set_default("sandbox.max_exec_time", default_max_exec_time())?
            .set_default("logging.level", default_log_level())?
            .add_source(config::File::with_name("config/runlet").required(false))
            .add_source(
                config::Environment::with_prefix("RUNLET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Socket address to bind.
    pub fn listen_addr(&self) -> ConfigResult<SocketAddr> {
        parse_listen_addr(&self.server.http)
    }

    /// Body limit in bytes.
    pub fn body_limit(&self) -> ConfigResult<usize> {
        parse_body_size(&self.server.max_body_size).ok_or_else(|| {
            ConfigurationError::invalid(
                format!("max body size '{}' is not a size", self.server.max_body_size),
                "Use a positive byte count with an optional K, M or G suffix, e.g. 5M",
            )
        })
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox.max_exec_time)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Outbound policy handed to every invocation.
    pub fn network(&self) -> NetworkCapability {
        NetworkCapability::parse(&self.sandbox.allowed_hosts)
    }
}

/// Parse `:port`, `host:port` or `ip:port`.
pub fn parse_listen_addr(raw: &str) -> ConfigResult<SocketAddr> {
    let raw = raw.trim();
    let normalized = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };

    normalized
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| {
            ConfigurationError::invalid(
                format!("listen address '{raw}' cannot be resolved"),
                "Use ':6030', '127.0.0.1:6030' or 'localhost:6030'",
            )
        })
}

/// Parse a byte size such as `512`, `64K`, `5M`, `1GB`. Zero is rejected.
pub fn parse_body_size(raw: &str) -> Option<usize> {
    let raw = raw.trim().to_ascii_uppercase();
    let raw = raw.strip_suffix('B').unwrap_or(&raw);
    let (digits, multiplier) = match raw.chars().last()? {
        'K' => (&raw[..raw.len() - 1], 1024),
        'M' => (&raw[..raw.len() - 1], 1024 * 1024),
        'G' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => (raw, 1),
    };
    let value: usize = digits.trim().parse().ok()?;
    value.checked_mul(multiplier).filter(|size| *size > 0)
}
