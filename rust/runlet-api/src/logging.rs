//! Structured logging for the runlet gateway.
//!
//! Subscriber setup plus operation timing and helpers for the startup
//! phases.

use std::time::Instant;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when it is set.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Operation timer for measuring and logging execution duration.
///
/// # Examples
///
/// ```rust,ignore
/// use runlet_api::logging::OpTimer;
///
/// let timer = OpTimer::new("store", "open");
/// // ... open the index ...
/// timer.finish();
/// ```
#[derive(Debug)]
pub struct OpTimer {
    /// Component being timed (e.g., "store", "scheduler").
    component: String,
    /// Operation being performed (e.g., "open", "start").
    operation: String,
    start: Instant,
}

impl OpTimer {
    /// Creates a new operation timer and logs the start.
    #[must_use]
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        let component = component.into();
        let operation = operation.into();

        tracing::debug!(
            component = %component,
            operation = %operation,
            "Operation started"
        );

        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    /// Finishes the timer and logs the duration.
    pub fn finish(self) {
        let duration_ms = self.start.elapsed().as_millis();

        tracing::info!(
            component = %self.component,
            operation = %self.operation,
            duration_ms = duration_ms,
            "Operation completed"
        );
    }

    /// Finishes the timer with result-aware logging.
    ///
    /// ```rust,ignore
    /// let timer = OpTimer::new("store", "open");
    /// let result = Store::open(&path);
    /// timer.finish_with_result(result.as_ref());
    /// ```
    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: Result<&T, &E>) {
        let duration_ms = self.start.elapsed().as_millis();

        match result {
            Ok(_) => {
                tracing::info!(
                    component = %self.component,
                    operation = %self.operation,
                    duration_ms = duration_ms,
                    "Operation completed successfully"
                );
            }
            Err(e) => {
                tracing::error!(
                    component = %self.component,
                    operation = %self.operation,
                    duration_ms = duration_ms,
                    error = %e,
                    "Operation failed"
                );
            }
        }
    }
}

/// Log one numbered startup step.
///
/// ```rust,ignore
/// log_init_step!(1, 3, "Store", "/home/me/.runlet");
/// ```
#[macro_export]
macro_rules! log_init_step {
    ($step:expr, $total:expr, $name:expr, $detail:expr) => {
        tracing::info!(
            step = $step,
            total = $total,
            "[{}/{}] {} - {}",
            $step,
            $total,
            $name,
            $detail
        );
    };
    ($step:expr, $total:expr, $name:expr) => {
        tracing::info!(
            step = $step,
            total = $total,
            "[{}/{}] {}",
            $step,
            $total,
            $name
        );
    };
}

/// Macro for logging warnings during initialization.
#[macro_export]
macro_rules! log_init_warning {
    ($msg:expr) => {
        tracing::warn!("⚠️  {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        tracing::warn!("⚠️  {}", format!($msg, $($arg)*));
    };
}

/// Macro for logging successful completion of major phases.
#[macro_export]
macro_rules! log_success {
    ($msg:expr) => {
        tracing::info!("✅ {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        tracing::info!("✅ {}", format!($msg, $($arg)*));
    };
}

/// Macro for logging startup banners.
#[macro_export]
macro_rules! log_banner {
    ($title:expr) => {
        tracing::info!("═══════════════════════════════════════════════════");
        tracing::info!("  {}", $title);
        tracing::info!("═══════════════════════════════════════════════════");
    };
    ($title:expr, $subtitle:expr) => {
        tracing::info!("═══════════════════════════════════════════════════");
        tracing::info!("  {}", $title);
        tracing::info!("  {}", $subtitle);
        tracing::info!("═══════════════════════════════════════════════════");
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_timer_creation() {
        let timer = OpTimer::new("store", "open");
        assert_eq!(timer.component, "store");
        assert_eq!(timer.operation, "open");
    }

    #[test]
    fn test_op_timer_finish_with_result() {
        let ok: Result<i32, String> = Ok(42);
        OpTimer::new("store", "open").finish_with_result(ok.as_ref());

        let err: Result<i32, String> = Err("locked".to_string());
        OpTimer::new("store", "open").finish_with_result(err.as_ref());
    }

    #[test]
    #[serial_test::serial]
    fn test_init_tracing_twice_is_harmless() {
        let config = LoggingConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}
