//! Configuration validation for the runlet gateway.
//!
//! Every check runs so the operator sees all problems at once.

use super::AppConfig;
use super::error::{ConfigResult, ConfigurationError};

/// Checks a fully layered [`AppConfig`] before the server starts.
#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Returns `Ok(())` if valid, or a `ConfigurationError` with all issues.
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = config.listen_addr() {
            errors.push(e);
        }
        if let Err(e) = config.body_limit() {
            errors.push(e);
        }
        if let Err(e) = Self::validate_limits(config) {
            errors.push(e);
        }
        if config.store.index.as_os_str().is_empty() {
            errors.push(ConfigurationError::missing_required(
                "Index directory",
                "Persisting procedures, globals and crons",
                "--index or RUNLET_INDEX",
            ));
        }
        if let Err(e) = Self::validate_admin_token(config) {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ConfigurationError::multiple(errors))
        }
    }

    fn validate_limits(config: &AppConfig) -> ConfigResult<()> {
        if config.sandbox.max_exec_time == 0 {
            return Err(ConfigurationError::invalid(
                "max execution time must be greater than zero",
                "Pass --max-exec-time 5 or set RUNLET_MAX_EXEC_TIME=5",
            ));
        }
        if config.server.request_timeout_secs == 0 {
            return Err(ConfigurationError::invalid(
                "request timeout must be greater than zero",
                "Set server.request_timeout_secs in config/runlet or RUNLET__SERVER__REQUEST_TIMEOUT_SECS",
            ));
        }
        Ok(())
    }

    fn validate_admin_token(config: &AppConfig) -> ConfigResult<()> {
        match config.auth.admin_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => Ok(()),
            _ => Err(ConfigurationError::missing_required(
                "Admin token",
                "Authorizing admin routes",
                "--admin-token or RUNLET_ADMIN_TOKEN",
            )),
        }
    }
}
