//! Configuration error types with actionable user messages.

use std::fmt;

/// Configuration errors with detailed, actionable messages.
#[derive(Debug, Clone)]
pub enum ConfigurationError {
    /// Invalid configuration value.
    Invalid {
        /// What is wrong.
        message: String,
        /// How to fix it.
        fix_hint: String,
    },
    /// A required configuration is missing.
    MissingRequired {
        /// The missing setting name.
        setting: String,
        /// What needs this setting.
        context: String,
        /// Flag or environment variable to set.
        env_var: String,
    },
    /// Multiple errors occurred.
    Multiple(Vec<ConfigurationError>),
}

impl std::error::Error for ConfigurationError {}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { message, fix_hint } => {
                write!(
                    f,
                    "Invalid configuration: {message}\n\nHow to fix: {fix_hint}"
                )
            }
            Self::MissingRequired {
                setting,
                context,
                env_var,
            } => {
                write!(
                    f,
                    "Missing required configuration: {setting}\n\n\
                    Required for: {context}\n\
                    Set via: {env_var}"
                )
            }
            Self::Multiple(errors) => {
                writeln!(f, "Multiple configuration errors:")?;
                for (i, err) in errors.iter().enumerate() {
                    writeln!(f, "\n{}. {}", i + 1, err)?;
                }
                Ok(())
            }
        }
    }
}

impl ConfigurationError {
    #[must_use]
    pub fn invalid(message: impl Into<String>, fix_hint: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
            fix_hint: fix_hint.into(),
        }
    }

    #[must_use]
    pub fn missing_required(
        setting: impl Into<String>,
        context: impl Into<String>,
        env_var: impl Into<String>,
    ) -> Self {
        Self::MissingRequired {
            setting: setting.into(),
            context: context.into(),
            env_var: env_var.into(),
        }
    }

    #[must_use]
    pub fn multiple(errors: Vec<ConfigurationError>) -> Self {
        Self::Multiple(errors)
    }

    /// Get the number of errors (1 for single errors, N for multiple).
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Multiple(errors) => errors.len(),
            _ => 1,
        }
    }
}

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigurationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_error_display() {
        let err = ConfigurationError::invalid(
            "max_exec_time must be greater than zero",
            "Pass --max-exec-time 5 or set RUNLET_MAX_EXEC_TIME",
        );
        let msg = err.to_string();
        assert!(msg.contains("Invalid configuration"));
        assert!(msg.contains("max_exec_time"));
        assert!(msg.contains("How to fix"));
    }

    #[test]
    fn test_missing_required_error_display() {
        let err = ConfigurationError::missing_required(
            "Admin token",
            "Authorizing admin routes",
            "--admin-token or RUNLET_ADMIN_TOKEN",
        );
        let msg = err.to_string();
        assert!(msg.contains("Missing required"));
        assert!(msg.contains("Admin token"));
        assert!(msg.contains("RUNLET_ADMIN_TOKEN"));
    }

    #[test]
    fn test_multiple_errors_display() {
        let err = ConfigurationError::multiple(vec![
            ConfigurationError::invalid("Error 1", "Fix 1"),
            ConfigurationError::invalid("Error 2", "Fix 2"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("Multiple configuration errors"));
        assert!(msg.contains("1."));
        assert!(msg.contains("2."));
        assert_eq!(err.count(), 2);
    }
}
