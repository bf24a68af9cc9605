//! Errors surfaced by a script execution.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("script is empty")]
    EmptyScript,

    #[error("script error: {0}")]
    Syntax(String),

    #[error("reached the maximum execution time ({budget_secs} sec)")]
    Timeout { budget_secs: u64 },

    #[error("host capability error: {0}")]
    HostCapability(String),

    #[error("script execution aborted: {0}")]
    Panic(String),
}

impl ExecutionError {
    /// Stable machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyScript => "InputError",
            Self::Syntax(_) => "SyntaxError",
            Self::Timeout { .. } => "Timeout",
            Self::HostCapability(_) => "HostCapabilityError",
            Self::Panic(_) => "Panic",
        }
    }

    /// Whether the script never reached a natural end.
    pub fn is_abnormal_termination(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Panic(_))
    }
}

pub type ExecutionResult<T> = std::result::Result<T, ExecutionError>;
