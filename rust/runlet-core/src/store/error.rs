//! Errors for the procedure and state store.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open index: {0}")]
    Open(String),

    #[error("index write failed: {0}")]
    Write(String),

    #[error("index read failed: {0}")]
    Read(String),

    #[error("query syntax error: {0}")]
    QuerySyntax(String),

    #[error("invalid schedule '{interval}': {reason}")]
    InvalidSchedule { interval: String, reason: String },

    #[error("internal record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// Stable machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Open(_) | Self::Write(_) | Self::Read(_) | Self::Encode(_) => "StoreError",
            Self::QuerySyntax(_) => "QuerySyntaxError",
            Self::InvalidSchedule { .. } => "InvalidSchedule",
        }
    }

    /// Whether the caller supplied bad input (as opposed to a storage failure).
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::QuerySyntax(_) | Self::InvalidSchedule { .. })
    }

    pub(crate) fn write(err: rusqlite::Error) -> Self {
        Self::Write(err.to_string())
    }

    pub(crate) fn read(err: rusqlite::Error) -> Self {
        Self::Read(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
