//! Store domain objects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A named, persisted script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Procedure {
    /// Unique identifier; saving under an existing key overwrites it.
    pub key: String,
    /// Script body.
    pub code: String,
    /// Search tags. Empty entries are dropped on save.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Procedure {
    pub fn new(key: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            code: code.into(),
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Drop empty tag entries.
    pub(crate) fn normalized(mut self) -> Self {
        self.tags.retain(|tag| !tag.is_empty());
        self
    }

    pub(crate) fn into_fields(self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("key".into(), Value::String(self.key));
        fields.insert("code".into(), Value::String(self.code));
        fields.insert(
            "tags".into(),
            Value::Array(self.tags.into_iter().map(Value::String).collect()),
        );
        fields
    }
}

/// Result of a full-text query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    /// Number of matching procedures (ignores paging).
    pub total: u64,
    /// One field map per returned procedure.
    pub hits: Vec<Map<String, Value>>,
    /// Highest relevance score among all matches.
    pub max_score: f64,
    /// Query duration in nanoseconds.
    pub took: u64,
}

/// A named periodic job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronDefinition {
    /// Schedule expression.
    pub interval: String,
    /// Script expression evaluating to a zero-argument callable.
    pub job: String,
}
