//! SQLite schema for the procedure index.

/// Name of the database file inside the index directory.
pub const INDEX_FILE: &str = "index.db";

/// Internal record holding the JSON-encoded globals map.
pub const GLOBALS_RECORD: &str = "internal/globals";

/// Internal record holding the JSON-encoded cron map.
pub const CRONS_RECORD: &str = "internal/crons";

/// Schema applied on every open; all statements are idempotent.
pub const SQLITE_SCHEMA: &str = r"
-- Procedures (source of truth)
CREATE TABLE IF NOT EXISTS procedures (
    key TEXT PRIMARY KEY,
    code TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]' -- JSON array
);

-- Full-text index over procedures, kept in sync by rowid
CREATE VIRTUAL TABLE IF NOT EXISTS procedures_fts USING fts5(
    key,
    code,
    tags,
    tokenize = 'unicode61'
);

-- Non-searchable internal records (globals, crons)
CREATE TABLE IF NOT EXISTS internals (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
";
