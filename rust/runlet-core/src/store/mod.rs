//! Procedure & State Store.
//!
//! A single SQLite database (FTS5 enabled) living inside the index directory
//! holds the searchable procedures plus two internal records for the globals
//! and cron maps. Both maps are cached in memory behind independent locks and
//! every mutation persists the whole map before the cache is swapped, so the
//! cache and the persisted copy never diverge.

mod error;
mod procedure;
pub mod query;
mod schema;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::scheduler::CronParser;

pub use error::{StoreError, StoreResult};
pub use procedure::{CronDefinition, Procedure, SearchResult};
pub use schema::INDEX_FILE;
use schema::{CRONS_RECORD, GLOBALS_RECORD, SQLITE_SCHEMA};

/// Page size used when the caller passes a non-positive limit.
pub const DEFAULT_PAGE_SIZE: i64 = 10;

/// Snapshot of the globals map. Cheap to clone, never mutated in place.
pub type Globals = Arc<Map<String, Value>>;

/// Cron definitions keyed by cron name.
pub type CronMap = BTreeMap<String, CronDefinition>;

/// Persistent, searchable procedure repository with cached internal state.
pub struct Store {
    path: PathBuf,
    conn: Mutex<Connection>,
    globals: RwLock<Globals>,
    crons: RwLock<CronMap>,
    reload_tx: mpsc::Sender<()>,
    reload_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("globals", &self.globals.read().len())
            .field("crons", &self.crons.read().len())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the index at `path` and load the internal maps.
    ///
    /// Fails if another handle already holds the index or if the database
    /// file is not a readable SQLite index.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)
            .map_err(|err| StoreError::Open(format!("{}: {err}", path.display())))?;

        let db_path = path.join(INDEX_FILE);
        let conn = Connection::open(&db_path).map_err(|err| open_error(&db_path, &err))?;
        Self::lock_exclusive(&conn).map_err(|err| open_error(&db_path, &err))?;
        conn.execute_batch(SQLITE_SCHEMA)
            .map_err(|err| open_error(&db_path, &err))?;

        let integrity: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|err| open_error(&db_path, &err))?;
        if integrity != "ok" {
            return Err(StoreError::Open(format!(
                "{}: integrity check failed: {integrity}",
                db_path.display()
            )));
        }

        let globals: Map<String, Value> = load_record(&conn, GLOBALS_RECORD)?;
        let crons: CronMap = load_record(&conn, CRONS_RECORD)?;
        tracing::info!(
            path = %path.display(),
            globals = globals.len(),
            crons = crons.len(),
            "Procedure index opened"
        );

        let (reload_tx, reload_rx) = mpsc::channel(1);
        Ok(Self {
            path,
            conn: Mutex::new(conn),
            globals: RwLock::new(Arc::new(globals)),
            crons: RwLock::new(crons),
            reload_tx,
            reload_rx: Mutex::new(Some(reload_rx)),
        })
    }

    /// Take the database lock for the lifetime of the connection.
    fn lock_exclusive(conn: &Connection) -> rusqlite::Result<()> {
        conn.busy_timeout(Duration::ZERO)?;
        conn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
        conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")
    }

    /// Directory holding the index.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upsert a procedure by key. Empty tags are dropped.
    pub fn put(&self, procedure: Procedure) -> StoreResult<()> {
        let procedure = procedure.normalized();
        let tags = serde_json::to_string(&procedure.tags)?;
        let tag_text = procedure.tags.join(" ");

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::write)?;
        if let Some(rowid) = rowid_of(&tx, &procedure.key).map_err(StoreError::write)? {
            tx.execute("DELETE FROM procedures_fts WHERE rowid = ?1", [rowid])
                .map_err(StoreError::write)?;
        }
        tx.execute(
            "INSERT INTO procedures (key, code, tags) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET code = excluded.code, tags = excluded.tags",
            params![procedure.key, procedure.code, tags],
        )
        .map_err(StoreError::write)?;
        let rowid = rowid_of(&tx, &procedure.key)
            .map_err(StoreError::write)?
            .ok_or_else(|| StoreError::Write(format!("row for '{}' vanished", procedure.key)))?;
        tx.execute(
            "INSERT INTO procedures_fts (rowid, key, code, tags) VALUES (?1, ?2, ?3, ?4)",
            params![rowid, procedure.key, procedure.code, tag_text],
        )
        .map_err(StoreError::write)?;
        tx.commit().map_err(StoreError::write)?;

        tracing::debug!(key = %procedure.key, tags = procedure.tags.len(), "Procedure saved");
        Ok(())
    }

    /// Remove a procedure. Deleting an absent key is not an error.
    pub fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::write)?;
        if let Some(rowid) = rowid_of(&tx, key).map_err(StoreError::write)? {
            tx.execute("DELETE FROM procedures_fts WHERE rowid = ?1", [rowid])
                .map_err(StoreError::write)?;
            tx.execute("DELETE FROM procedures WHERE rowid = ?1", [rowid])
                .map_err(StoreError::write)?;
        }
        tx.commit().map_err(StoreError::write)?;

        tracing::debug!(key, "Procedure deleted");
        Ok(())
    }

    /// Exact lookup by key.
    pub fn get(&self, key: &str) -> StoreResult<Option<Procedure>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT key, code, tags FROM procedures WHERE key = ?1",
            [key],
            procedure_from_row,
        )
        .optional()
        .map_err(StoreError::read)
    }

    /// Run a query string against the index.
    ///
    /// An empty query matches everything, an empty `sort` orders by
    /// descending score, a negative `offset` is ignored and a non-positive
    /// `limit` falls back to [`DEFAULT_PAGE_SIZE`].
    pub fn find(
        &self,
        query: &str,
        sort: &[String],
        offset: i64,
        limit: i64,
    ) -> StoreResult<SearchResult> {
        let started = Instant::now();
        let query = if query.trim().is_empty() {
            query::MATCH_ALL
        } else {
            query
        };
        let compiled = query::compile(query)?;
        let order = query::order_by(sort)?;
        let limit = if limit <= 0 { DEFAULT_PAGE_SIZE } else { limit };
        let offset = offset.max(0);

        let matched = format!(
            "SELECT p.key AS key, p.code AS code, p.tags AS tags, {} AS score \
             FROM procedures p WHERE {}",
            compiled.score_sql, compiled.where_sql
        );
        let mut bound: Vec<SqlValue> = compiled.score_params;
        bound.extend(compiled.where_params);

        let conn = self.conn.lock();
        let (total, max_score): (i64, Option<f64>) = conn
            .query_row(
                &format!("SELECT COUNT(*), MAX(score) FROM ({matched})"),
                params_from_iter(bound.iter()),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(StoreError::read)?;

        bound.push(SqlValue::Integer(limit));
        bound.push(SqlValue::Integer(offset));
        let mut stmt = conn
            .prepare(&format!("{matched} ORDER BY {order} LIMIT ? OFFSET ?"))
            .map_err(StoreError::read)?;
        let hits = stmt
            .query_map(params_from_iter(bound.iter()), procedure_from_row)
            .map_err(StoreError::read)?
            .map(|row| row.map(Procedure::into_fields))
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::read)?;

        let took = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        tracing::debug!(query, total, hits = hits.len(), took_ns = took, "Procedure search");
        Ok(SearchResult {
            total: u64::try_from(total).unwrap_or_default(),
            hits,
            max_score: max_score.unwrap_or_default(),
            took,
        })
    }

    /// Current globals snapshot.
    pub fn globals_get(&self) -> Globals {
        Arc::clone(&self.globals.read())
    }

    /// Merge `patch` into the globals (last write wins per key) and persist
    /// the resulting map. Returns the new snapshot.
    pub fn globals_set(&self, patch: Map<String, Value>) -> StoreResult<Globals> {
        let mut guard = self.globals.write();
        let mut next = Map::clone(&guard);
        next.extend(patch);
        self.persist(GLOBALS_RECORD, &next)?;
        *guard = Arc::new(next);
        Ok(Arc::clone(&guard))
    }

    /// Remove `keys` from the globals and persist the resulting map.
    pub fn globals_unset<S: AsRef<str>>(&self, keys: &[S]) -> StoreResult<Globals> {
        let mut guard = self.globals.write();
        let mut next = Map::clone(&guard);
        for key in keys {
            next.remove(key.as_ref());
        }
        self.persist(GLOBALS_RECORD, &next)?;
        *guard = Arc::new(next);
        Ok(Arc::clone(&guard))
    }

    /// Copy of the cron map.
    pub fn crons_get(&self) -> CronMap {
        self.crons.read().clone()
    }

    /// Create or replace a cron definition and signal a scheduler reload.
    pub fn crons_set(&self, key: &str, interval: &str, job: &str) -> StoreResult<()> {
        CronParser::parse(interval).map_err(|err| StoreError::InvalidSchedule {
            interval: interval.to_string(),
            reason: format!("{err:#}"),
        })?;

        {
            let mut guard = self.crons.write();
            let mut next = guard.clone();
            next.insert(
                key.to_string(),
                CronDefinition {
                    interval: interval.to_string(),
                    job: job.to_string(),
                },
            );
            self.persist(CRONS_RECORD, &next)?;
            *guard = next;
        }

        tracing::info!(cron_key = key, interval, "Cron saved");
        self.signal_reload();
        Ok(())
    }

    /// Remove a cron definition and signal a scheduler reload.
    pub fn crons_unset(&self, key: &str) -> StoreResult<()> {
        {
            let mut guard = self.crons.write();
            let mut next = guard.clone();
            next.remove(key);
            self.persist(CRONS_RECORD, &next)?;
            *guard = next;
        }

        tracing::info!(cron_key = key, "Cron removed");
        self.signal_reload();
        Ok(())
    }

    /// Hand out the reload receiver. Only the first caller gets it.
    pub fn take_reload_receiver(&self) -> Option<mpsc::Receiver<()>> {
        self.reload_rx.lock().take()
    }

    fn signal_reload(&self) {
        match self.reload_tx.try_send(()) {
            // A pending signal already covers this mutation.
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Closed(())) => {
                tracing::debug!("Cron reload signal dropped: scheduler not running");
            }
        }
    }

    fn persist<T: Serialize>(&self, record: &str, value: &T) -> StoreResult<()> {
        let encoded = serde_json::to_vec(value)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO internals (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![record, encoded],
        )
        .map_err(StoreError::write)?;
        Ok(())
    }
}

fn open_error(path: &Path, err: &rusqlite::Error) -> StoreError {
    StoreError::Open(format!("{}: {err}", path.display()))
}

fn rowid_of(conn: &Connection, key: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT rowid FROM procedures WHERE key = ?1", [key], |row| {
        row.get(0)
    })
    .optional()
}

fn procedure_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Procedure> {
    let tags: String = row.get(2)?;
    Ok(Procedure {
        key: row.get(0)?,
        code: row.get(1)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
    })
}

/// Load an internal record, falling back to the default when it is absent
/// or cannot be decoded.
fn load_record<T: DeserializeOwned + Default>(conn: &Connection, record: &str) -> StoreResult<T> {
    let raw: Option<Vec<u8>> = conn
        .query_row("SELECT value FROM internals WHERE key = ?1", [record], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|err| StoreError::Open(format!("loading {record}: {err}")))?;

    let Some(raw) = raw else {
        return Ok(T::default());
    };
    match serde_json::from_slice(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::warn!(record, error = %err, "Ignoring undecodable internal record");
            Ok(T::default())
        }
    }
}
