//! Database adapter over the embedded SQLite engine.
//!
//! A [`Database`] owns exactly one connection. Backends are tried in priority
//! order and the first whose probe succeeds wins; the chosen backend is
//! described by [`Capabilities`], and higher layers branch on those flags
//! instead of on the backend itself.
//!
//! | backend    | journal  | FTS sync        |
//! |------------|----------|-----------------|
//! | `wal`      | WAL      | native triggers |
//! | `journal`  | DELETE   | native triggers |
//! | `portable` | untouched| manual          |

use crate::core::error::{Result, StoreError};
use rusqlite::types::{FromSql, Type, Value};
use rusqlite::{Connection, OptionalExtension, Params, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MEMORY_PATH: &str = ":memory:";

/// Env var naming backends whose probe must fail (fault injection for tests).
pub const FAULT_ENV: &str = "PATTERNSTORE_FAULT_BACKEND";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Wal,
    Journal,
    Portable,
}

impl BackendKind {
    pub fn default_order() -> Vec<BackendKind> {
        vec![BackendKind::Wal, BackendKind::Journal, BackendKind::Portable]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Wal => "wal",
            BackendKind::Journal => "journal",
            BackendKind::Portable => "portable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wal" => Some(BackendKind::Wal),
            "journal" | "delete" => Some(BackendKind::Journal),
            "portable" | "fallback" => Some(BackendKind::Portable),
            _ => None,
        }
    }

    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        let mut out = Vec::new();
        for raw in list.split(',').filter(|s| !s.trim().is_empty()) {
            let kind = Self::parse(raw).ok_or_else(|| {
                StoreError::ConfigError(format!("unknown backend '{}'", raw.trim()))
            })?;
            if !out.contains(&kind) {
                out.push(kind);
            }
        }
        if out.is_empty() {
            return Err(StoreError::ConfigError("empty backend list".to_string()));
        }
        Ok(out)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the resolved backend can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Index tables are kept in sync by triggers inside the engine.
    pub supports_triggers: bool,
    pub supports_savepoints: bool,
}

#[derive(Debug, Clone)]
pub struct AdapterOptions {
    pub backends: Vec<BackendKind>,
    pub busy_timeout: Duration,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            backends: BackendKind::default_order(),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl AdapterOptions {
    pub fn with_backends(backends: Vec<BackendKind>) -> Self {
        Self {
            backends,
            ..Self::default()
        }
    }
}

/// Uniform handle to one SQLite database file.
pub struct Database {
    path: PathBuf,
    backend: BackendKind,
    capabilities: Capabilities,
    conn: Mutex<Option<Connection>>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("backend", &self.backend)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl Database {
    /// Open `path`, trying each backend candidate in order.
    pub fn create(path: &Path, options: &AdapterOptions) -> Result<Self> {
        if options.backends.is_empty() {
            return Err(StoreError::ConfigError(
                "at least one backend candidate is required".to_string(),
            ));
        }
        if path != Path::new(MEMORY_PATH) {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut failures = Vec::new();
        for kind in &options.backends {
            match open_backend(*kind, path, options) {
                Ok((conn, capabilities)) => {
                    if !failures.is_empty() {
                        info!(
                            backend = %kind,
                            path = %path.display(),
                            "fell back to backend after {} failed candidate(s)",
                            failures.len()
                        );
                    } else {
                        debug!(backend = %kind, path = %path.display(), "opened database");
                    }
                    return Ok(Self {
                        path: path.to_path_buf(),
                        backend: *kind,
                        capabilities,
                        conn: Mutex::new(Some(conn)),
                    });
                }
                Err(e) => {
                    warn!(backend = %kind, error = %e, "backend initialization failed");
                    failures.push(format!("{}: {}", kind, e));
                }
            }
        }
        Err(StoreError::BackendUnavailable(failures.join("; ")))
    }

    pub fn open_in_memory(options: &AdapterOptions) -> Result<Self> {
        Self::create(Path::new(MEMORY_PATH), options)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn supports_triggers(&self) -> bool {
        self.capabilities.supports_triggers
    }

    pub fn supports_savepoints(&self) -> bool {
        self.capabilities.supports_savepoints
    }

    /// Run a closure against the connection. Calls are serialized; the
    /// closure must not call back into this `Database`.
    pub fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::ValidationError("Database connection lock poisoned".to_string()))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| StoreError::Closed(self.path.display().to_string()))?;
        f(conn)
    }

    pub fn exec(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch(sql)?))
    }

    /// Execute one statement, returning the number of changed rows.
    pub fn run<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.with_conn(|conn| Ok(conn.execute(sql, params)?))
    }

    /// First column of the first row, if any.
    pub fn get<T: FromSql, P: Params>(&self, sql: &str, params: P) -> Result<Option<T>> {
        self.with_conn(|conn| Ok(conn.query_row(sql, params, |row| row.get(0)).optional()?))
    }

    pub fn all<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, map)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
    }

    /// Read a pragma as text (`None` when the pragma yields no row or NULL).
    pub fn pragma(&self, name: &str) -> Result<Option<String>> {
        validate_identifier(name)?;
        self.with_conn(|conn| {
            let value: Option<Value> = conn
                .pragma_query_value(None, name, |row| row.get(0))
                .optional()?;
            Ok(value.and_then(value_to_string))
        })
    }

    /// `BEGIN IMMEDIATE` ... `COMMIT`, rolled back on error.
    pub fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        self.with_conn(|conn| with_transaction(conn, f))
    }

    pub fn savepoint<F, R>(&self, name: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        self.with_conn(|conn| with_savepoint(conn, name, f))
    }

    /// Close the connection. Later calls fail with [`StoreError::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::ValidationError("Database connection lock poisoned".to_string()))?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| StoreError::RusqliteError(e))?;
            debug!(path = %self.path.display(), "closed database");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().map(|g| g.is_none()).unwrap_or(true)
    }
}

fn open_backend(
    kind: BackendKind,
    path: &Path,
    options: &AdapterOptions,
) -> Result<(Connection, Capabilities)> {
    check_fault(kind)?;

    let conn = if path == Path::new(MEMORY_PATH) {
        Connection::open_in_memory()?
    } else {
        Connection::open(path)?
    };
    conn.busy_timeout(options.busy_timeout)?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;

    let capabilities = match kind {
        BackendKind::Wal => {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            if !mode.eq_ignore_ascii_case("wal") {
                return Err(StoreError::BackendUnavailable(format!(
                    "journal_mode=WAL not honoured (got '{}')",
                    mode
                )));
            }
            conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
            probe_fts5(&conn)?;
            Capabilities {
                supports_triggers: true,
                supports_savepoints: true,
            }
        }
        BackendKind::Journal => {
            let _mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "DELETE", |row| row.get(0))?;
            probe_fts5(&conn)?;
            Capabilities {
                supports_triggers: true,
                supports_savepoints: true,
            }
        }
        BackendKind::Portable => Capabilities {
            supports_triggers: false,
            supports_savepoints: true,
        },
    };
    Ok((conn, capabilities))
}

fn probe_fts5(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS temp.__fts_probe USING fts5(x);
         DROP TABLE temp.__fts_probe;",
    )
    .map_err(|e| StoreError::BackendUnavailable(format!("FTS5 unavailable: {}", e)))
}

fn check_fault(kind: BackendKind) -> Result<()> {
    let Ok(list) = env::var(FAULT_ENV) else {
        return Ok(());
    };
    if list
        .split(',')
        .filter_map(BackendKind::parse)
        .any(|k| k == kind)
    {
        return Err(StoreError::BackendUnavailable(format!(
            "BACKEND_FAULT_INJECTED backend={}",
            kind
        )));
    }
    Ok(())
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(r) => Some(r.to_string()),
        Value::Text(t) => Some(t),
        Value::Blob(b) => Some(format!("<blob {} bytes>", b.len())),
    }
}

fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StoreError::ValidationError(format!(
            "invalid SQL identifier '{}'",
            name
        )));
    }
    Ok(())
}

/// Run `f` inside a named savepoint.
///
/// Released on success; on error the savepoint is rolled back and released,
/// leaving any enclosing transaction intact, and the error is returned.
pub fn with_savepoint<F, R>(conn: &Connection, name: &str, f: F) -> Result<R>
where
    F: FnOnce(&Connection) -> Result<R>,
{
    validate_identifier(name)?;
    conn.execute_batch(&format!("SAVEPOINT {};", name))?;
    match f(conn) {
        Ok(v) => {
            conn.execute_batch(&format!("RELEASE {};", name))?;
            Ok(v)
        }
        Err(e) => {
            if let Err(rb) = conn.execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0};", name)) {
                warn!(savepoint = name, error = %rb, "savepoint rollback failed");
            }
            Err(e)
        }
    }
}

/// `BEGIN IMMEDIATE` on a shared connection; rolled back when `f` errors.
pub fn with_transaction<F, R>(conn: &Connection, f: F) -> Result<R>
where
    F: FnOnce(&Connection) -> Result<R>,
{
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Decode a JSON text column. NULL reads as `None`; malformed JSON is a
/// conversion error for that column.
pub fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|text| {
        serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// User tables (excluding SQLite internals), sorted by name.
pub fn user_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Stable hash of the schema: object names, normalized index/trigger SQL and
/// per-table column definitions.
pub fn schema_fingerprint(conn: &Connection) -> Result<String> {
    let mut stmt = conn.prepare(
        "SELECT type, name, tbl_name, COALESCE(sql, '') FROM sqlite_master
         WHERE name NOT LIKE 'sqlite_%' ORDER BY type, name",
    )?;
    let objects = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut hasher = Sha256::new();
    for object in objects {
        let (kind, name, tbl_name, sql) = object?;
        hasher.update(format!("{}|{}|{}\n", kind, name, tbl_name));
        if kind == "table" {
            let mut cols = conn.prepare(
                "SELECT cid, name, type, \"notnull\", COALESCE(dflt_value, ''), pk
                 FROM pragma_table_info(?1) ORDER BY cid",
            )?;
            let rows = cols.query_map([&name], |row| {
                Ok(format!(
                    "  {}:{}:{}:{}:{}:{}\n",
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?
                ))
            })?;
            for r in rows {
                hasher.update(r?);
            }
        } else {
            let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ");
            hasher.update(normalized);
            hasher.update("\n");
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}
