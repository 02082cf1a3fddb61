use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config parse error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("No database backend could be initialized: {0}")]
    BackendUnavailable(String),
    #[error("Database handle is closed: {0}")]
    Closed(String),
    #[error("Migration load error: {0}")]
    MigrationLoadError(String),
    #[error(
        "Checksum mismatch for applied migration {id} (version {version}): recorded {expected}, current {actual}. \
         Applied migrations must not be edited; restore the original definition or re-run with --force"
    )]
    IntegrityError {
        version: u32,
        id: String,
        expected: String,
        actual: String,
    },
    #[error(
        "Timed out after {waited_ms}ms waiting for migration lock {path} (held by pid {holder_pid}, age {age_ms}ms)"
    )]
    LockTimeout {
        path: String,
        holder_pid: u32,
        age_ms: u64,
        waited_ms: u64,
    },
    #[error("Migration {id} (version {version}) failed: {source}")]
    MigrationFailure {
        version: u32,
        id: String,
        #[source]
        source: Box<StoreError>,
    },
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// True for SQLite UNIQUE / PRIMARY KEY constraint violations.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::RusqliteError(rusqlite::Error::SqliteFailure(code, _)) => {
                code.code == rusqlite::ErrorCode::ConstraintViolation
                    && matches!(
                        code.extended_code,
                        rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                            | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    )
            }
            _ => false,
        }
    }

    /// True for `SQLITE_BUSY` / `SQLITE_LOCKED`.
    pub fn is_busy(&self) -> bool {
        match self {
            StoreError::RusqliteError(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
