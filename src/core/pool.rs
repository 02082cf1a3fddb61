//! Connection registry: one long-lived [`Database`] per resolved path.
//!
//! Several independent handles to one SQLite file fight over shared locks and
//! surface as spurious `disk I/O error`s, so every repository opened through
//! the same pool reuses the cached handle for its path. The pool is an explicit
//! object handed to callers; there is no process-global instance.

use crate::core::db::{AdapterOptions, Database, MEMORY_PATH};
use crate::core::error::{Result, StoreError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct ConnectionPool {
    options: AdapterOptions,
    entries: Mutex<HashMap<PathBuf, Arc<Database>>>,
}

impl ConnectionPool {
    pub fn new(options: AdapterOptions) -> Self {
        Self {
            options,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &AdapterOptions {
        &self.options
    }

    /// Return the cached handle for `path`, opening it on first use.
    pub fn open(&self, path: &Path) -> Result<Arc<Database>> {
        let key = resolve_path(path)?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::ValidationError("ConnectionPool entries lock poisoned".to_string()))?;
        if let Some(db) = entries.get(&key) {
            if !db.is_closed() {
                return Ok(Arc::clone(db));
            }
        }
        let db = Arc::new(Database::create(&key, &self.options)?);
        debug!(path = %key.display(), backend = %db.backend(), "pool opened database");
        entries.insert(key, Arc::clone(&db));
        Ok(db)
    }

    /// Close and evict the handle for `path`. Returns false if none was cached.
    pub fn close(&self, path: &Path) -> Result<bool> {
        let key = resolve_path(path)?;
        let removed = self
            .entries
            .lock()
            .map_err(|_| StoreError::ValidationError("ConnectionPool entries lock poisoned".to_string()))?
            .remove(&key);
        match removed {
            Some(db) => {
                db.close()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn close_all(&self) -> Result<()> {
        let drained: Vec<Arc<Database>> = self
            .entries
            .lock()
            .map_err(|_| StoreError::ValidationError("ConnectionPool entries lock poisoned".to_string()))?
            .drain()
            .map(|(_, db)| db)
            .collect();
        for db in drained {
            db.close()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(AdapterOptions::default())
    }
}

/// Canonical key for a database path. The file itself may not exist yet, so
/// the parent directory is canonicalized and the file name re-attached.
pub fn resolve_path(path: &Path) -> Result<PathBuf> {
    if path == Path::new(MEMORY_PATH) {
        return Ok(path.to_path_buf());
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| StoreError::ValidationError(format!("not a file path: {}", path.display())))?;
    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(p) => p.to_path_buf(),
        None => std::env::current_dir()?,
    };
    std::fs::create_dir_all(&parent)?;
    Ok(parent.canonicalize()?.join(file_name))
}
