//! Schema bootstrap: fresh databases get the complete schema in one step,
//! existing ones are brought forward by the incremental runner.
//!
//! The fast path only ever runs against a database with zero user tables.
//! Versions it marks applied carry the `fresh-schema` sentinel checksum until
//! the next incremental run re-stamps them.

use crate::core::config::StoreConfig;
use crate::core::db::{self, Database, MEMORY_PATH};
use crate::core::error::Result;
use crate::core::fts;
use crate::core::migration::{
    self, Migration, MigrationLoader, MigrationRunner, RunOptions,
};
use crate::core::migration_lock::{LockOptions, MigrationLock, MigrationLockGuard};
use crate::core::schemas::{self, FRESH_SCHEMA_CHECKSUM, MIGRATIONS_TABLE};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapPath {
    Fresh,
    Existing,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub path: BootstrapPath,
    /// Versions created or applied by this call.
    pub applied: Vec<u32>,
    /// FTS indexes whose triggers were missing and got installed.
    pub repaired_indexes: Vec<&'static str>,
}

pub struct AutoMigrator<'a> {
    db: &'a Database,
    lock_options: LockOptions,
    force_on_existing: bool,
    units: Option<Vec<Migration>>,
}

impl<'a> AutoMigrator<'a> {
    pub fn new(db: &'a Database, config: &StoreConfig) -> Self {
        Self {
            db,
            lock_options: config.lock_options(),
            force_on_existing: config.migration.force_on_existing,
            units: None,
        }
    }

    /// Use `units` instead of the built-in registry.
    pub fn with_migrations(mut self, units: Vec<Migration>) -> Self {
        self.units = Some(units);
        self
    }

    fn load(&self) -> Result<Vec<Migration>> {
        match &self.units {
            Some(units) => MigrationLoader::new(units.clone()).load(),
            None => MigrationLoader::from_registry().load(),
        }
    }

    pub fn needs_migration(&self) -> Result<bool> {
        let migrations = self.load()?;
        self.db.with_conn(|conn| {
            if db::user_tables(conn)?.is_empty() || !db::table_exists(conn, MIGRATIONS_TABLE)? {
                return Ok(true);
            }
            let applied = migration::applied_migrations(conn)?;
            Ok(migrations
                .iter()
                .any(|m| !applied.iter().any(|a| a.version == m.version)))
        })
    }

    pub fn auto_migrate(&self) -> Result<BootstrapReport> {
        let migrations = self.load()?;
        let _guard = self.lock()?;

        let fresh = self.db.with_conn(|conn| Ok(db::user_tables(conn)?.is_empty()))?;
        let report = if fresh {
            self.create_fresh(&migrations)?
        } else {
            self.migrate_existing(&migrations)?
        };
        info!(
            path = ?report.path,
            applied = ?report.applied,
            backend = %self.db.backend(),
            "bootstrap complete"
        );
        Ok(report)
    }

    fn lock(&self) -> Result<Option<MigrationLockGuard>> {
        let path = self.db.path();
        if path == Path::new(MEMORY_PATH) {
            return Ok(None);
        }
        let lock = MigrationLock::for_database(path, self.lock_options.clone());
        lock.acquire().map(Some)
    }

    fn create_fresh(&self, migrations: &[Migration]) -> Result<BootstrapReport> {
        let capabilities = self.db.capabilities();
        self.db.transaction(|conn| {
            // Re-check under the write lock; another process may have won.
            if !db::user_tables(conn)?.is_empty() {
                return Ok(None);
            }
            conn.execute_batch(&schemas::full_schema(capabilities))?;
            for unit in migrations {
                migration::record_applied(conn, unit, FRESH_SCHEMA_CHECKSUM, 0)?;
            }
            Ok(Some(migrations.iter().map(|m| m.version).collect::<Vec<_>>()))
        })?
        .map_or_else(
            || {
                debug!("database populated concurrently, switching to incremental path");
                self.migrate_existing(migrations)
            },
            |applied| {
                Ok(BootstrapReport {
                    path: BootstrapPath::Fresh,
                    applied,
                    repaired_indexes: Vec::new(),
                })
            },
        )
    }

    fn migrate_existing(&self, migrations: &[Migration]) -> Result<BootstrapReport> {
        self.db.with_conn(|conn| {
            migration::ensure_tracking_table(conn)?;
            conn.execute_batch(&schemas::patterns_table_v1())?;
            Ok(())
        })?;

        if self.force_on_existing {
            warn!("applying pending migrations without checksum verification");
        }
        let report = MigrationRunner::new(self.db).run(
            migrations,
            &RunOptions {
                force: self.force_on_existing,
                ..RunOptions::default()
            },
        )?;

        let capabilities = self.db.capabilities();
        let repaired = self
            .db
            .with_conn(|conn| fts::ensure_triggers(conn, capabilities))?;

        Ok(BootstrapReport {
            path: BootstrapPath::Existing,
            applied: report.versions,
            repaired_indexes: repaired,
        })
    }
}
