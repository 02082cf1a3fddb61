//! Versioned schema migrations.
//!
//! Units live in a compile-time registry (`crate::migrations::registry`).
//! [`MigrationLoader`] validates the set before anything runs: ids follow
//! `NNN-kebab-name`, the id prefix and the unit's file name both carry the
//! declared version, and versions are contiguous from 1. [`MigrationRunner`]
//! applies each pending unit in its own savepoint and records it in the
//! `migrations` tracking table; a failing unit is rolled back alone while the
//! units applied before it stay committed.

use crate::core::db::{self, Capabilities, Database};
use crate::core::error::{Result, StoreError};
use crate::core::schemas::{FRESH_SCHEMA_CHECKSUM, MIGRATIONS_TABLE_SCHEMA};
use crate::core::time;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Connection handed to `up` / `down` / `validate`, carrying the backend's
/// capabilities so units can skip trigger creation where unsupported.
pub struct MigrationDb<'a> {
    conn: &'a Connection,
    capabilities: Capabilities,
}

impl<'a> MigrationDb<'a> {
    pub fn new(conn: &'a Connection, capabilities: Capabilities) -> Self {
        Self { conn, capabilities }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn supports_triggers(&self) -> bool {
        self.capabilities.supports_triggers
    }

    pub fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        db::column_exists(self.conn, table, column)
    }
}

impl Deref for MigrationDb<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

pub type MigrationFn = fn(&MigrationDb<'_>) -> Result<()>;
pub type ValidateFn = fn(&MigrationDb<'_>) -> Result<bool>;

/// One schema evolution step.
#[derive(Clone)]
pub struct Migration {
    pub id: &'static str,
    pub version: u32,
    pub name: &'static str,
    pub up: MigrationFn,
    pub down: MigrationFn,
    pub validate: Option<ValidateFn>,
    /// Explicit checksum. When absent the loader hashes `source` and `schema`.
    pub checksum: Option<String>,
    /// Source text of the unit, embedded with `include_str!`.
    pub source: &'static str,
    /// Shared schema text the unit executes but does not spell out itself.
    pub schema: Vec<String>,
    /// Defining file, as reported by `file!()`.
    pub file: &'static str,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("name", &self.name)
            .field("checksum", &self.checksum)
            .finish()
    }
}

impl Migration {
    pub fn checksum(&self) -> String {
        match &self.checksum {
            Some(c) => c.clone(),
            None => unit_checksum(self.source, &self.schema),
        }
    }
}

/// sha256 over the unit source followed by each schema part, NUL separated.
pub fn unit_checksum(source: &str, schema: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    for part in schema {
        hasher.update([0u8]);
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{3})-([a-z0-9]+(?:-[a-z0-9]+)*)$").expect("static regex")
    })
}

fn file_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^v(\d{3})_([a-z0-9]+(?:_[a-z0-9]+)*)\.rs$").expect("static regex")
    })
}

/// Validates a set of units and fills in checksums.
pub struct MigrationLoader {
    units: Vec<Migration>,
}

impl MigrationLoader {
    pub fn new(units: Vec<Migration>) -> Self {
        Self { units }
    }

    pub fn from_registry() -> Self {
        Self::new(crate::migrations::registry())
    }

    pub fn load(self) -> Result<Vec<Migration>> {
        let mut by_version: BTreeMap<u32, Migration> = BTreeMap::new();
        for mut unit in self.units {
            validate_shape(&unit)?;
            if let Some(prev) = by_version.get(&unit.version) {
                return Err(StoreError::MigrationLoadError(format!(
                    "duplicate migration version {}: '{}' and '{}'",
                    unit.version, prev.id, unit.id
                )));
            }
            if unit.checksum.is_none() {
                unit.checksum = Some(unit_checksum(unit.source, &unit.schema));
            }
            by_version.insert(unit.version, unit);
        }

        for (expected, version) in (1u32..).zip(by_version.keys()) {
            if *version != expected {
                return Err(StoreError::MigrationLoadError(format!(
                    "migration versions must be contiguous from 1: expected {}, found {}",
                    expected, version
                )));
            }
        }

        let loaded: Vec<Migration> = by_version.into_values().collect();
        debug!(count = loaded.len(), "loaded migrations");
        Ok(loaded)
    }
}

fn validate_shape(unit: &Migration) -> Result<()> {
    let caps = id_regex().captures(unit.id).ok_or_else(|| {
        StoreError::MigrationLoadError(format!(
            "migration id '{}' does not match NNN-kebab-name",
            unit.id
        ))
    })?;
    let id_version: u32 = caps[1]
        .parse()
        .map_err(|_| StoreError::MigrationLoadError(format!("bad version in id '{}'", unit.id)))?;
    if id_version != unit.version {
        return Err(StoreError::MigrationLoadError(format!(
            "migration '{}' declares version {} but its id says {}",
            unit.id, unit.version, id_version
        )));
    }
    if unit.version == 0 {
        return Err(StoreError::MigrationLoadError(format!(
            "migration '{}' has version 0; versions start at 1",
            unit.id
        )));
    }
    if unit.name.trim().is_empty() {
        return Err(StoreError::MigrationLoadError(format!(
            "migration '{}' has an empty name",
            unit.id
        )));
    }

    let file_name = Path::new(unit.file)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or_default();
    let file_caps = file_regex().captures(file_name).ok_or_else(|| {
        StoreError::MigrationLoadError(format!(
            "migration '{}' is defined in '{}', expected vNNN_snake_name.rs",
            unit.id, unit.file
        ))
    })?;
    if file_caps[1] != caps[1] || file_caps[2].replace('_', "-") != caps[2] {
        return Err(StoreError::MigrationLoadError(format!(
            "migration '{}' is defined in '{}'; file name and id disagree",
            unit.id, file_name
        )));
    }
    Ok(())
}

/// A row of the tracking table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedMigration {
    pub version: u32,
    pub id: String,
    pub name: String,
    pub checksum: String,
    pub applied_at: String,
    pub execution_time_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<u32>,
    pub total: usize,
}

impl MigrationStatus {
    pub fn current_version(&self) -> u32 {
        self.applied.iter().map(|a| a.version).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Apply up to and including this version. `None` means all.
    pub target_version: Option<u32>,
    /// Skip checksum verification of already-applied units.
    pub force: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Versions applied (or rolled back), in execution order.
    pub versions: Vec<u32>,
    /// Versions that would have run, for dry runs.
    pub planned: Vec<u32>,
    /// Fresh-bootstrap rows re-stamped with their real checksum.
    pub restamped: Vec<u32>,
    pub dry_run: bool,
}

pub struct MigrationRunner<'a> {
    db: &'a Database,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn status(&self, migrations: &[Migration]) -> Result<MigrationStatus> {
        self.db.with_conn(|conn| {
            ensure_tracking_table(conn)?;
            let applied = applied_migrations(conn)?;
            let pending = pending_versions(migrations, &applied, None);
            Ok(MigrationStatus {
                applied,
                pending,
                total: migrations.len(),
            })
        })
    }

    /// Fail with [`StoreError::IntegrityError`] if an applied unit changed.
    pub fn verify_integrity(&self, migrations: &[Migration]) -> Result<()> {
        self.db.with_conn(|conn| {
            ensure_tracking_table(conn)?;
            verify_integrity(conn, migrations)
        })
    }

    pub fn run(&self, migrations: &[Migration], options: &RunOptions) -> Result<RunReport> {
        let capabilities = self.db.capabilities();
        self.db.with_conn(|conn| {
            ensure_tracking_table(conn)?;
            if options.force {
                warn!("running migrations with integrity checking disabled");
            } else {
                verify_integrity(conn, migrations)?;
            }

            let applied = applied_migrations(conn)?;
            let pending = pending_versions(migrations, &applied, options.target_version);
            let mut report = RunReport {
                dry_run: options.dry_run,
                ..RunReport::default()
            };

            if options.dry_run {
                report.planned = pending;
                info!(pending = ?report.planned, "dry run, no migrations applied");
                return Ok(report);
            }

            report.restamped = restamp_fresh_rows(conn, migrations, &applied)?;

            for version in pending {
                let Some(unit) = migrations.iter().find(|m| m.version == version) else {
                    continue;
                };
                apply_one(conn, capabilities, unit)?;
                report.versions.push(version);
            }
            Ok(report)
        })
    }

    /// Roll back every applied unit above `target_version`, newest first.
    pub fn rollback(&self, migrations: &[Migration], target_version: u32) -> Result<RunReport> {
        let capabilities = self.db.capabilities();
        self.db.with_conn(|conn| {
            ensure_tracking_table(conn)?;
            let mut versions: Vec<u32> = applied_migrations(conn)?
                .into_iter()
                .map(|a| a.version)
                .filter(|v| *v > target_version)
                .collect();
            versions.sort_unstable_by(|a, b| b.cmp(a));

            let mut report = RunReport::default();
            for version in versions {
                let unit = migrations.iter().find(|m| m.version == version).ok_or_else(|| {
                    StoreError::NotFound(format!(
                        "applied migration version {} has no loaded definition to roll back",
                        version
                    ))
                })?;
                revert_one(conn, capabilities, unit)?;
                report.versions.push(version);
            }
            Ok(report)
        })
    }
}

pub fn ensure_tracking_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATIONS_TABLE_SCHEMA)?;
    Ok(())
}

pub fn applied_migrations(conn: &Connection) -> Result<Vec<AppliedMigration>> {
    let mut stmt = conn.prepare(
        "SELECT version, id, name, checksum, applied_at, execution_time_ms
         FROM migrations ORDER BY version",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(AppliedMigration {
            version: row.get::<_, i64>(0)? as u32,
            id: row.get(1)?,
            name: row.get(2)?,
            checksum: row.get(3)?,
            applied_at: row.get(4)?,
            execution_time_ms: row.get(5)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn record_applied(
    conn: &Connection,
    unit: &Migration,
    checksum: &str,
    execution_time_ms: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO migrations(version, id, name, checksum, applied_at, execution_time_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            unit.version as i64,
            unit.id,
            unit.name,
            checksum,
            time::now_epoch_z(),
            execution_time_ms
        ],
    )?;
    Ok(())
}

fn pending_versions(
    migrations: &[Migration],
    applied: &[AppliedMigration],
    target: Option<u32>,
) -> Vec<u32> {
    let mut pending: Vec<u32> = migrations
        .iter()
        .map(|m| m.version)
        .filter(|v| !applied.iter().any(|a| a.version == *v))
        .filter(|v| target.is_none_or(|t| *v <= t))
        .collect();
    pending.sort_unstable();
    pending
}

fn verify_integrity(conn: &Connection, migrations: &[Migration]) -> Result<()> {
    for row in applied_migrations(conn)? {
        if row.checksum == FRESH_SCHEMA_CHECKSUM {
            continue;
        }
        let Some(unit) = migrations.iter().find(|m| m.version == row.version) else {
            warn!(
                version = row.version,
                id = %row.id,
                "applied migration is unknown to this build"
            );
            continue;
        };
        let actual = unit.checksum();
        if actual != row.checksum {
            return Err(StoreError::IntegrityError {
                version: row.version,
                id: row.id,
                expected: row.checksum,
                actual,
            });
        }
    }
    Ok(())
}

fn restamp_fresh_rows(
    conn: &Connection,
    migrations: &[Migration],
    applied: &[AppliedMigration],
) -> Result<Vec<u32>> {
    let mut restamped = Vec::new();
    for row in applied.iter().filter(|a| a.checksum == FRESH_SCHEMA_CHECKSUM) {
        if let Some(unit) = migrations.iter().find(|m| m.version == row.version) {
            conn.execute(
                "UPDATE migrations SET checksum = ?1 WHERE version = ?2 AND checksum = ?3",
                params![unit.checksum(), row.version as i64, FRESH_SCHEMA_CHECKSUM],
            )?;
            restamped.push(row.version);
        }
    }
    if !restamped.is_empty() {
        debug!(versions = ?restamped, "re-stamped fresh-schema checksums");
    }
    Ok(restamped)
}

/// Run `f` atomically: a named savepoint when supported, else its own
/// `BEGIN IMMEDIATE` transaction.
fn atomically<F>(conn: &Connection, capabilities: Capabilities, name: &str, f: F) -> Result<()>
where
    F: FnOnce(&Connection) -> Result<()>,
{
    if capabilities.supports_savepoints {
        db::with_savepoint(conn, name, f)
    } else {
        db::with_transaction(conn, f)
    }
}

fn apply_one(conn: &Connection, capabilities: Capabilities, unit: &Migration) -> Result<()> {
    let started = Instant::now();
    let savepoint = format!("migration_v{}", unit.version);
    let result = atomically(conn, capabilities, &savepoint, |conn| {
        let mdb = MigrationDb::new(conn, capabilities);
        (unit.up)(&mdb)?;
        if let Some(validate) = unit.validate {
            if !validate(&mdb)? {
                return Err(StoreError::ValidationError(format!(
                    "post-migration validation of {} failed",
                    unit.id
                )));
            }
        }
        let elapsed = started.elapsed().as_millis() as i64;
        record_applied(conn, unit, &unit.checksum(), elapsed)
    });
    match result {
        Ok(()) => {
            info!(
                version = unit.version,
                id = unit.id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "applied migration"
            );
            Ok(())
        }
        Err(e) => Err(StoreError::MigrationFailure {
            version: unit.version,
            id: unit.id.to_string(),
            source: Box::new(e),
        }),
    }
}

fn revert_one(conn: &Connection, capabilities: Capabilities, unit: &Migration) -> Result<()> {
    let started = Instant::now();
    let savepoint = format!("rollback_v{}", unit.version);
    let result = atomically(conn, capabilities, &savepoint, |conn| {
        let mdb = MigrationDb::new(conn, capabilities);
        (unit.down)(&mdb)?;
        conn.execute(
            "DELETE FROM migrations WHERE version = ?1",
            [unit.version as i64],
        )?;
        Ok(())
    });
    match result {
        Ok(()) => {
            info!(
                version = unit.version,
                id = unit.id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "rolled back migration"
            );
            Ok(())
        }
        Err(e) => Err(StoreError::MigrationFailure {
            version: unit.version,
            id: unit.id.to_string(),
            source: Box::new(e),
        }),
    }
}

/// Checksum recorded for `version`, if applied.
pub fn recorded_checksum(conn: &Connection, version: u32) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT checksum FROM migrations WHERE version = ?1",
            [version as i64],
            |row| row.get(0),
        )
        .optional()?)
}
