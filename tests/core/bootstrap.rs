use patternstore::core::bootstrap::{AutoMigrator, BootstrapPath};
use patternstore::core::config::StoreConfig;
use patternstore::core::db::{self, AdapterOptions, BackendKind, Database};
use patternstore::core::error::StoreError;
use patternstore::core::migration::{self, MigrationLoader, MigrationRunner, RunOptions};
use patternstore::core::migration_lock::{LockRecord, hostname, lock_path_for};
use patternstore::core::schemas::FRESH_SCHEMA_CHECKSUM;
use patternstore::core::time;
use patternstore::migrations::latest_version;
use patternstore::plugins::patterns::{NewPattern, PatternQuery, PatternRepository, PatternType};
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

fn open(path: &Path) -> Database {
    Database::create(path, &AdapterOptions::default()).expect("open")
}

fn all_versions() -> Vec<u32> {
    (1..=latest_version()).collect()
}

fn checksums(db: &Database) -> Vec<String> {
    db.with_conn(migration::applied_migrations)
        .unwrap()
        .into_iter()
        .map(|a| a.checksum)
        .collect()
}

#[test]
fn empty_database_takes_the_fresh_path() {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp.path().join("patterns.db"));
    let config = StoreConfig::default();
    let migrator = AutoMigrator::new(&db, &config);

    assert!(migrator.needs_migration().unwrap());
    let report = migrator.auto_migrate().unwrap();
    assert_eq!(report.path, BootstrapPath::Fresh);
    assert_eq!(report.applied, all_versions());
    assert!(checksums(&db).iter().all(|c| c == FRESH_SCHEMA_CHECKSUM));
    assert!(!migrator.needs_migration().unwrap());
    assert!(!lock_path_for(db.path()).exists());
}

#[test]
fn fresh_schema_matches_incremental_schema() {
    let tmp = TempDir::new().unwrap();
    let fresh = open(&tmp.path().join("fresh.db"));
    AutoMigrator::new(&fresh, &StoreConfig::default())
        .auto_migrate()
        .unwrap();

    let incremental = open(&tmp.path().join("incremental.db"));
    let units = MigrationLoader::from_registry().load().unwrap();
    MigrationRunner::new(&incremental)
        .run(&units, &RunOptions::default())
        .unwrap();

    assert_eq!(
        fresh.with_conn(db::schema_fingerprint).unwrap(),
        incremental.with_conn(db::schema_fingerprint).unwrap()
    );
}

#[test]
fn second_bootstrap_restamps_sentinel_checksums() {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp.path().join("patterns.db"));
    let config = StoreConfig::default();
    AutoMigrator::new(&db, &config).auto_migrate().unwrap();

    let report = AutoMigrator::new(&db, &config).auto_migrate().unwrap();
    assert_eq!(report.path, BootstrapPath::Existing);
    assert!(report.applied.is_empty());
    assert!(report.repaired_indexes.is_empty());

    let units = MigrationLoader::from_registry().load().unwrap();
    let expected: Vec<String> = units.iter().map(|m| m.checksum()).collect();
    assert_eq!(checksums(&db), expected);
    MigrationRunner::new(&db).verify_integrity(&units).unwrap();
}

#[test]
fn partially_migrated_database_takes_the_incremental_path() {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp.path().join("patterns.db"));
    let units = MigrationLoader::from_registry().load().unwrap();
    MigrationRunner::new(&db)
        .run(
            &units,
            &RunOptions {
                target_version: Some(3),
                ..RunOptions::default()
            },
        )
        .unwrap();

    let migrator = AutoMigrator::new(&db, &StoreConfig::default());
    assert!(migrator.needs_migration().unwrap());
    let report = migrator.auto_migrate().unwrap();
    assert_eq!(report.path, BootstrapPath::Existing);
    assert_eq!(report.applied, (4..=latest_version()).collect::<Vec<_>>());
}

#[test]
fn untracked_legacy_table_is_adopted() {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp.path().join("legacy.db"));
    db.exec("CREATE TABLE notes(id INTEGER PRIMARY KEY)").unwrap();

    let report = AutoMigrator::new(&db, &StoreConfig::default())
        .auto_migrate()
        .unwrap();
    assert_eq!(report.path, BootstrapPath::Existing);
    assert_eq!(report.applied, all_versions());
    assert!(db.with_conn(|c| db::table_exists(c, "notes")).unwrap());
}

#[test]
fn portable_database_gets_triggers_when_reopened_with_trigger_support() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("portable.db");
    {
        let db = Arc::new(
            Database::create(&path, &AdapterOptions::with_backends(vec![BackendKind::Portable]))
                .unwrap(),
        );
        AutoMigrator::new(&db, &StoreConfig::default())
            .auto_migrate()
            .unwrap();
        PatternRepository::new(Arc::clone(&db))
            .insert(NewPattern::new(
                PatternType::Codebase,
                "Retry with backoff",
                "Exponential delay between attempts",
            ))
            .unwrap();
        db.close().unwrap();
    }

    let db = Arc::new(open(&path));
    assert!(db.supports_triggers());
    let report = AutoMigrator::new(&db, &StoreConfig::default())
        .auto_migrate()
        .unwrap();
    assert_eq!(report.path, BootstrapPath::Existing);
    assert_eq!(report.repaired_indexes, vec!["patterns_fts", "tasks_fts"]);

    let triggers: Option<i64> = db
        .get("SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger'", [])
        .unwrap();
    assert_eq!(triggers, Some(6));

    let repo = PatternRepository::new(Arc::clone(&db));
    let hits = repo
        .search(&PatternQuery {
            text: Some("backoff".to_string()),
            ..PatternQuery::default()
        })
        .unwrap();
    assert_eq!(hits.len(), 1);
}

#[test]
fn bootstrap_times_out_behind_a_live_lock() {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp.path().join("patterns.db"));
    std::fs::write(
        lock_path_for(db.path()),
        serde_json::to_vec(&LockRecord {
            pid: 1,
            timestamp: time::now_millis(),
            hostname: hostname(),
        })
        .unwrap(),
    )
    .unwrap();

    let mut config = StoreConfig::default();
    config.lock.max_wait_ms = 100;
    config.lock.poll_interval_ms = 10;
    let err = AutoMigrator::new(&db, &config).auto_migrate().unwrap_err();
    assert!(matches!(err, StoreError::LockTimeout { holder_pid: 1, .. }));
    assert!(db.with_conn(db::user_tables).unwrap().is_empty());
}

#[test]
fn concurrent_bootstraps_create_the_schema_once() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("shared.db");
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let db = open(&path);
                barrier.wait();
                AutoMigrator::new(&db, &StoreConfig::default())
                    .auto_migrate()
                    .map(|r| r.path)
            })
        })
        .collect();

    let mut paths: Vec<BootstrapPath> = handles
        .into_iter()
        .map(|h| h.join().expect("thread").expect("bootstrap"))
        .collect();
    paths.sort_by_key(|p| *p == BootstrapPath::Existing);
    assert_eq!(paths, vec![BootstrapPath::Fresh, BootstrapPath::Existing]);

    let db = open(&path);
    assert_eq!(checksums(&db).len() as u32, latest_version());
}

#[test]
fn in_memory_bootstrap_skips_the_file_lock() {
    let db = Database::open_in_memory(&AdapterOptions::default()).unwrap();
    let report = AutoMigrator::new(&db, &StoreConfig::default())
        .auto_migrate()
        .unwrap();
    assert_eq!(report.path, BootstrapPath::Fresh);
}
