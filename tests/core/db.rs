use patternstore::core::db::{
    self, AdapterOptions, BackendKind, Database, FAULT_ENV, MEMORY_PATH,
};
use patternstore::core::error::StoreError;
use patternstore::core::pool::ConnectionPool;
use rusqlite::params;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::TempDir;

// Every test opens databases, and the fault variable is process-wide.
fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn with_fault<R>(backends: &str, f: impl FnOnce() -> R) -> R {
    // SAFETY: test-scoped environment mutation is serialized via env_lock.
    unsafe { std::env::set_var(FAULT_ENV, backends) };
    let out = f();
    // SAFETY: test-scoped environment mutation is serialized via env_lock.
    unsafe { std::env::remove_var(FAULT_ENV) };
    out
}

#[test]
fn file_database_prefers_wal() {
    let _guard = env_lock().lock().expect("lock env");
    let tmp = TempDir::new().expect("tempdir");
    let db = Database::create(&tmp.path().join("store.db"), &AdapterOptions::default())
        .expect("open");
    assert_eq!(db.backend(), BackendKind::Wal);
    assert!(db.supports_triggers());
    assert_eq!(db.pragma("journal_mode").unwrap().as_deref(), Some("wal"));
}

#[test]
fn injected_fault_falls_back_to_next_candidate() {
    let _guard = env_lock().lock().expect("lock env");
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("fallback.db");

    let db = with_fault("wal", || Database::create(&path, &AdapterOptions::default()))
        .expect("journal backend should open");
    assert_eq!(db.backend(), BackendKind::Journal);
    assert!(db.capabilities().supports_triggers);

    let db = with_fault("wal,journal", || {
        Database::create(&tmp.path().join("portable.db"), &AdapterOptions::default())
    })
    .expect("portable backend should open");
    assert_eq!(db.backend(), BackendKind::Portable);
    assert!(!db.capabilities().supports_triggers);
    assert!(db.capabilities().supports_savepoints);
}

#[test]
fn every_backend_failing_reports_each_cause() {
    let _guard = env_lock().lock().expect("lock env");
    let tmp = TempDir::new().expect("tempdir");
    let err = with_fault("wal,journal,portable", || {
        Database::create(&tmp.path().join("none.db"), &AdapterOptions::default())
    })
    .expect_err("no backend should open");
    match err {
        StoreError::BackendUnavailable(msg) => {
            assert!(msg.contains("wal"), "{msg}");
            assert!(msg.contains("portable"), "{msg}");
            assert!(msg.contains("BACKEND_FAULT_INJECTED"), "{msg}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn in_memory_database_uses_journal_backend() {
    let _guard = env_lock().lock().expect("lock env");
    let db = Database::open_in_memory(&AdapterOptions::default()).expect("open");
    assert_eq!(db.backend(), BackendKind::Journal);
    assert_eq!(db.path(), Path::new(MEMORY_PATH));
}

#[test]
fn query_helpers_round_trip_rows() {
    let _guard = env_lock().lock().expect("lock env");
    let db = Database::open_in_memory(&AdapterOptions::default()).expect("open");
    db.exec("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT NOT NULL)")
        .expect("create");
    assert_eq!(db.run("INSERT INTO t(v) VALUES (?1)", params!["a"]).unwrap(), 1);
    db.run("INSERT INTO t(v) VALUES (?1)", params!["b"]).unwrap();

    let first: Option<String> = db.get("SELECT v FROM t WHERE id = ?1", params![1]).unwrap();
    assert_eq!(first.as_deref(), Some("a"));
    let missing: Option<String> = db.get("SELECT v FROM t WHERE id = ?1", params![9]).unwrap();
    assert!(missing.is_none());

    let all = db
        .all("SELECT v FROM t ORDER BY id", [], |row| row.get::<_, String>(0))
        .unwrap();
    assert_eq!(all, vec!["a", "b"]);
}

#[test]
fn failed_transaction_leaves_no_rows() {
    let _guard = env_lock().lock().expect("lock env");
    let db = Database::open_in_memory(&AdapterOptions::default()).expect("open");
    db.exec("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT UNIQUE)")
        .expect("create");

    let err = db.transaction(|conn| {
        conn.execute("INSERT INTO t(v) VALUES ('x')", [])?;
        conn.execute("INSERT INTO t(v) VALUES ('x')", [])?;
        Ok(())
    });
    assert!(err.unwrap_err().is_unique_violation());

    let count: Option<i64> = db.get("SELECT COUNT(*) FROM t", []).unwrap();
    assert_eq!(count, Some(0));
}

#[test]
fn savepoint_rollback_keeps_outer_work() {
    let _guard = env_lock().lock().expect("lock env");
    let db = Database::open_in_memory(&AdapterOptions::default()).expect("open");
    db.exec("CREATE TABLE t(v TEXT)").expect("create");

    db.transaction(|conn| {
        conn.execute("INSERT INTO t(v) VALUES ('outer')", [])?;
        let inner = db::with_savepoint(conn, "inner_step", |c| {
            c.execute("INSERT INTO t(v) VALUES ('inner')", [])?;
            Err::<(), _>(StoreError::ValidationError("abort inner".into()))
        });
        assert!(inner.is_err());
        Ok(())
    })
    .expect("outer commit");

    let rows = db
        .all("SELECT v FROM t", [], |row| row.get::<_, String>(0))
        .unwrap();
    assert_eq!(rows, vec!["outer"]);
}

#[test]
fn savepoint_names_are_validated() {
    let _guard = env_lock().lock().expect("lock env");
    let db = Database::open_in_memory(&AdapterOptions::default()).expect("open");
    let err = db.savepoint("bad name; DROP", |_| Ok(())).unwrap_err();
    assert!(matches!(err, StoreError::ValidationError(_)));
}

#[test]
fn closed_handle_rejects_operations() {
    let _guard = env_lock().lock().expect("lock env");
    let db = Database::open_in_memory(&AdapterOptions::default()).expect("open");
    db.close().expect("close");
    assert!(db.is_closed());
    let err = db.exec("SELECT 1").unwrap_err();
    assert!(matches!(err, StoreError::Closed(_)));
}

#[test]
fn pool_reuses_handle_per_path() {
    let _guard = env_lock().lock().expect("lock env");
    let tmp = TempDir::new().expect("tempdir");
    let pool = ConnectionPool::new(AdapterOptions::default());
    let path = tmp.path().join("pooled.db");

    let a = pool.open(&path).expect("open a");
    let b = pool.open(&path).expect("open b");
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(pool.len(), 1);

    let other = pool.open(&tmp.path().join("other.db")).expect("open other");
    assert!(!Arc::ptr_eq(&a, &other));
    assert_eq!(pool.len(), 2);

    assert!(pool.close(&path).expect("close"));
    assert!(a.is_closed());
    let reopened = pool.open(&path).expect("reopen");
    assert!(!Arc::ptr_eq(&a, &reopened));

    pool.close_all().expect("close all");
    assert!(pool.is_empty());
}

#[test]
fn fingerprint_tracks_schema_changes() {
    let _guard = env_lock().lock().expect("lock env");
    let db = Database::open_in_memory(&AdapterOptions::default()).expect("open");
    let empty = db.with_conn(db::schema_fingerprint).unwrap();
    db.exec("CREATE TABLE t(a TEXT)").unwrap();
    let one = db.with_conn(db::schema_fingerprint).unwrap();
    assert_ne!(empty, one);
    assert_eq!(one, db.with_conn(db::schema_fingerprint).unwrap());
    db.exec("ALTER TABLE t ADD COLUMN b INTEGER").unwrap();
    assert_ne!(one, db.with_conn(db::schema_fingerprint).unwrap());
}
