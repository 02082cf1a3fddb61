use patternstore::core::error::StoreError;
use patternstore::core::migration_lock::{
    LockOptions, LockRecord, LockState, MigrationLock, hostname, lock_path_for,
};
use patternstore::core::time;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn options(max_wait_ms: u64) -> LockOptions {
    LockOptions {
        stale_after: Duration::from_secs(60),
        max_wait: Duration::from_millis(max_wait_ms),
        poll_interval: Duration::from_millis(10),
        ..LockOptions::default()
    }
}

fn plant(db_path: &Path, record: &LockRecord) {
    fs::write(lock_path_for(db_path), serde_json::to_vec(record).unwrap()).unwrap();
}

#[cfg(unix)]
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("reap child");
    pid
}

#[cfg(unix)]
#[test]
fn lock_left_by_dead_process_is_reclaimed() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("patterns.db");
    plant(
        &db_path,
        &LockRecord {
            pid: dead_pid(),
            timestamp: time::now_millis(),
            hostname: hostname(),
        },
    );

    let lock = MigrationLock::for_database(&db_path, options(500));
    assert!(matches!(lock.state().unwrap(), LockState::Stale(_)));
    let guard = lock.acquire().expect("stale lock should be reclaimed");
    assert_eq!(lock.read_holder().unwrap().unwrap().pid, std::process::id());
    drop(guard);
    assert!(!lock_path_for(&db_path).exists());
}

#[test]
fn fresh_lock_of_live_holder_times_out_with_holder_details() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("patterns.db");
    // pid 1 is always alive; the record is young.
    plant(
        &db_path,
        &LockRecord {
            pid: 1,
            timestamp: time::now_millis(),
            hostname: hostname(),
        },
    );

    let lock = MigrationLock::for_database(&db_path, options(150));
    let started = Instant::now();
    let err = lock.acquire().expect_err("live lock must not be taken");
    assert!(started.elapsed() >= Duration::from_millis(150));
    match err {
        StoreError::LockTimeout {
            holder_pid,
            waited_ms,
            path,
            ..
        } => {
            assert_eq!(holder_pid, 1);
            assert!(waited_ms >= 150);
            assert!(path.ends_with("patterns.migration.lock"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // A foreign lock is never removed by a failed attempt.
    assert!(lock_path_for(&db_path).exists());
}

#[test]
fn old_lock_is_stale_even_if_holder_lives() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("patterns.db");
    plant(
        &db_path,
        &LockRecord {
            pid: 1,
            timestamp: time::now_millis() - 120_000,
            hostname: hostname(),
        },
    );
    let lock = MigrationLock::for_database(&db_path, options(200));
    assert!(lock.try_acquire().unwrap());
    assert!(lock.release().unwrap());
}

#[test]
fn foreign_host_lock_is_judged_by_age_only() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("patterns.db");
    plant(
        &db_path,
        &LockRecord {
            pid: 999_999,
            timestamp: time::now_millis(),
            hostname: format!("{}-elsewhere", hostname()),
        },
    );
    let lock = MigrationLock::for_database(&db_path, options(50));
    assert!(matches!(lock.state().unwrap(), LockState::Held(_)));
    assert!(!lock.try_acquire().unwrap());
    assert!(!lock.release().unwrap(), "must not release another host's lock");
}

#[test]
fn waiter_acquires_after_holder_releases() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("patterns.db");
    let holder = MigrationLock::for_database(&db_path, options(2_000));
    let guard = holder.acquire().expect("first acquire");

    let barrier = Arc::new(Barrier::new(2));
    let waiter_path = db_path.clone();
    let waiter_barrier = Arc::clone(&barrier);
    let waiter = thread::spawn(move || {
        let lock = MigrationLock::for_database(&waiter_path, options(2_000));
        waiter_barrier.wait();
        let started = Instant::now();
        let guard = lock.acquire().expect("waiter should acquire");
        let waited = started.elapsed();
        guard.release().expect("release");
        waited
    });

    barrier.wait();
    thread::sleep(Duration::from_millis(100));
    guard.release().expect("holder release");

    let waited = waiter.join().expect("waiter thread");
    assert!(waited >= Duration::from_millis(50), "waited {:?}", waited);
    assert!(!lock_path_for(&db_path).exists());
}

#[test]
fn contenders_for_a_stale_lock_never_both_win() {
    const CONTENDERS: usize = 8;
    const ROUNDS: usize = 100;

    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("patterns.db");
    let stale = LockRecord {
        pid: 1,
        timestamp: 1,
        hostname: hostname(),
    };

    for round in 0..ROUNDS {
        plant(&db_path, &stale);
        let barrier = Arc::new(Barrier::new(CONTENDERS));
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..CONTENDERS)
            .map(|_| {
                let db_path = db_path.clone();
                let barrier = Arc::clone(&barrier);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    let lock = MigrationLock::for_database(&db_path, options(0));
                    barrier.wait();
                    if lock.try_acquire().expect("try_acquire") {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("contender thread");
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1, "round {round}");
        let lock = MigrationLock::for_database(&db_path, options(0));
        assert_eq!(lock.read_holder().unwrap().unwrap().pid, std::process::id());
        assert!(!lock.steal_marker_path().exists(), "round {round}");
        fs::remove_file(lock.path()).unwrap();
    }
}
