//! File-based cross-process mutex guarding schema migration.
//!
//! The lock is a sidecar file next to the database,
//! `<db-without-extension>.migration.lock`, holding a JSON [`LockRecord`]:
//!
//! ```text
//! {"pid":12345,"timestamp":1771220592000,"hostname":"build-7"}
//! ```
//!
//! The record is written to a private temp file first and then hard-linked
//! into place, so the lock file either does not exist or is complete; a second
//! process racing the link gets `AlreadyExists` instead of overwriting.
//!
//! A lock is stale when it is older than `stale_after`, or when its owner ran
//! on this host and is no longer alive. Stale and corrupt locks are removed
//! and acquisition is retried. Removal happens under a second marker file,
//! `<lock>.steal`, created with `O_EXCL`: the contender holding the marker
//! re-reads the lock and deletes it only if it still holds the record that
//! was judged stale, so a fresh lock written by another contender in the
//! meantime is never deleted.
//!
//! Release on exit is best-effort: [`MigrationLockGuard`] releases on drop
//! (normal return and panic unwinding). With
//! [`LockOptions::release_on_signal`] a SIGINT/SIGTERM handler also removes
//! locks still held by this process. `kill -9` leaves the file behind for the
//! staleness check to reclaim.

use crate::core::error::{Result, StoreError};
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ACQUIRE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
    pub hostname: String,
}

impl LockRecord {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            timestamp: time::now_millis(),
            hostname: hostname(),
        }
    }

    pub fn age_ms(&self) -> u64 {
        time::now_millis().saturating_sub(self.timestamp)
    }
}

#[derive(Debug, Clone)]
pub struct LockOptions {
    pub stale_after: Duration,
    pub max_wait: Duration,
    pub poll_interval: Duration,
    /// Install a process-wide SIGINT/SIGTERM handler on the first
    /// [`MigrationLock::acquire`]. The handler removes held locks and exits
    /// with status 130, so only the program that owns the process should
    /// turn this on.
    pub release_on_signal: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60),
            max_wait: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            release_on_signal: false,
        }
    }
}

/// State of an existing lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held(LockRecord),
    Stale(LockRecord),
    Corrupt,
}

#[derive(Debug, Clone)]
pub struct MigrationLock {
    path: PathBuf,
    options: LockOptions,
}

impl MigrationLock {
    pub fn for_database(db_path: &Path, options: LockOptions) -> Self {
        Self {
            path: lock_path_for(db_path),
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Single non-blocking attempt. Stale or corrupt locks are cleared first.
    pub fn try_acquire(&self) -> Result<bool> {
        for _ in 0..ACQUIRE_ATTEMPTS {
            if self.claim()? {
                return Ok(true);
            }
            match self.state()? {
                LockState::Free => continue,
                LockState::Held(_) => return Ok(false),
                LockState::Stale(record) => {
                    info!(
                        path = %self.path.display(),
                        holder_pid = record.pid,
                        age_ms = record.age_ms(),
                        "removing stale migration lock"
                    );
                    if self.steal_if_unchanged(Some(&record))? && self.claim()? {
                        return Ok(true);
                    }
                }
                LockState::Corrupt => {
                    warn!(path = %self.path.display(), "removing corrupt migration lock");
                    if self.steal_if_unchanged(None)? && self.claim()? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn claim(&self) -> Result<bool> {
        if self.create_exclusive()? {
            register_held(&self.path);
            debug!(path = %self.path.display(), "migration lock acquired");
            return Ok(true);
        }
        Ok(false)
    }

    /// Poll every `poll_interval` until the lock is acquired or `max_wait`
    /// elapses. Returns false on timeout.
    pub fn wait_for_lock(&self, max_wait: Duration) -> Result<bool> {
        let started = Instant::now();
        loop {
            if self.try_acquire()? {
                return Ok(true);
            }
            let elapsed = started.elapsed();
            if elapsed >= max_wait {
                return Ok(false);
            }
            thread::sleep(self.options.poll_interval.min(max_wait - elapsed));
        }
    }

    /// Wait up to the configured budget; on timeout report the holder.
    ///
    /// Installs the exit-on-signal handler only when
    /// `options.release_on_signal` is set.
    pub fn acquire(&self) -> Result<MigrationLockGuard> {
        if self.options.release_on_signal {
            install_signal_handler();
        }
        let started = Instant::now();
        if self.wait_for_lock(self.options.max_wait)? {
            return Ok(MigrationLockGuard {
                lock: self.clone(),
                released: false,
            });
        }
        let holder = self.read_holder().ok().flatten();
        Err(StoreError::LockTimeout {
            path: self.path.display().to_string(),
            holder_pid: holder.as_ref().map(|h| h.pid).unwrap_or(0),
            age_ms: holder.as_ref().map(|h| h.age_ms()).unwrap_or(0),
            waited_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Remove the lock file only if this process owns it.
    pub fn release(&self) -> Result<bool> {
        let record = match self.read_holder() {
            Ok(Some(record)) => record,
            Ok(None) => {
                unregister_held(&self.path);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if record.pid != std::process::id() || record.hostname != hostname() {
            warn!(
                path = %self.path.display(),
                holder_pid = record.pid,
                "refusing to release migration lock owned by another process"
            );
            return Ok(false);
        }
        remove_file_if_exists(&self.path)?;
        unregister_held(&self.path);
        debug!(path = %self.path.display(), "migration lock released");
        Ok(true)
    }

    pub fn is_held(&self) -> Result<bool> {
        Ok(matches!(self.state()?, LockState::Held(_)))
    }

    /// Parse the lock file. `Ok(None)` when absent; corrupt content is an error.
    pub fn read_holder(&self) -> Result<Option<LockRecord>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => {
                let record: LockRecord = serde_json::from_str(&content).map_err(|e| {
                    StoreError::ValidationError(format!(
                        "corrupt migration lock {}: {}",
                        self.path.display(),
                        e
                    ))
                })?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn state(&self) -> Result<LockState> {
        match self.read_holder() {
            Ok(None) => Ok(LockState::Free),
            Ok(Some(record)) => {
                if self.is_stale(&record) {
                    Ok(LockState::Stale(record))
                } else {
                    Ok(LockState::Held(record))
                }
            }
            Err(StoreError::ValidationError(_)) => Ok(LockState::Corrupt),
            Err(e) => Err(e),
        }
    }

    pub fn is_stale(&self, record: &LockRecord) -> bool {
        if record.age_ms() > self.options.stale_after.as_millis() as u64 {
            return true;
        }
        // Liveness is only meaningful for processes on this host.
        record.hostname == hostname() && !process_alive(record.pid)
    }

    fn create_exclusive(&self) -> Result<bool> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let record = LockRecord::current();
        let body = serde_json::to_vec(&record)?;
        let staging = self.path.with_extension(format!(
            "lock.{}.{}.tmp",
            record.pid,
            time::random_token(8)
        ));
        {
            let mut f = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&staging)?;
            f.write_all(&body)?;
            f.sync_all()?;
        }
        let linked = fs::hard_link(&staging, &self.path);
        let _ = fs::remove_file(&staging);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Unsupported => self.create_exclusive_direct(&body),
            Err(e) => Err(e.into()),
        }
    }

    /// Fallback for filesystems without hard links.
    fn create_exclusive_direct(&self, body: &[u8]) -> Result<bool> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut f) => {
                f.write_all(body)?;
                f.sync_all()?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the lock file only if it still holds what we judged stale.
    /// Returns true when this call removed it.
    fn steal_if_unchanged(&self, judged: Option<&LockRecord>) -> Result<bool> {
        let Some(_marker) = self.take_steal_marker()? else {
            return Ok(false);
        };
        let current = self.read_holder();
        let unchanged = match (&current, judged) {
            (Ok(Some(now)), Some(then)) => now == then,
            (Err(StoreError::ValidationError(_)), None) => true,
            _ => false,
        };
        if unchanged {
            remove_file_if_exists(&self.path)?;
        }
        Ok(unchanged)
    }

    pub fn steal_marker_path(&self) -> PathBuf {
        self.path.with_extension("lock.steal")
    }

    /// `None` while another contender is stealing. A marker older than
    /// `stale_after` belongs to a contender that died mid-steal and is
    /// cleared for the next attempt.
    fn take_steal_marker(&self) -> Result<Option<StealMarker>> {
        let path = self.steal_marker_path();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                let marker = StealMarker { path };
                f.write_all(&serde_json::to_vec(&LockRecord::current())?)?;
                Ok(Some(marker))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let abandoned = fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.elapsed().ok())
                    .is_some_and(|age| age > self.options.stale_after);
                if abandoned {
                    warn!(path = %path.display(), "removing abandoned steal marker");
                    remove_file_if_exists(&path)?;
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Exclusive right to delete a stale lock; removed on drop.
struct StealMarker {
    path: PathBuf,
}

impl Drop for StealMarker {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Releases the lock when dropped.
#[derive(Debug)]
pub struct MigrationLockGuard {
    lock: MigrationLock,
    released: bool,
}

impl MigrationLockGuard {
    pub fn path(&self) -> &Path {
        self.lock.path()
    }

    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        self.lock.release()
    }
}

impl Drop for MigrationLockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.lock.release() {
                warn!(path = %self.lock.path().display(), error = %e, "failed to release migration lock");
            }
        }
    }
}

/// `patterns.db` -> `patterns.migration.lock`.
pub fn lock_path_for(db_path: &Path) -> PathBuf {
    db_path.with_extension("migration.lock")
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn held_locks() -> &'static Mutex<HashSet<PathBuf>> {
    static HELD: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

fn register_held(path: &Path) {
    if let Ok(mut held) = held_locks().lock() {
        held.insert(path.to_path_buf());
    }
}

fn unregister_held(path: &Path) {
    if let Ok(mut held) = held_locks().lock() {
        held.remove(path);
    }
}

/// Remove every lock file this process still holds.
fn release_all_held() {
    let paths: Vec<PathBuf> = match held_locks().lock() {
        Ok(mut held) => held.drain().collect(),
        Err(_) => return,
    };
    let me = std::process::id();
    for path in paths {
        let owned = fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str::<LockRecord>(&c).ok())
            .is_some_and(|r| r.pid == me);
        if owned {
            let _ = fs::remove_file(&path);
        }
    }
}

static SIGNAL_HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

fn install_signal_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        SIGNAL_HANDLER_INSTALLED.store(true, Ordering::SeqCst);
        let installed = ctrlc::set_handler(|| {
            release_all_held();
            std::process::exit(130);
        });
        if let Err(e) = installed {
            debug!(error = %e, "signal handler not installed; relying on drop and staleness");
        }
    });
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    pid != 0
}

#[cfg(unix)]
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(not(unix))]
pub fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}
