//! Per-instance advisory leases
//!
//! At most one orchestrator operation may run against an instance at a time.
//! Leases expire so a crashed caller cannot lock an instance forever.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub instance: String,
    /// Unique per acquisition; release only succeeds with the matching token
    pub token: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    fn new(instance: &str, owner: &str, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            instance: instance.to_string(),
            token: new_token(),
            owner: owner.to_string(),
            expires_at: Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Same lease, valid for `ttl` from now.
    #[must_use]
    pub fn extended(&self, ttl: Duration) -> Self {
        let mut renewed = Self::new(&self.instance, &self.owner, ttl);
        renewed.token.clone_from(&self.token);
        renewed
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn held_error(&self) -> Error {
        Error::LeaseHeld {
            instance: self.instance.clone(),
            owner: self.owner.clone(),
            expires_at: self.expires_at.to_rfc3339(),
        }
    }
}

fn new_token() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    format!(
        "{}-{nanos:x}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Default lease owner: `user@host:pid`.
pub fn default_owner() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{user}@{host}:{}", std::process::id())
}

/// Store of per-instance leases.
pub trait LeaseStore: Send + Sync {
    /// Take the lease for `instance`, or fail with [`Error::LeaseHeld`].
    ///
    /// An expired lease held by someone else is taken over.
    fn acquire(&self, instance: &str, owner: &str, ttl: Duration) -> Result<Lease>;

    /// Push the expiry of a lease still held to `ttl` from now.
    ///
    /// Fails if the lease expired and was taken over.
    fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease>;

    /// Give a lease back. Releasing a lease that was taken over is a no-op.
    fn release(&self, lease: &Lease) -> Result<()>;
}

/// In-process lease store.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn acquire(&self, instance: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| Error::Lease("lease table poisoned".to_string()))?;
        if let Some(held) = leases.get(instance)
            && !held.is_expired()
        {
            return Err(held.held_error());
        }
        let lease = Lease::new(instance, owner, ttl);
        leases.insert(instance.to_string(), lease.clone());
        Ok(lease)
    }

    fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| Error::Lease("lease table poisoned".to_string()))?;
        match leases.get(&lease.instance) {
            Some(current) if current.token == lease.token => {}
            Some(current) => return Err(current.held_error()),
            None => return Err(Error::Lease(format!("lease on {} was lost", lease.instance))),
        }
        let renewed = lease.extended(ttl);
        leases.insert(lease.instance.clone(), renewed.clone());
        Ok(renewed)
    }

    fn release(&self, lease: &Lease) -> Result<()> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| Error::Lease("lease table poisoned".to_string()))?;
        if leases.get(&lease.instance).is_some_and(|l| l.token == lease.token) {
            leases.remove(&lease.instance);
        }
        Ok(())
    }
}

/// Lease store backed by one JSON lock file per instance.
///
/// Works across processes on one machine.
#[derive(Debug, Clone)]
pub struct FileLeaseStore {
    dir: PathBuf,
}

impl FileLeaseStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn lock_path(&self, instance: &str) -> PathBuf {
        let safe: String = instance
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.lock"))
    }

    fn read(path: &Path) -> Option<Lease> {
        let bytes = fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn lease_err(action: &str, path: &Path, err: &std::io::Error) -> Error {
        Error::Lease(format!("{action} {}: {err}", path.display()))
    }

    /// Classify the lock file currently at `path`.
    ///
    /// A file that does not parse may belong to a holder that has not
    /// finished writing it, so it counts as held until its mtime is older
    /// than `ttl`.
    fn lock_state(instance: &str, path: &Path, ttl: Duration) -> Result<LockState> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(LockState::Gone),
            Err(e) => return Err(Self::lease_err("reading", path, &e)),
        };
        if let Ok(held) = serde_json::from_slice::<Lease>(&bytes) {
            return Ok(if held.is_expired() {
                LockState::Stale(bytes)
            } else {
                LockState::Held(held.held_error())
            });
        }

        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or(UNIX_EPOCH);
        let age = modified.elapsed().unwrap_or_default();
        if age < ttl {
            let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
            let expires_at = DateTime::<Utc>::from(modified)
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            return Ok(LockState::Held(Error::LeaseHeld {
                instance: instance.to_string(),
                owner: "unknown (unreadable lock file)".to_string(),
                expires_at: expires_at.to_rfc3339(),
            }));
        }
        Ok(LockState::Stale(bytes))
    }

    /// Link the fully written `staged` file into place as the lock.
    ///
    /// `hard_link` fails when the lock exists, so a live lock is never
    /// overwritten. A stale lock is first renamed aside; only the process
    /// whose rename moved the bytes it judged stale may take over.
    fn link_into_place(staged: &Path, path: &Path, lease: &Lease, ttl: Duration) -> Result<Lease> {
        for _ in 0..2 {
            match fs::hard_link(staged, path) {
                Ok(()) => return Ok(lease.clone()),
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => {}
                Err(e) => return Err(Self::lease_err("linking", path, &e)),
            }

            let observed = match Self::lock_state(&lease.instance, path, ttl)? {
                LockState::Held(err) => return Err(err),
                LockState::Gone => continue,
                LockState::Stale(bytes) => bytes,
            };

            let aside = path.with_extension(format!("stale.{}", lease.token));
            match fs::rename(path, &aside) {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                Err(e) => return Err(Self::lease_err("moving aside", path, &e)),
            }
            let moved = fs::read(&aside).unwrap_or_default();
            if moved != observed {
                // Another process took over first; hand its lease back
                if let Err(e) = fs::hard_link(&aside, path) {
                    log::warn!("could not restore lease file {}: {e}", path.display());
                }
                remove_quietly(&aside);
                return Err(serde_json::from_slice::<Lease>(&moved).map_or_else(
                    |_| Error::Lease(format!("lost the race for {}", path.display())),
                    |held| held.held_error(),
                ));
            }
            remove_quietly(&aside);
            log::warn!("taking over stale lease on {}", lease.instance);
        }
        Err(Error::Lease(format!("lost the race for {}", path.display())))
    }
}

enum LockState {
    Held(Error),
    /// Expired or abandoned; carries the bytes that were judged stale
    Stale(Vec<u8>),
    Gone,
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != IoErrorKind::NotFound
    {
        log::debug!("could not remove {}: {e}", path.display());
    }
}

impl LeaseStore for FileLeaseStore {
    fn acquire(&self, instance: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        fs::create_dir_all(&self.dir).map_err(|e| Self::lease_err("creating", &self.dir, &e))?;
        let path = self.lock_path(instance);
        let lease = Lease::new(instance, owner, ttl);

        let staged = path.with_extension(format!("lock.{}", lease.token));
        fs::write(&staged, serde_json::to_vec_pretty(&lease)?)
            .map_err(|e| Self::lease_err("writing", &staged, &e))?;
        let result = Self::link_into_place(&staged, &path, &lease, ttl);
        remove_quietly(&staged);

        if result.is_ok() {
            log::debug!("lease on {instance} taken by {owner}");
        }
        result
    }

    fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let path = self.lock_path(&lease.instance);
        match Self::read(&path) {
            Some(current) if current.token == lease.token => {}
            Some(current) => return Err(current.held_error()),
            None => return Err(Error::Lease(format!("lease on {} was lost", lease.instance))),
        }
        let renewed = lease.extended(ttl);
        let staged = path.with_extension(format!("renew.{}", lease.token));
        fs::write(&staged, serde_json::to_vec_pretty(&renewed)?)
            .map_err(|e| Self::lease_err("writing", &staged, &e))?;
        fs::rename(&staged, &path).map_err(|e| Self::lease_err("replacing", &path, &e))?;
        log::trace!("lease on {} renewed until {}", lease.instance, renewed.expires_at);
        Ok(renewed)
    }

    fn release(&self, lease: &Lease) -> Result<()> {
        let path = self.lock_path(&lease.instance);
        match Self::read(&path) {
            Some(current) if current.token == lease.token => {
                fs::remove_file(&path).map_err(|e| Self::lease_err("removing", &path, &e))?;
                log::debug!("lease on {} released", lease.instance);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Releases its lease when dropped.
pub struct LeaseGuard {
    store: Arc<dyn LeaseStore>,
    lease: Lease,
}

impl LeaseGuard {
    pub fn acquire(store: Arc<dyn LeaseStore>, instance: &str, owner: &str, ttl: Duration) -> Result<Self> {
        let lease = store.acquire(instance, owner, ttl)?;
        Ok(Self { store, lease })
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Extend the held lease to `ttl` from now.
    pub fn renew(&mut self, ttl: Duration) -> Result<()> {
        self.lease = self.store.renew(&self.lease, ttl)?;
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Err(e) = self.store.release(&self.lease) {
            log::warn!("failed to release lease on {}: {e}", self.lease.instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_memory_lease_is_exclusive() {
        let store = MemoryLeaseStore::new();
        let lease = store.acquire("lab-1", "alice", TTL).unwrap();

        let err = store.acquire("lab-1", "bob", TTL).unwrap_err();
        assert!(matches!(err, Error::LeaseHeld { ref owner, .. } if owner == "alice"));
        assert!(store.acquire("lab-2", "bob", TTL).is_ok());

        store.release(&lease).unwrap();
        assert!(store.acquire("lab-1", "bob", TTL).is_ok());
    }

    #[test]
    fn test_memory_expired_lease_is_taken_over() {
        let store = MemoryLeaseStore::new();
        let stale = store.acquire("lab-1", "crashed", Duration::ZERO).unwrap();
        let fresh = store.acquire("lab-1", "bob", TTL).unwrap();

        // The stale holder's release must not free bob's lease
        store.release(&stale).unwrap();
        assert!(store.acquire("lab-1", "carol", TTL).is_err());
        store.release(&fresh).unwrap();
    }

    #[test]
    fn test_file_lease_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = FileLeaseStore::new(dir.path());
        let lease = store.acquire("lab-1", "alice", TTL).unwrap();
        assert!(dir.path().join("lab-1.lock").exists());

        let other = FileLeaseStore::new(dir.path());
        assert!(matches!(
            other.acquire("lab-1", "bob", TTL),
            Err(Error::LeaseHeld { .. })
        ));

        store.release(&lease).unwrap();
        assert!(!dir.path().join("lab-1.lock").exists());
        assert!(other.acquire("lab-1", "bob", TTL).is_ok());
    }

    fn age_file(path: &Path, by: Duration) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn test_file_lease_expired_is_replaced() {
        let dir = TempDir::new().unwrap();
        let store = FileLeaseStore::new(dir.path());

        let stale = store.acquire("lab-1", "crashed", Duration::ZERO).unwrap();
        let fresh = store.acquire("lab-1", "bob", TTL).unwrap();
        store.release(&stale).unwrap();
        assert!(dir.path().join("lab-1.lock").exists());
        store.release(&fresh).unwrap();
        // Staging and side files are cleaned up
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_file_lease_half_written_lock_is_held() {
        let dir = TempDir::new().unwrap();
        let store = FileLeaseStore::new(dir.path());
        let lock = dir.path().join("lab-1.lock");

        // A holder that created the file but has not written it yet
        fs::write(&lock, "").unwrap();
        let err = store.acquire("lab-1", "second", TTL).unwrap_err();
        assert!(matches!(err, Error::LeaseHeld { ref owner, .. } if owner.starts_with("unknown")));
        assert!(fs::read(&lock).unwrap().is_empty());

        fs::write(dir.path().join("lab-2.lock"), "not json").unwrap();
        assert!(store.acquire("lab-2", "second", TTL).is_err());
    }

    #[test]
    fn test_file_lease_abandoned_unreadable_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        let store = FileLeaseStore::new(dir.path());
        let lock = dir.path().join("lab-1.lock");

        fs::write(&lock, "{\"instance\":").unwrap();
        age_file(&lock, TTL * 2);
        let lease = store.acquire("lab-1", "bob", TTL).unwrap();
        assert_eq!(FileLeaseStore::read(&lock).unwrap().token, lease.token);
    }

    #[test]
    fn test_renew_extends_held_lease_only() {
        let dir = TempDir::new().unwrap();
        let file = FileLeaseStore::new(dir.path());
        let memory = MemoryLeaseStore::new();
        let stores: [&dyn LeaseStore; 2] = [&file, &memory];

        for store in stores {
            let short = store.acquire("lab-1", "alice", Duration::from_secs(1)).unwrap();
            let renewed = store.renew(&short, TTL).unwrap();
            assert_eq!(renewed.token, short.token);
            assert!(renewed.expires_at > short.expires_at);
            assert!(store.acquire("lab-1", "bob", TTL).is_err());
            store.release(&renewed).unwrap();

            // Once taken over, the old holder cannot renew
            let stale = store.acquire("lab-2", "crashed", Duration::ZERO).unwrap();
            let taken = store.acquire("lab-2", "bob", TTL).unwrap();
            let err = store.renew(&stale, TTL).unwrap_err();
            assert!(matches!(err, Error::LeaseHeld { ref owner, .. } if owner == "bob"));
            store.release(&taken).unwrap();
        }
    }

    #[test]
    fn test_instance_names_are_sanitized() {
        let dir = TempDir::new().unwrap();
        let store = FileLeaseStore::new(dir.path());
        store.acquire("../etc/lab 1", "alice", TTL).unwrap();
        assert!(dir.path().join(".._etc_lab_1.lock").exists());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
        {
            let guard = LeaseGuard::acquire(store.clone(), "lab-1", "alice", TTL).unwrap();
            assert_eq!(guard.lease().owner, "alice");
            assert!(store.acquire("lab-1", "bob", TTL).is_err());
        }
        assert!(store.acquire("lab-1", "bob", TTL).is_ok());
    }

    #[test]
    fn test_guard_renew() {
        let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
        let mut guard = LeaseGuard::acquire(store.clone(), "lab-1", "alice", Duration::from_secs(1)).unwrap();
        let before = guard.lease().expires_at;
        guard.renew(TTL).unwrap();
        assert!(guard.lease().expires_at > before);
        drop(guard);
        assert!(store.acquire("lab-1", "bob", TTL).is_ok());
    }
}
