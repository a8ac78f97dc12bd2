//! Advisory refresh locks
//!
//! One lock per resource ID. `FileLock` coordinates separate worker processes
//! on one host through lock files published with a hard link (which fails if
//! the file exists); `MemoryLock` covers single-process deployments and tests.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use common::BoxFuture;
use common::time::{millis, now_millis};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Proof of lock ownership, also the JSON body of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub resource_id: String,
    pub holder_pid: u32,
    /// Unique per acquisition; release only removes a lock with this holder.
    pub holder: String,
    /// Unix milliseconds.
    pub acquired_at: u64,
}

impl LockLease {
    fn new(resource_id: &str) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            holder_pid: std::process::id(),
            holder: uuid::Uuid::new_v4().to_string(),
            acquired_at: now_millis(),
        }
    }

    fn is_stale(&self, now: u64, stale_after: Duration) -> bool {
        now.saturating_sub(self.acquired_at) >= millis(stale_after)
    }
}

/// Exclusive, identifier-scoped lock with stale reclamation.
pub trait AdvisoryLock: Send + Sync {
    /// Take the lock if it is free or held longer than `stale_after`.
    /// `None` means someone else holds it.
    fn try_acquire<'a>(
        &'a self,
        resource_id: &'a str,
        stale_after: Duration,
    ) -> BoxFuture<'a, Result<Option<LockLease>>>;

    /// Drop the lock if `lease` still owns it.
    fn release<'a>(&'a self, lease: &'a LockLease) -> BoxFuture<'a, Result<()>>;
}

/// Lock files under one directory, one per resource.
pub struct FileLock {
    dir: PathBuf,
}

impl FileLock {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, resource_id: &str) -> PathBuf {
        let name: String = resource_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.lock"))
    }

    /// Sibling scratch file owned by one acquisition attempt.
    fn scratch(path: &Path, holder: &str, suffix: &str) -> PathBuf {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("refresh.lock");
        path.with_file_name(format!(".{name}.{holder}.{suffix}"))
    }

    /// Publish `lease` at `path` unless a lock already exists there.
    ///
    /// The body is written to a scratch file first and hard-linked into
    /// place, so the lock file never exists without its full body.
    async fn create(&self, path: &Path, lease: &LockLease) -> Result<bool> {
        let body = serde_json::to_vec(lease)
            .map_err(|e| Error::CredentialParse(format!("serializing lock: {e}")))?;
        let staging = Self::scratch(path, &lease.holder, "tmp");
        tokio::fs::write(&staging, &body)
            .await
            .map_err(|e| Error::Io(format!("writing lock body: {e}")))?;

        let linked = tokio::fs::hard_link(&staging, path).await;
        discard(&staging).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::Io(format!("publishing lock file: {e}"))),
        }
    }

    /// State of the lock file at `path`. A body that does not parse is
    /// stale only once the file itself is older than `stale_after`.
    async fn inspect(&self, path: &Path, stale_after: Duration) -> Result<Holder> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Holder::Gone),
            Err(e) => return Err(Error::Io(format!("reading lock file: {e}"))),
        };
        if let Ok(lease) = serde_json::from_slice::<LockLease>(&bytes) {
            return Ok(if lease.is_stale(now_millis(), stale_after) {
                Holder::Stale(Some(lease))
            } else {
                Holder::Live
            });
        }

        let modified = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Holder::Gone),
            Err(e) => return Err(Error::Io(format!("reading lock file age: {e}"))),
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        Ok(if age >= stale_after {
            Holder::Stale(None)
        } else {
            Holder::Live
        })
    }

    /// Remove the stale lock observed as `seen`, and nothing else.
    ///
    /// The file is first renamed aside, which only one reclaimer can do.
    /// If what was moved is not the lock we judged stale (it was replaced
    /// in between), it is linked back and the reclaim is abandoned.
    async fn reclaim(
        &self,
        path: &Path,
        ours: &LockLease,
        seen: &Option<LockLease>,
        stale_after: Duration,
    ) -> Result<bool> {
        let aside = Self::scratch(path, &ours.holder, "reclaim");
        match tokio::fs::rename(path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::Io(format!("moving stale lock aside: {e}"))),
        }

        let same = match (self.inspect(&aside, stale_after).await?, seen) {
            (Holder::Stale(Some(moved)), Some(seen)) => moved.holder == seen.holder,
            (Holder::Stale(None), None) => true,
            _ => false,
        };
        if !same {
            match tokio::fs::hard_link(&aside, path).await {
                Ok(()) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "could not restore replaced lock"),
            }
            discard(&aside).await;
            debug!(path = %path.display(), "lock changed hands during reclaim, backing off");
            return Ok(false);
        }

        discard(&aside).await;
        warn!(
            resource_id = %ours.resource_id,
            holder_pid = ?seen.as_ref().map(|l| l.holder_pid),
            "reclaimed stale refresh lock"
        );
        Ok(true)
    }
}

/// What `inspect` found at a lock path.
enum Holder {
    Gone,
    Live,
    /// Held past `stale_after`. `None` when the body could not be parsed.
    Stale(Option<LockLease>),
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove lock scratch file"),
    }
}

impl AdvisoryLock for FileLock {
    fn try_acquire<'a>(
        &'a self,
        resource_id: &'a str,
        stale_after: Duration,
    ) -> BoxFuture<'a, Result<Option<LockLease>>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| Error::Io(format!("creating lock directory: {e}")))?;
            let path = self.path_for(resource_id);
            let lease = LockLease::new(resource_id);

            if self.create(&path, &lease).await? {
                debug!(resource_id, holder = %lease.holder, "refresh lock acquired");
                return Ok(Some(lease));
            }

            // Gone: released between our create and read; next poll will win.
            let seen = match self.inspect(&path, stale_after).await? {
                Holder::Gone | Holder::Live => return Ok(None),
                Holder::Stale(seen) => seen,
            };
            if !self.reclaim(&path, &lease, &seen, stale_after).await? {
                return Ok(None);
            }

            if self.create(&path, &lease).await? {
                info!(resource_id, holder = %lease.holder, "stale refresh lock reclaimed");
                Ok(Some(lease))
            } else {
                Ok(None)
            }
        })
    }

    fn release<'a>(&'a self, lease: &'a LockLease) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = self.path_for(&lease.resource_id);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(Error::Io(format!("reading lock file: {e}"))),
            };
            let ours = serde_json::from_slice::<LockLease>(&bytes)
                .is_ok_and(|current| current.holder == lease.holder);
            if !ours {
                warn!(
                    resource_id = %lease.resource_id,
                    "refresh lock was reclaimed by another holder, leaving it"
                );
                return Ok(());
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(format!("removing lock file: {e}"))),
            }
            debug!(resource_id = %lease.resource_id, "refresh lock released");
            Ok(())
        })
    }
}

/// In-process lock table.
#[derive(Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, LockLease>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdvisoryLock for MemoryLock {
    fn try_acquire<'a>(
        &'a self,
        resource_id: &'a str,
        stale_after: Duration,
    ) -> BoxFuture<'a, Result<Option<LockLease>>> {
        Box::pin(async move {
            let mut held = self.held.lock().await;
            if let Some(current) = held.get(resource_id) {
                if !current.is_stale(now_millis(), stale_after) {
                    return Ok(None);
                }
                warn!(resource_id, "reclaiming stale refresh lock");
            }
            let lease = LockLease::new(resource_id);
            held.insert(resource_id.to_string(), lease.clone());
            Ok(Some(lease))
        })
    }

    fn release<'a>(&'a self, lease: &'a LockLease) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut held = self.held.lock().await;
            if held
                .get(&lease.resource_id)
                .is_some_and(|current| current.holder == lease.holder)
            {
                held.remove(&lease.resource_id);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALE: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn file_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("locks"));

        let lease = lock.try_acquire("gmail-1", STALE).await.unwrap().unwrap();
        assert!(lock.try_acquire("gmail-1", STALE).await.unwrap().is_none());
        // Other resources are independent.
        assert!(lock.try_acquire("gmail-2", STALE).await.unwrap().is_some());

        lock.release(&lease).await.unwrap();
        assert!(lock.try_acquire("gmail-1", STALE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn file_lock_body_names_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().to_path_buf());

        let lease = lock.try_acquire("a@b.com", STALE).await.unwrap().unwrap();
        let bytes = tokio::fs::read(dir.path().join("a_b.com.lock")).await.unwrap();
        let body: LockLease = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, lease);
        assert_eq!(body.holder_pid, std::process::id());
    }

    #[tokio::test]
    async fn stale_file_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().to_path_buf());
        let stale = LockLease {
            resource_id: "gmail-1".into(),
            holder_pid: 1,
            holder: "crashed-worker".into(),
            acquired_at: now_millis() - 301_000,
        };
        tokio::fs::write(
            dir.path().join("gmail-1.lock"),
            serde_json::to_vec(&stale).unwrap(),
        )
        .await
        .unwrap();

        let lease = lock.try_acquire("gmail-1", STALE).await.unwrap().unwrap();
        assert_ne!(lease.holder, "crashed-worker");

        // The crashed holder's late release must not drop our lock.
        lock.release(&stale).await.unwrap();
        assert!(lock.try_acquire("gmail-1", STALE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn freshly_created_unreadable_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().to_path_buf());
        // Another process crashed or is mid-write: empty body, new file.
        tokio::fs::write(dir.path().join("gmail-1.lock"), b"").await.unwrap();

        assert!(lock.try_acquire("gmail-1", STALE).await.unwrap().is_none());
        assert!(dir.path().join("gmail-1.lock").exists());
    }

    #[tokio::test]
    async fn old_unreadable_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().to_path_buf());
        let path = dir.path().join("r.lock");
        std::fs::write(&path, b"{trunc").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(301))
            .unwrap();

        let lease = lock.try_acquire("r", STALE).await.unwrap().unwrap();
        let body: LockLease = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(body, lease);
    }

    #[tokio::test]
    async fn reclaim_leaves_a_lock_replaced_after_inspection() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().to_path_buf());
        let path = dir.path().join("gmail-1.lock");
        let crashed = LockLease {
            resource_id: "gmail-1".into(),
            holder_pid: 1,
            holder: "crashed-worker".into(),
            acquired_at: now_millis() - 301_000,
        };
        std::fs::write(&path, serde_json::to_vec(&crashed).unwrap()).unwrap();
        let Holder::Stale(seen) = lock.inspect(&path, STALE).await.unwrap() else {
            panic!("expected a stale lock");
        };

        // A faster worker reclaims and publishes its own lock first.
        let winner = LockLease::new("gmail-1");
        std::fs::remove_file(&path).unwrap();
        assert!(lock.create(&path, &winner).await.unwrap());

        let late = LockLease::new("gmail-1");
        assert!(!lock.reclaim(&path, &late, &seen, STALE).await.unwrap());
        let body: LockLease = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(body, winner);
        assert!(lock.try_acquire("gmail-1", STALE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn acquisition_leaves_no_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().to_path_buf());
        let lease = lock.try_acquire("gmail-1", STALE).await.unwrap().unwrap();
        assert!(lock.try_acquire("gmail-1", STALE).await.unwrap().is_none());

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["gmail-1.lock".to_string()]);

        lock.release(&lease).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn concurrent_acquirers_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let lock = std::sync::Arc::new(FileLock::new(dir.path().to_path_buf()));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                tokio::spawn(async move { lock.try_acquire("gmail-1", STALE).await.unwrap() })
            })
            .collect();
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn memory_lock_is_exclusive_and_reclaims() {
        let lock = MemoryLock::new();
        let lease = lock.try_acquire("r", STALE).await.unwrap().unwrap();
        assert!(lock.try_acquire("r", STALE).await.unwrap().is_none());
        // Zero staleness: any existing lock is reclaimable.
        let newer = lock.try_acquire("r", Duration::ZERO).await.unwrap().unwrap();
        lock.release(&lease).await.unwrap();
        assert!(lock.try_acquire("r", STALE).await.unwrap().is_none());
        lock.release(&newer).await.unwrap();
        assert!(lock.try_acquire("r", STALE).await.unwrap().is_some());
    }
}
