//! Download lock on the shared volume
//!
//! The lock is a file created with create-exclusive semantics. It records
//! the holder, the acquisition time and a fencing token. Existence plus age
//! of that file is the only source of truth: there is no lock server.
//!
//! # Staleness
//!
//! A lock older than `stale_after` is presumed abandoned. Reclaiming one is
//! done in three steps:
//!
//! 1. rename the stale file aside and check that what moved is byte-for-byte
//!    the lock that was judged stale (otherwise put it back and back off);
//! 2. create a new lock with `fencing_token = old + 1`;
//! 3. read the lock back and confirm it is ours.
//!
//! Two reclaimers can still both pass step 1 if one of them finishes all
//! three steps before the other renames. The loser then holds a handle whose
//! token no longer matches the file, which [`LockCoordinator::is_held_by`]
//! detects. Long operations must re-check before committing.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::retry::{Clock, RetryPolicy};
use crate::common::utils::{read_optional, temp_sibling, write_atomic};
use crate::common::{Error, LockConfig, Result, StalePolicy};
use crate::volume::shared::SharedVolume;

/// Holder name reported for lock files that cannot be parsed
pub const UNKNOWN_HOLDER: &str = "unknown";

/// Attempts at the create/inspect cycle when the lock vanishes in between
const VANISHED_RETRIES: usize = 3;

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(default)]
    pub fencing_token: u64,
}

impl LockInfo {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.acquired_at
    }

    /// Stale when strictly older than the threshold
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        let threshold =
            chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::days(36_500));
        self.age(now) > threshold
    }
}

/// A lock file as read from disk
#[derive(Debug, Clone)]
struct Observed {
    info: LockInfo,
    raw: Vec<u8>,
    modified: Option<SystemTime>,
}

impl Observed {
    fn same_file_as(&self, other: &Observed) -> bool {
        self.raw == other.raw && self.modified == other.modified
    }
}

/// Exclusive lock over the shared volume
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    lock_path: PathBuf,
    fence_path: PathBuf,
    holder_id: String,
    stale_after: Duration,
    stale_policy: StalePolicy,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl LockCoordinator {
    pub fn new(
        volume: &SharedVolume,
        holder_id: impl Into<String>,
        config: &LockConfig,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lock_path: volume.lock_file_path(),
            fence_path: volume.fence_file_path(),
            holder_id: holder_id.into(),
            stale_after: config.stale_after(),
            stale_policy: config.stale_policy,
            retry,
            clock,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Current lock, if any
    pub fn inspect(&self) -> Result<Option<LockInfo>> {
        Ok(self.observe()?.map(|o| o.info))
    }

    /// Whether a lock exists and is younger than the stale threshold
    pub fn is_locked(&self) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .inspect()?
            .is_some_and(|info| !info.is_stale(now, self.stale_after)))
    }

    /// Acquire the lock, polling for up to `timeout` (zero = single attempt)
    pub async fn acquire(&self, timeout: Duration) -> Result<LockHandle> {
        if timeout.is_zero() {
            return self.try_acquire();
        }

        let mut poller = self.retry.poller(Some(timeout));
        loop {
            match self.try_acquire() {
                Ok(handle) => return Ok(handle),
                Err(e @ Error::LockAcquire { .. }) => {
                    tracing::debug!("{} (attempt {})", e, poller.attempts() + 1);
                    if !poller.wait().await {
                        tracing::info!(
                            "Gave up on {:?} after {:?}: {}",
                            self.lock_path,
                            poller.elapsed(),
                            e
                        );
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One acquisition attempt, never blocks
    pub fn try_acquire(&self) -> Result<LockHandle> {
        for _ in 0..VANISHED_RETRIES {
            if let Some(handle) = self.create(0)? {
                return Ok(handle);
            }

            let Some(existing) = self.observe()? else {
                // released between our create and our read
                continue;
            };

            let now = self.clock.now();
            if !existing.info.is_stale(now, self.stale_after) {
                return Err(self.held_by(&existing.info.holder_id));
            }

            return match self.stale_policy {
                StalePolicy::Reclaim => self.reclaim_observed(&existing),
                StalePolicy::Report => Err(Error::StaleLock {
                    holder: existing.info.holder_id.clone(),
                    age_secs: existing.info.age(now).num_seconds(),
                    path: self.lock_path.display().to_string(),
                }),
            };
        }

        Err(self.held_by(UNKNOWN_HOLDER))
    }

    /// Take over a stale lock (for callers using `StalePolicy::Report`)
    pub fn reclaim_stale(&self) -> Result<LockHandle> {
        match self.observe()? {
            None => self.try_acquire(),
            Some(existing) => {
                if !existing.info.is_stale(self.clock.now(), self.stale_after) {
                    return Err(self.held_by(&existing.info.holder_id));
                }
                self.reclaim_observed(&existing)
            }
        }
    }

    /// Release a handle (same as dropping it, but reports the outcome)
    pub fn release(&self, handle: LockHandle) -> Result<bool> {
        handle.release()
    }

    /// Whether the lock file still carries this handle's holder and token
    pub fn is_held_by(&self, handle: &LockHandle) -> Result<bool> {
        Ok(self
            .inspect()?
            .is_some_and(|info| handle.matches(&info)))
    }

    fn reclaim_observed(&self, stale: &Observed) -> Result<LockHandle> {
        tracing::warn!(
            "Reclaiming stale lock {:?} from {} (acquired {}, token {})",
            self.lock_path,
            stale.info.holder_id,
            stale.info.acquired_at,
            stale.info.fencing_token
        );

        if !take_aside(&self.lock_path, stale)? {
            return Err(self.held_by(&stale.info.holder_id));
        }

        match self.create(stale.info.fencing_token)? {
            Some(handle) => Ok(handle),
            // another peer reclaimed first
            None => {
                let holder = self
                    .inspect()?
                    .map(|info| info.holder_id)
                    .unwrap_or_else(|| UNKNOWN_HOLDER.to_string());
                Err(self.held_by(&holder))
            }
        }
    }

    /// Create the lock file exclusively. `None` when it already exists.
    ///
    /// The token is read from the fence file only once the file is ours: the
    /// previous holder bumped the fence before it could release.
    fn create(&self, min_token: u64) -> Result<Option<LockHandle>> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let token = match self.read_fence() {
            Ok(fence) => fence.max(min_token) + 1,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&self.lock_path);
                return Err(e);
            }
        };
        let info = LockInfo {
            holder_id: self.holder_id.clone(),
            acquired_at: self.clock.now(),
            fencing_token: token,
        };
        let written = serde_json::to_vec(&info)
            .map_err(Error::from)
            .and_then(|body| {
                file.write_all(&body)?;
                file.sync_all()?;
                Ok(())
            });
        if let Err(e) = written {
            let _ = fs::remove_file(&self.lock_path);
            return Err(e);
        }
        drop(file);

        let handle = LockHandle {
            lock_path: self.lock_path.clone(),
            info,
            released: false,
        };

        // re-validate after create: a racing reclaimer may have moved our
        // fresh file aside before we finished writing it
        match self.inspect()? {
            Some(current) if handle.matches(&current) => {}
            other => {
                let holder = other
                    .map(|info| info.holder_id)
                    .unwrap_or_else(|| UNKNOWN_HOLDER.to_string());
                let mut handle = handle;
                handle.released = true;
                return Err(self.held_by(&holder));
            }
        }

        write_atomic(&self.fence_path, token.to_string().as_bytes())?;
        tracing::info!(
            "Acquired lock {:?} as {} (token {})",
            self.lock_path,
            self.holder_id,
            token
        );
        Ok(Some(handle))
    }

    fn observe(&self) -> Result<Option<Observed>> {
        observe(&self.lock_path)
    }

    fn read_fence(&self) -> Result<u64> {
        Ok(read_optional(&self.fence_path)?
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0))
    }

    fn held_by(&self, holder: &str) -> Error {
        Error::LockAcquire {
            holder: holder.to_string(),
            path: self.lock_path.display().to_string(),
        }
    }
}

/// Proof of holding the download lock; released on drop
#[derive(Debug)]
pub struct LockHandle {
    lock_path: PathBuf,
    info: LockInfo,
    released: bool,
}

impl LockHandle {
    pub fn holder_id(&self) -> &str {
        &self.info.holder_id
    }

    pub fn fencing_token(&self) -> u64 {
        self.info.fencing_token
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.info.acquired_at
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Delete the lock file if it is still ours. Returns whether it was.
    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        release_file(&self.lock_path, &self.info)
    }

    fn matches(&self, info: &LockInfo) -> bool {
        info.holder_id == self.info.holder_id && info.fencing_token == self.info.fencing_token
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = release_file(&self.lock_path, &self.info) {
            tracing::error!("Failed to release lock {:?}: {}", self.lock_path, e);
        }
    }
}

fn release_file(lock_path: &Path, ours: &LockInfo) -> Result<bool> {
    let Some(current) = observe(lock_path)? else {
        tracing::warn!("Lock {:?} already gone at release", lock_path);
        return Ok(false);
    };

    if current.info.holder_id != ours.holder_id || current.info.fencing_token != ours.fencing_token
    {
        tracing::warn!(
            "Not releasing {:?}: now held by {} (token {}), ours was token {}",
            lock_path,
            current.info.holder_id,
            current.info.fencing_token,
            ours.fencing_token
        );
        return Ok(false);
    }

    let removed = take_aside(lock_path, &current)?;
    if removed {
        tracing::info!(
            "Released lock {:?} (token {})",
            lock_path,
            ours.fencing_token
        );
    }
    Ok(removed)
}

fn observe(lock_path: &Path) -> Result<Option<Observed>> {
    let raw = match fs::read(lock_path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let modified = fs::metadata(lock_path).and_then(|m| m.modified()).ok();

    let info = match serde_json::from_slice::<LockInfo>(&raw) {
        Ok(info) => info,
        Err(_) => {
            // half-written or foreign content: age it by mtime
            tracing::debug!("Unparseable lock file {:?}", lock_path);
            LockInfo {
                holder_id: UNKNOWN_HOLDER.to_string(),
                acquired_at: modified.map(DateTime::<Utc>::from).unwrap_or_else(Utc::now),
                fencing_token: 0,
            }
        }
    };

    Ok(Some(Observed {
        info,
        raw,
        modified,
    }))
}

/// Move the lock file aside and delete it if it is `expected`.
///
/// If something else was moved (the lock changed hands after we looked), it
/// is linked back into place and `false` is returned.
fn take_aside(lock_path: &Path, expected: &Observed) -> Result<bool> {
    let aside = temp_sibling(lock_path);
    match fs::rename(lock_path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    let moved = observe(&aside)?;
    if moved.as_ref().is_some_and(|m| m.same_file_as(expected)) {
        fs::remove_file(&aside)?;
        return Ok(true);
    }

    match fs::hard_link(&aside, lock_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            tracing::error!(
                "Lock {:?} changed hands twice while being inspected; dropping the displaced copy",
                lock_path
            );
        }
        Err(e) => {
            let _ = fs::remove_file(&aside);
            return Err(e.into());
        }
    }
    fs::remove_file(&aside)?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::retry::ManualClock;
    use crate::common::FilesystemIdSource;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SharedVolume, Arc<ManualClock>) {
        let dir = TempDir::new().unwrap();
        let volume = SharedVolume::open(dir.path(), FilesystemIdSource::Marker).unwrap();
        (dir, volume, Arc::new(ManualClock::default()))
    }

    fn coordinator(
        volume: &SharedVolume,
        holder: &str,
        clock: &Arc<ManualClock>,
        policy: StalePolicy,
    ) -> LockCoordinator {
        let config = LockConfig {
            stale_after_secs: 600,
            stale_policy: policy,
        };
        LockCoordinator::new(
            volume,
            holder,
            &config,
            RetryPolicy::new(Duration::from_secs(1)),
            clock.clone(),
        )
    }

    #[test]
    fn test_acquire_and_release() {
        let (_dir, volume, clock) = setup();
        let lock = coordinator(&volume, "app/0", &clock, StalePolicy::Reclaim);

        let handle = lock.try_acquire().unwrap();
        assert_eq!(handle.holder_id(), "app/0");
        assert_eq!(handle.fencing_token(), 1);
        assert!(lock.is_locked().unwrap());
        assert!(lock.is_held_by(&handle).unwrap());

        assert!(lock.release(handle).unwrap());
        assert!(!volume.lock_file_path().exists());
        assert!(!lock.is_locked().unwrap());
    }

    #[test]
    fn test_second_holder_is_rejected() {
        let (_dir, volume, clock) = setup();
        let a = coordinator(&volume, "app/0", &clock, StalePolicy::Reclaim);
        let b = coordinator(&volume, "app/1", &clock, StalePolicy::Reclaim);

        let _held = a.try_acquire().unwrap();
        match b.try_acquire() {
            Err(Error::LockAcquire { holder, .. }) => assert_eq!(holder, "app/0"),
            other => panic!("expected LockAcquire, got {:?}", other),
        }
    }

    #[test]
    fn test_drop_releases() {
        let (_dir, volume, clock) = setup();
        let a = coordinator(&volume, "app/0", &clock, StalePolicy::Reclaim);
        let b = coordinator(&volume, "app/1", &clock, StalePolicy::Reclaim);

        {
            let _held = a.try_acquire().unwrap();
        }
        let handle = b.try_acquire().unwrap();
        assert_eq!(handle.fencing_token(), 2);
    }

    #[test]
    fn test_young_lock_is_not_reclaimed() {
        let (_dir, volume, clock) = setup();
        let a = coordinator(&volume, "app/0", &clock, StalePolicy::Reclaim);
        let b = coordinator(&volume, "app/1", &clock, StalePolicy::Reclaim);

        let _held = a.try_acquire().unwrap();
        clock.advance(Duration::from_secs(600));
        assert!(matches!(b.try_acquire(), Err(Error::LockAcquire { .. })));
    }

    #[test]
    fn test_stale_lock_is_reclaimed_with_higher_token() {
        let (_dir, volume, clock) = setup();
        let a = coordinator(&volume, "app/0", &clock, StalePolicy::Reclaim);
        let b = coordinator(&volume, "app/1", &clock, StalePolicy::Reclaim);

        let crashed = a.try_acquire().unwrap();
        clock.advance(Duration::from_secs(601));

        let reclaimed = b.try_acquire().unwrap();
        assert_eq!(reclaimed.holder_id(), "app/1");
        assert!(reclaimed.fencing_token() > crashed.fencing_token());

        // the original holder has lost the lock and cannot release it
        assert!(!a.is_held_by(&crashed).unwrap());
        assert!(!crashed.release().unwrap());
        assert!(b.is_held_by(&reclaimed).unwrap());
    }

    #[test]
    fn test_report_policy_surfaces_stale_lock() {
        let (_dir, volume, clock) = setup();
        let a = coordinator(&volume, "app/0", &clock, StalePolicy::Report);
        let b = coordinator(&volume, "app/1", &clock, StalePolicy::Report);

        let _crashed = a.try_acquire().unwrap();
        clock.advance(Duration::from_secs(900));

        match b.try_acquire() {
            Err(Error::StaleLock {
                holder, age_secs, ..
            }) => {
                assert_eq!(holder, "app/0");
                assert_eq!(age_secs, 900);
            }
            other => panic!("expected StaleLock, got {:?}", other),
        }

        let handle = b.reclaim_stale().unwrap();
        assert_eq!(handle.holder_id(), "app/1");
    }

    #[test]
    fn test_unparseable_lock_is_held_by_unknown() {
        let (_dir, volume, clock) = setup();
        fs::write(volume.lock_file_path(), b"garbage").unwrap();
        let lock = coordinator(&volume, "app/1", &clock, StalePolicy::Reclaim);

        let info = lock.inspect().unwrap().unwrap();
        assert_eq!(info.holder_id, UNKNOWN_HOLDER);
        assert!(matches!(
            lock.try_acquire(),
            Err(Error::LockAcquire { holder, .. }) if holder == UNKNOWN_HOLDER
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_release() {
        let (_dir, volume, clock) = setup();
        let a = coordinator(&volume, "app/0", &clock, StalePolicy::Reclaim);
        let b = coordinator(&volume, "app/1", &clock, StalePolicy::Reclaim);

        let held = a.try_acquire().unwrap();
        let waiter = tokio::spawn(async move { b.acquire(Duration::from_secs(10)).await });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        drop(held);

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.holder_id(), "app/1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let (_dir, volume, clock) = setup();
        let a = coordinator(&volume, "app/0", &clock, StalePolicy::Reclaim);
        let b = coordinator(&volume, "app/1", &clock, StalePolicy::Reclaim);

        let _held = a.try_acquire().unwrap();
        let started = tokio::time::Instant::now();
        let err = b.acquire(Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, Error::LockAcquire { .. }));
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_lock_info_staleness_boundary() {
        let now = Utc::now();
        let info = LockInfo {
            holder_id: "app/0".into(),
            acquired_at: now - chrono::Duration::seconds(600),
            fencing_token: 1,
        };
        assert!(!info.is_stale(now, Duration::from_secs(600)));
        assert!(info.is_stale(now + chrono::Duration::seconds(1), Duration::from_secs(600)));
    }
}
