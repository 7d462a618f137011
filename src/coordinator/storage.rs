//! Role-aware façade over the shared volume
//!
//! The leader takes the download lock, installs an artifact and publishes
//! the version marker. Followers wait for that marker and never write to the
//! volume outside their own worker directory.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::common::identity::{Identity, RoleProvider};
use crate::common::retry::{timeout_or_forever, Clock, RetryPolicy, SystemClock};
use crate::common::utils::temp_sibling;
use crate::common::{Config, Error, LockConfig, Result};
use crate::ops::Downloader;
use crate::volume::{ChecksumManifest, LockCoordinator, LockHandle, ProgressTracker, SharedVolume};

/// What to install and from where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub version: String,
    pub download_url: String,
    pub checksum_url: Option<String>,
    /// Defaults to the volume's `bin/`
    pub target_directory: Option<PathBuf>,
}

impl DownloadRequest {
    pub fn new(version: impl Into<String>, download_url: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            download_url: download_url.into(),
            checksum_url: None,
            target_directory: None,
        }
    }

    pub fn with_checksum_url(mut self, checksum_url: impl Into<String>) -> Self {
        self.checksum_url = Some(checksum_url.into());
        self
    }

    pub fn with_target_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.target_directory = Some(dir.into());
        self
    }
}

/// Outcome of [`StorageCoordinator::download_binaries`]
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadResult {
    pub success: bool,
    pub version: String,
    pub installed_path: PathBuf,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
}

impl DownloadResult {
    /// Turn a failed result into `Error::Download`
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::Download(self.error_message.unwrap_or_else(|| {
                format!("download of {} failed", self.version)
            })))
        }
    }
}

/// What the progress marker says about the volume right now
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadStatus {
    Idle,
    InProgress { version: String, age_seconds: f64 },
    /// Marker older than the stale threshold with no live lock behind it
    Stalled { version: String, age_seconds: f64 },
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadStatus::Idle => write!(f, "idle"),
            DownloadStatus::InProgress {
                version,
                age_seconds,
            } => write!(f, "downloading {} for {:.0}s", version, age_seconds),
            DownloadStatus::Stalled {
                version,
                age_seconds,
            } => write!(f, "stalled download of {} ({:.0}s old)", version, age_seconds),
        }
    }
}

/// Held download lock. Released on drop.
#[derive(Debug)]
pub struct DownloadLock {
    handle: LockHandle,
}

impl DownloadLock {
    pub fn holder_id(&self) -> &str {
        self.handle.holder_id()
    }

    pub fn fencing_token(&self) -> u64 {
        self.handle.fencing_token()
    }

    pub fn release(self) -> Result<bool> {
        self.handle.release()
    }
}

pub struct StorageCoordinator {
    volume: SharedVolume,
    identity: Identity,
    role: Arc<dyn RoleProvider>,
    downloader: Arc<dyn Downloader>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    lock_config: LockConfig,
    required_binaries: Vec<String>,
    lock: LockCoordinator,
    progress: ProgressTracker,
}

impl StorageCoordinator {
    pub fn new(
        volume: SharedVolume,
        identity: Identity,
        role: Arc<dyn RoleProvider>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let retry = RetryPolicy::default();
        let lock_config = LockConfig::default();
        Self {
            lock: LockCoordinator::new(
                &volume,
                identity.holder_id.clone(),
                &lock_config,
                retry.clone(),
                clock.clone(),
            ),
            progress: ProgressTracker::new(&volume, clock.clone()),
            volume,
            identity,
            role,
            downloader,
            clock,
            retry,
            lock_config,
            required_binaries: Vec::new(),
        }
    }

    /// Open the configured volume and check it is the expected mount
    pub fn from_config(
        config: &Config,
        role: Arc<dyn RoleProvider>,
        downloader: Arc<dyn Downloader>,
    ) -> Result<Self> {
        let volume = SharedVolume::open(&config.volume.root, config.volume.id_source)?;
        if let Some(expected) = &config.volume.expected_filesystem_id {
            volume.ensure_shared_mount(expected)?;
        }
        if role.is_leader() {
            volume.prepare()?;
        }

        let identity = Identity::new(config.unit_name.clone(), config.holder_id());
        Ok(Self::new(volume, identity, role, downloader)
            .with_lock_config(config.lock.clone())
            .with_retry_policy(config.poll.retry_policy())
            .with_required_binaries(config.volume.required_binaries.clone()))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self.rebuild();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.rebuild();
        self
    }

    pub fn with_lock_config(mut self, lock_config: LockConfig) -> Self {
        self.lock_config = lock_config;
        self.rebuild();
        self
    }

    /// Paths under `bin/` that must exist and be executable
    pub fn with_required_binaries(mut self, required: Vec<String>) -> Self {
        self.required_binaries = required;
        self
    }

    fn rebuild(&mut self) {
        self.lock = LockCoordinator::new(
            &self.volume,
            self.identity.holder_id.clone(),
            &self.lock_config,
            self.retry.clone(),
            self.clock.clone(),
        );
        self.progress = ProgressTracker::new(&self.volume, self.clock.clone());
    }

    pub fn volume(&self) -> &SharedVolume {
        &self.volume
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn lock_coordinator(&self) -> &LockCoordinator {
        &self.lock
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    /// Take the download lock (leader only); zero timeout tries once
    pub async fn acquire_download_lock(&self, timeout: Duration) -> Result<DownloadLock> {
        self.ensure_leader("acquire_download_lock")?;
        let handle = self.lock.acquire(timeout).await?;
        Ok(DownloadLock { handle })
    }

    /// Install `request` while holding `lock` (leader only).
    ///
    /// Transfer, integrity and extraction failures come back as a result with
    /// `success == false`; the progress marker and staging directory are gone
    /// by then. Role and lock-ownership problems are errors.
    pub async fn download_binaries(
        &self,
        lock: &DownloadLock,
        request: &DownloadRequest,
    ) -> Result<DownloadResult> {
        self.ensure_leader("download_binaries")?;
        self.ensure_lock(lock)?;

        let started = Instant::now();
        let target = request
            .target_directory
            .clone()
            .unwrap_or_else(|| self.volume.bin_directory());

        if self.get_installed_version()?.as_deref() == Some(request.version.as_str())
            && self.install_failure(&target, &request.version)?.is_none()
        {
            tracing::info!("Version {} already installed, skipping download", request.version);
            return Ok(DownloadResult {
                success: true,
                version: request.version.clone(),
                installed_path: target,
                duration_seconds: started.elapsed().as_secs_f64(),
                error_message: None,
            });
        }

        self.progress.mark_started(&request.version)?;
        let staging = self.volume.staging_directory();

        let outcome = self.install(lock, request, &staging, &target).await;
        if outcome.is_err() {
            self.clean_up_failed_install(lock, &staging);
        }

        let duration_seconds = started.elapsed().as_secs_f64();
        match outcome {
            Ok(()) => {
                tracing::info!(
                    "Installed {} into {:?} in {:.1}s",
                    request.version,
                    target,
                    duration_seconds
                );
                Ok(DownloadResult {
                    success: true,
                    version: request.version.clone(),
                    installed_path: target,
                    duration_seconds,
                    error_message: None,
                })
            }
            Err(e @ (Error::LockNotHeld { .. } | Error::Permission { .. })) => Err(e),
            Err(e) => {
                tracing::error!("Download of {} failed: {}", request.version, e);
                Ok(DownloadResult {
                    success: false,
                    version: request.version.clone(),
                    installed_path: target,
                    duration_seconds,
                    error_message: Some(e.to_string()),
                })
            }
        }
    }

    /// Acquire the lock, download, and release in one call (leader only)
    pub async fn install_binaries(
        &self,
        request: &DownloadRequest,
        lock_timeout: Duration,
    ) -> Result<DownloadResult> {
        let lock = self.acquire_download_lock(lock_timeout).await?;
        let result = self.download_binaries(&lock, request).await;
        lock.release()?;
        result
    }

    async fn install(
        &self,
        lock: &DownloadLock,
        request: &DownloadRequest,
        staging: &Path,
        target: &Path,
    ) -> Result<()> {
        // leftovers from a holder that lost the lock mid-install
        if staging.exists() {
            fs::remove_dir_all(staging)?;
        }
        fs::create_dir_all(staging)?;
        self.downloader
            .fetch(
                &request.download_url,
                request.checksum_url.as_deref(),
                staging,
            )
            .await?;

        if let Some(reason) = self.executable_failure(staging)? {
            return Err(Error::BinaryValidation(reason));
        }
        ChecksumManifest::build(staging, &request.version)?.write(staging)?;

        // the lock may have been reclaimed while we were downloading
        self.ensure_lock(lock)?;
        swap_directory(staging, target)?;
        self.progress.mark_complete(&request.version)?;
        Ok(())
    }

    /// Undo a failed install's shared state, unless the lock moved on.
    ///
    /// Once another holder owns the lock, the progress marker and staging
    /// directory are theirs.
    fn clean_up_failed_install(&self, lock: &DownloadLock, staging: &Path) {
        match self.lock.is_held_by(&lock.handle) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    "Lock token {} no longer held by {}, leaving progress marker alone",
                    lock.fencing_token(),
                    lock.holder_id()
                );
                return;
            }
            Err(e) => {
                tracing::error!("Cannot check lock ownership, leaving progress marker: {}", e);
                return;
            }
        }

        if let Err(e) = self.progress.clear() {
            tracing::error!("Failed to clear progress marker: {}", e);
        }
        if staging.exists() {
            if let Err(e) = fs::remove_dir_all(staging) {
                tracing::warn!("Failed to remove staging directory {:?}: {}", staging, e);
            }
        }
    }

    /// Version named by the version marker; any peer, no locking
    pub fn get_installed_version(&self) -> Result<Option<String>> {
        self.progress.installed_version()
    }

    /// Poll the version marker until it names `expected` (followers only).
    ///
    /// A zero timeout waits forever. Returns `false` on timeout.
    pub async fn wait_for_binaries(
        &self,
        expected: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<bool> {
        self.ensure_follower("wait_for_binaries")?;

        // the caller's interval is a fixed cadence, not a base for backoff
        let mut poller = RetryPolicy::new(poll_interval).poller(timeout_or_forever(timeout));
        loop {
            match self.get_installed_version() {
                Ok(Some(version)) if version == expected => {
                    tracing::info!(
                        "Binaries {} available after {:?}",
                        expected,
                        poller.elapsed()
                    );
                    return Ok(true);
                }
                Ok(current) => {
                    let status = self.download_status().unwrap_or(DownloadStatus::Idle);
                    let msg = format!(
                        "Waiting on {} (installed: {}, leader: {})",
                        expected,
                        current.as_deref().unwrap_or("none"),
                        status
                    );
                    if poller.attempts() == 0 {
                        tracing::info!("{}", msg);
                    } else {
                        tracing::debug!("{}", msg);
                    }
                }
                Err(e) => tracing::warn!("Cannot read version marker, will retry: {}", e),
            }

            if !poller.wait().await {
                tracing::warn!(
                    "Timed out waiting on {} after {:?}",
                    expected,
                    poller.elapsed()
                );
                return Ok(false);
            }
        }
    }

    /// Whether `bin/` holds a complete, intact install of `version`
    pub fn verify_binaries(&self, version: &str) -> Result<bool> {
        match self.verification_failure(version)? {
            None => Ok(true),
            Some(reason) => {
                tracing::warn!("Binaries {} failed verification: {}", version, reason);
                Ok(false)
            }
        }
    }

    /// Why `verify_binaries(version)` would fail, if it would
    pub fn verification_failure(&self, version: &str) -> Result<Option<String>> {
        match self.get_installed_version()? {
            Some(installed) if installed == version => {}
            Some(installed) => {
                return Ok(Some(format!(
                    "version marker names {}, not {}",
                    installed, version
                )))
            }
            None => return Ok(Some("no version marker".to_string())),
        }
        self.install_failure(&self.volume.bin_directory(), version)
    }

    fn install_failure(&self, dir: &Path, version: &str) -> Result<Option<String>> {
        if !dir.is_dir() {
            return Ok(Some(format!("{} is missing", dir.display())));
        }
        if let Some(reason) = self.executable_failure(dir)? {
            return Ok(Some(reason));
        }

        let manifest = match ChecksumManifest::load(dir) {
            Ok(manifest) => manifest,
            Err(Error::Serialization(e)) => return Ok(Some(format!("unreadable manifest: {}", e))),
            Err(e) => return Err(e),
        };
        let Some(manifest) = manifest else {
            return Ok(None);
        };
        if manifest.version != version {
            return Ok(Some(format!(
                "manifest is for {}, marker says {}",
                manifest.version, version
            )));
        }
        match manifest.verify(dir) {
            Ok(()) => Ok(None),
            Err(e @ (Error::ChecksumMismatch { .. } | Error::BinaryValidation(_))) => {
                Ok(Some(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn executable_failure(&self, dir: &Path) -> Result<Option<String>> {
        if self.required_binaries.is_empty() {
            for entry in fs::read_dir(dir)? {
                if is_executable(&entry?.path()) {
                    return Ok(None);
                }
            }
            return Ok(Some(format!("no executable in {}", dir.display())));
        }

        for name in &self.required_binaries {
            let path = dir.join(name);
            if !path.is_file() {
                return Ok(Some(format!("{} is missing", name)));
            }
            if !is_executable(&path) {
                return Ok(Some(format!("{} is not executable", name)));
            }
        }
        Ok(None)
    }

    /// Private directory for a follower; existing directories are fine
    pub fn create_worker_directory(&self, unit_name: &str) -> Result<PathBuf> {
        let dir = self.volume.worker_directory(unit_name);
        fs::create_dir_all(&dir)?;
        tracing::debug!("Worker directory for {} at {:?}", unit_name, dir);
        Ok(dir)
    }

    pub fn download_status(&self) -> Result<DownloadStatus> {
        let Some(marker) = self.progress.progress()? else {
            return Ok(DownloadStatus::Idle);
        };
        let age_seconds = self.progress.age_seconds().unwrap_or(0.0);

        let stalled = age_seconds > self.lock_config.stale_after().as_secs_f64()
            && !self.lock.is_locked()?;
        Ok(if stalled {
            DownloadStatus::Stalled {
                version: marker.version,
                age_seconds,
            }
        } else {
            DownloadStatus::InProgress {
                version: marker.version,
                age_seconds,
            }
        })
    }

    fn ensure_lock(&self, lock: &DownloadLock) -> Result<()> {
        if self.lock.is_held_by(&lock.handle)? {
            Ok(())
        } else {
            Err(Error::LockNotHeld {
                holder: lock.holder_id().to_string(),
                token: lock.fencing_token(),
            })
        }
    }

    fn ensure_leader(&self, operation: &'static str) -> Result<()> {
        if self.is_leader() {
            Ok(())
        } else {
            tracing::error!("{} called on follower {}", operation, self.identity);
            Err(Error::leader_only(operation))
        }
    }

    fn ensure_follower(&self, operation: &'static str) -> Result<()> {
        if self.is_leader() {
            tracing::error!("{} called on leader {}", operation, self.identity);
            Err(Error::follower_only(operation))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for StorageCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCoordinator")
            .field("volume", &self.volume)
            .field("identity", &self.identity)
            .field("leader", &self.is_leader())
            .finish()
    }
}

/// Replace `target` with `staging` using renames on the same filesystem
fn swap_directory(staging: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let previous = temp_sibling(target);
    let had_previous = match fs::rename(target, &previous) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = fs::rename(staging, target) {
        if had_previous {
            let _ = fs::rename(&previous, target);
        }
        return Err(e.into());
    }

    if had_previous {
        if let Err(e) = fs::remove_dir_all(&previous) {
            tracing::warn!("Failed to remove previous install {:?}: {}", previous, e);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
