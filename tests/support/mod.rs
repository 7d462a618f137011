//! Fakes and fixtures shared by the integration tests

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetsync::common::{
    Error, FilesystemIdSource, Identity, ManualClock, Result, RetryPolicy, RoleProvider,
    StaticRole,
};
use fleetsync::coordinator::StorageCoordinator;
use fleetsync::ops::{Downloader, ServiceManager};
use fleetsync::volume::SharedVolume;

pub const BINARY: &str = "app";

/// Downloader that writes a fixed file set instead of touching the network
#[derive(Debug, Default)]
pub struct FakeDownloader {
    calls: AtomicUsize,
    fail: AtomicBool,
    urls: Mutex<Vec<String>>,
}

impl FakeDownloader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let downloader = Self::default();
        downloader.fail.store(true, Ordering::SeqCst);
        Arc::new(downloader)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn fetch(&self, url: &str, _checksum_url: Option<&str>, target_dir: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        // leave a partial file behind, like a transfer cut short
        fs::write(target_dir.join("partial"), b"half")?;
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Download(format!("connection reset fetching {}", url)));
        }

        fs::remove_file(target_dir.join("partial"))?;
        write_executable(&target_dir.join(BINARY), url.as_bytes());
        fs::write(target_dir.join("README"), b"release notes")?;
        Ok(())
    }
}

pub fn write_executable(path: &Path, contents: &[u8]) {
    fs::write(path, contents).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

/// Service manager that records what it was asked to do
#[derive(Debug, Default)]
pub struct RecordingServiceManager {
    events: Mutex<Vec<String>>,
    active: AtomicBool,
    fail_start: AtomicBool,
    fail_restart: AtomicBool,
}

impl RecordingServiceManager {
    pub fn running() -> Arc<Self> {
        let manager = Self::default();
        manager.active.store(true, Ordering::SeqCst);
        Arc::new(manager)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_restart(&self, fail: bool) {
        self.fail_restart.store(fail, Ordering::SeqCst);
    }

    fn record(&self, event: &str, service: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{} {}", event, service));
    }
}

#[async_trait]
impl ServiceManager for RecordingServiceManager {
    async fn stop(&self, service: &str, _timeout: Duration) -> Result<()> {
        self.record("stop", service);
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, service: &str, _timeout: Duration) -> Result<()> {
        self.record("start", service);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::ServiceManagement {
                service: service.to_string(),
                reason: "unit failed to start".into(),
            });
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self, service: &str, _timeout: Duration) -> Result<()> {
        self.record("restart", service);
        if self.fail_restart.load(Ordering::SeqCst) {
            self.active.store(false, Ordering::SeqCst);
            return Err(Error::ServiceManagement {
                service: service.to_string(),
                reason: "unit failed to restart".into(),
            });
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_active(&self, _service: &str) -> Result<bool> {
        Ok(self.active.load(Ordering::SeqCst))
    }
}

/// A peer's storage coordinator on `root`, polling every second
pub fn peer(
    root: &Path,
    unit: &str,
    leader: bool,
    clock: &Arc<ManualClock>,
    downloader: Arc<dyn Downloader>,
) -> Arc<StorageCoordinator> {
    let role: Arc<dyn RoleProvider> = Arc::new(StaticRole::new(leader));
    peer_with_role(root, unit, role, clock, downloader)
}

pub fn peer_with_role(
    root: &Path,
    unit: &str,
    role: Arc<dyn RoleProvider>,
    clock: &Arc<ManualClock>,
    downloader: Arc<dyn Downloader>,
) -> Arc<StorageCoordinator> {
    let volume = SharedVolume::open(root, FilesystemIdSource::Marker).unwrap();
    volume.prepare().unwrap();
    Arc::new(
        StorageCoordinator::new(volume, Identity::from_unit(unit), role, downloader)
            .with_clock(clock.clone())
            .with_retry_policy(RetryPolicy::new(Duration::from_secs(1)))
            .with_required_binaries(vec![BINARY.to_string()]),
    )
}
