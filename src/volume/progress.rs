//! Download progress and installed-version markers
//!
//! The version marker is the only fact followers trust. The progress marker
//! is an observability signal: it says a download started and when, nothing
//! more.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::retry::Clock;
use crate::common::utils::{read_optional, remove_if_exists, write_atomic};
use crate::common::Result;
use crate::volume::shared::SharedVolume;

/// Contents of `.download_in_progress`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMarker {
    pub version: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    progress_path: PathBuf,
    version_path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl ProgressTracker {
    pub fn new(volume: &SharedVolume, clock: Arc<dyn Clock>) -> Self {
        Self {
            progress_path: volume.progress_marker_path(),
            version_path: volume.version_marker_path(),
            clock,
        }
    }

    /// Record that a download of `version` has started
    pub fn mark_started(&self, version: &str) -> Result<()> {
        let marker = ProgressMarker {
            version: version.to_string(),
            started_at: self.clock.now(),
        };
        write_atomic(&self.progress_path, &serde_json::to_vec(&marker)?)?;
        tracing::info!("Download of {} started", version);
        Ok(())
    }

    /// Publish `version` as installed and drop the progress marker.
    ///
    /// The version marker is renamed into place first, so at every instant
    /// at least one of the two markers exists.
    pub fn mark_complete(&self, version: &str) -> Result<()> {
        write_atomic(&self.version_path, format!("{}\n", version).as_bytes())?;
        remove_if_exists(&self.progress_path)?;
        tracing::info!("Version {} installed", version);
        Ok(())
    }

    /// Remove the progress marker after a failed download
    pub fn clear(&self) -> Result<bool> {
        let removed = remove_if_exists(&self.progress_path)?;
        if removed {
            tracing::debug!("Cleared progress marker {:?}", self.progress_path);
        }
        Ok(removed)
    }

    pub fn is_in_progress(&self) -> bool {
        self.progress_path.exists()
    }

    /// Current progress marker, if a download is underway
    pub fn progress(&self) -> Result<Option<ProgressMarker>> {
        let Some(body) = read_optional(&self.progress_path)? else {
            return Ok(None);
        };
        if let Ok(marker) = serde_json::from_str::<ProgressMarker>(&body) {
            return Ok(Some(marker));
        }

        // plain-text marker (or one caught mid-write): version only, aged by mtime
        let started_at = fs::metadata(&self.progress_path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| self.clock.now());
        Ok(Some(ProgressMarker {
            version: body.trim().to_string(),
            started_at,
        }))
    }

    /// Seconds since the current download started
    pub fn age_seconds(&self) -> Option<f64> {
        match self.progress() {
            Ok(Some(marker)) => {
                let age = self.clock.now() - marker.started_at;
                Some(age.num_milliseconds().max(0) as f64 / 1000.0)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!("Cannot read progress marker: {}", e);
                None
            }
        }
    }

    pub fn in_progress_version(&self) -> Result<Option<String>> {
        Ok(self
            .progress()?
            .map(|m| m.version)
            .filter(|v| !v.is_empty()))
    }

    /// Version named by the version marker
    pub fn installed_version(&self) -> Result<Option<String>> {
        Ok(read_optional(&self.version_path)?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }
}
