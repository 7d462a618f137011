//! Shared volume layout and identity
//!
//! Layout (relative to the volume root):
//!
//! ```text
//! bin/                    installed artifact
//! .lock                   download lock (holder, timestamp, fencing token)
//! .lock.fence             last fencing token handed out
//! .download_in_progress   progress marker
//! .installed_version      version marker
//! .volume_id              filesystem identity marker
//! .relation/              file-backed coordination store
//! worker/<unit>/          per-follower private directories
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::common::utils::{read_optional, sanitize_unit_name, temp_sibling};
use crate::common::{Error, FilesystemIdSource, Result};

pub const BIN_DIR: &str = "bin";
pub const LOCK_FILE: &str = ".lock";
pub const FENCE_FILE: &str = ".lock.fence";
pub const PROGRESS_MARKER: &str = ".download_in_progress";
pub const VERSION_MARKER: &str = ".installed_version";
pub const VOLUME_ID_FILE: &str = ".volume_id";
pub const RELATION_DIR: &str = ".relation";
pub const WORKER_DIR: &str = "worker";
const STAGING_PREFIX: &str = ".staging-";

/// A mounted directory shared by every peer of the fleet
#[derive(Debug, Clone)]
pub struct SharedVolume {
    root: PathBuf,
    filesystem_id: String,
    id_source: FilesystemIdSource,
}

impl SharedVolume {
    /// Open the volume at `root` and resolve its filesystem id
    pub fn open(root: impl AsRef<Path>, id_source: FilesystemIdSource) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "shared volume path must be absolute: {}",
                root.display()
            )));
        }
        let filesystem_id = filesystem_id(root, id_source)?;
        tracing::debug!("Shared volume {:?} has filesystem id {}", root, filesystem_id);

        Ok(Self {
            root: root.to_path_buf(),
            filesystem_id,
            id_source,
        })
    }

    /// Open the volume and fail unless it carries `expected_id`
    pub fn open_expecting(
        root: impl AsRef<Path>,
        id_source: FilesystemIdSource,
        expected_id: &str,
    ) -> Result<Self> {
        let volume = Self::open(root, id_source)?;
        volume.ensure_shared_mount(expected_id)?;
        Ok(volume)
    }

    /// Create the directory skeleton
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(self.bin_directory())?;
        fs::create_dir_all(self.worker_root())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn filesystem_id(&self) -> &str {
        &self.filesystem_id
    }

    pub fn id_source(&self) -> FilesystemIdSource {
        self.id_source
    }

    pub fn bin_directory(&self) -> PathBuf {
        self.root.join(BIN_DIR)
    }

    pub fn lock_file_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn fence_file_path(&self) -> PathBuf {
        self.root.join(FENCE_FILE)
    }

    pub fn progress_marker_path(&self) -> PathBuf {
        self.root.join(PROGRESS_MARKER)
    }

    pub fn version_marker_path(&self) -> PathBuf {
        self.root.join(VERSION_MARKER)
    }

    pub fn relation_directory(&self) -> PathBuf {
        self.root.join(RELATION_DIR)
    }

    pub fn worker_root(&self) -> PathBuf {
        self.root.join(WORKER_DIR)
    }

    /// Private directory of a follower, e.g. `worker/app-1`
    pub fn worker_directory(&self, unit_name: &str) -> PathBuf {
        self.worker_root().join(sanitize_unit_name(unit_name))
    }

    /// Fresh staging directory path for an install
    pub fn staging_directory(&self) -> PathBuf {
        self.root
            .join(format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4().simple()))
    }

    /// Pure comparison against the id resolved at open time
    pub fn validate_shared_mount(&self, expected_id: &str) -> bool {
        self.filesystem_id == expected_id
    }

    /// Fatal error unless this peer sees `expected_id`
    pub fn ensure_shared_mount(&self, expected_id: &str) -> Result<()> {
        if self.validate_shared_mount(expected_id) {
            Ok(())
        } else {
            Err(Error::FilesystemMismatch {
                path: self.root.display().to_string(),
                expected: expected_id.to_string(),
                actual: self.filesystem_id.clone(),
            })
        }
    }

    /// Whether this peer can write to the volume root
    pub fn is_writable(&self) -> bool {
        is_writable(&self.root)
    }
}

/// Filesystem id of `path`; never falls back to a default
pub fn filesystem_id(path: &Path, source: FilesystemIdSource) -> Result<String> {
    let meta = fs::metadata(path).map_err(|e| Error::FilesystemId {
        path: path.display().to_string(),
        source: e,
    })?;
    if !meta.is_dir() {
        return Err(Error::FilesystemId {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
        });
    }

    match source {
        FilesystemIdSource::Marker => marker_id(path),
        FilesystemIdSource::Device => device_id(&meta, path),
    }
}

/// Compare the id of `path` with `expected_id`
pub fn validate_shared_mount(
    path: &Path,
    expected_id: &str,
    source: FilesystemIdSource,
) -> Result<bool> {
    Ok(filesystem_id(path, source)? == expected_id)
}

/// Probe writability by creating and removing a temp file
pub fn is_writable(path: &Path) -> bool {
    let probe = temp_sibling(&path.join(".write-probe"));
    match OpenOptions::new().write(true).create_new(true).open(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Read `.volume_id`, creating it if this peer is the first to look
fn marker_id(root: &Path) -> Result<String> {
    let marker = root.join(VOLUME_ID_FILE);
    let id_error = |source: std::io::Error| Error::FilesystemId {
        path: marker.display().to_string(),
        source,
    };

    if let Some(id) = read_optional(&marker)? {
        return parse_marker(&marker, &id);
    }

    // Write a complete candidate, then link it into place: the link fails if
    // another peer won, and nobody can observe a half-written marker.
    let candidate = temp_sibling(&marker);
    let id = uuid::Uuid::new_v4().to_string();
    let result = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)?;
        writeln!(file, "{}", id)?;
        file.sync_all()?;
        fs::hard_link(&candidate, &marker)
    })();
    let _ = fs::remove_file(&candidate);

    match result {
        Ok(()) => {
            tracing::info!("Initialised shared volume identity {} at {:?}", id, root);
            Ok(id)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let body = fs::read_to_string(&marker).map_err(id_error)?;
            parse_marker(&marker, &body)
        }
        Err(e) => Err(id_error(e)),
    }
}

fn parse_marker(marker: &Path, body: &str) -> Result<String> {
    let id = body.trim();
    if id.is_empty() {
        return Err(Error::FilesystemId {
            path: marker.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "empty volume id"),
        });
    }
    Ok(id.to_string())
}

#[cfg(unix)]
fn device_id(meta: &fs::Metadata, _path: &Path) -> Result<String> {
    use std::os::unix::fs::MetadataExt;
    Ok(format!("dev-{:x}", meta.dev()))
}

#[cfg(not(unix))]
fn device_id(_meta: &fs::Metadata, path: &Path) -> Result<String> {
    Err(Error::FilesystemId {
        path: path.display().to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "device ids are only available on unix",
        ),
    })
}
