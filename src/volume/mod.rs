//! Shared volume primitives
//!
//! Everything that touches the mounted directory lives here:
//! - Volume layout and filesystem identity
//! - Download lock (create-exclusive file, fencing token, stale reclaim)
//! - Progress and installed-version markers
//! - Checksum manifest of the installed binaries

pub mod lock;
pub mod manifest;
pub mod progress;
pub mod shared;

pub use lock::{LockCoordinator, LockHandle, LockInfo};
pub use manifest::ChecksumManifest;
pub use progress::{ProgressMarker, ProgressTracker};
pub use shared::SharedVolume;
