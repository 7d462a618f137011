//! # fleetsync
//!
//! Leader/follower binary distribution and rolling-upgrade coordination for
//! a fleet of peers sharing one mounted volume:
//! - One leader downloads and installs a versioned artifact under a file lock
//! - Followers wait on the installed-version marker, never on the lock
//! - Stale locks (crashed leaders) are reclaimed with a fencing token
//! - Upgrades walk `Idle → Prepare → Downloading → Complete → Idle` through an
//!   eventually consistent coordination store
//!
//! ## Architecture
//!
//! ```text
//!            coordination store (unit + application data)
//!        ┌──────────────────────┬──────────────────────────┐
//!        │ upgrade-phase, ...   │ upgrade-ready, timestamp │
//! ┌──────▼──────┐        ┌──────▼──────┐           ┌───────▼─────┐
//! │   Leader    │        │  Follower   │    ...    │  Follower   │
//! │ lock + bin/ │        │  waits on   │           │  waits on   │
//! └──────┬──────┘        │  marker     │           │  marker     │
//!        │               └──────┬──────┘           └──────┬──────┘
//!   ┌────▼──────────────────────▼─────────────────────────▼────┐
//!   │ shared volume: .lock  .download_in_progress  bin/  ...   │
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Leader installs a release
//! ```bash
//! fleetsync --unit app/0 --root /srv/shared --leader install 7.14.3 \
//!   --url https://example.com/app-7.14.3.tgz \
//!   --checksum-url https://example.com/app-7.14.3.tgz.sha256
//! ```
//!
//! ### Followers wait for it
//! ```bash
//! fleetsync --unit app/1 --root /srv/shared wait 7.14.3 --timeout 10m
//! ```
//!
//! ### Rolling upgrade
//! ```bash
//! fleetsync --config leader.toml upgrade 7.15.0 --url ...   # leader
//! fleetsync --config worker.toml observe --follow          # followers
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod coordinator;
pub mod ops;
pub mod volume;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{StorageCoordinator, UpgradeCoordinator, UpgradePhase};
pub use volume::SharedVolume;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
