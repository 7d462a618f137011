//! Leader/follower coordination
//!
//! - Binary distribution: lock, install, rendezvous on the version marker
//! - Upgrade protocol: phase state machine propagated through the
//!   coordination store

pub mod roles;
pub mod state;
pub mod storage;
pub mod upgrade;

pub use roles::{FollowerOperations, LeaderOperations};
pub use state::{UpgradeCoordinationState, UpgradePhase, WorkerAcknowledgment};
pub use storage::{DownloadLock, DownloadRequest, DownloadResult, DownloadStatus, StorageCoordinator};
pub use upgrade::{UpgradeCoordinator, UpgradeOptions};
