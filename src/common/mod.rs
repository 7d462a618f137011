//! Common utilities and types shared across fleetsync

pub mod config;
pub mod error;
pub mod hash;
pub mod identity;
pub mod retry;
pub mod store;
pub mod utils;

pub use config::{
    Config, FilesystemIdSource, LockConfig, PollConfig, ServiceConfig, StalePolicy, UpgradeConfig,
    VolumeConfig,
};
pub use error::{Error, Result};
pub use hash::{blake3_file, blake3_hash, parse_checksum_file, Blake3Hasher};
pub use identity::{Identity, RoleProvider, StaticRole, SwitchableRole};
pub use retry::{timeout_or_forever, Clock, ManualClock, Poller, RetryPolicy, SystemClock};
pub use store::{CoordinationStore, DataBag, FileStore, MemoryRelation, MemoryStore};
pub use utils::{format_bytes, format_timestamp, parse_duration, parse_timestamp, sanitize_unit_name};
