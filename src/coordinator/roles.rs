//! Leader and follower capabilities of the upgrade protocol

use std::time::Duration;

use async_trait::async_trait;

use crate::common::Result;
use crate::coordinator::state::{UpgradeCoordinationState, UpgradePhase};

/// Operations that drive an upgrade cycle
#[async_trait]
pub trait LeaderOperations: Send + Sync {
    fn initiate_upgrade(&self, target_version: &str, expected_worker_count: u32) -> Result<()>;

    async fn wait_for_workers_ready(&self, timeout: Duration) -> Result<bool>;

    fn mark_download_phase(&self) -> Result<()>;

    fn complete_upgrade(&self) -> Result<()>;

    fn reset_upgrade_state(&self) -> Result<()>;

    fn abort_upgrade(&self) -> Result<()>;

    async fn wait_for_workers_restarted(&self, timeout: Duration) -> Result<bool>;

    fn get_upgrade_state(&self) -> Result<UpgradeCoordinationState>;
}

/// Operations that react to the leader's phase changes
#[async_trait]
pub trait FollowerOperations: Send + Sync {
    async fn handle_prepare_signal(&self) -> Result<()>;

    async fn handle_complete_signal(&self) -> Result<()>;

    /// Read the phase and run whichever handler it calls for
    async fn observe(&self) -> Result<Option<UpgradePhase>>;

    fn get_upgrade_state(&self) -> Result<UpgradeCoordinationState>;
}
