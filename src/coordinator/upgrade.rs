//! Rolling-upgrade protocol over the coordination store
//!
//! The leader walks the phase cycle `Idle → Prepare → Downloading → Complete
//! → Idle`, writing each step into application data. Followers acknowledge
//! `Prepare` by stopping their service and setting `upgrade-ready`, and
//! restart once they see `Complete`.
//!
//! If the leader stops waiting for acknowledgments (timeout), it proceeds
//! anyway. A follower that missed a step catches up in [`observe`]: it
//! accepts `Prepare → Complete`, and a return to `Idle` while it is still
//! acknowledged makes it verify what is installed and start its service.
//!
//! [`observe`]: UpgradeCoordinator::observe

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::common::retry::{Clock, RetryPolicy, SystemClock};
use crate::common::store::CoordinationStore;
use crate::common::{Config, Error, Result, ServiceConfig, UpgradeConfig};
use crate::coordinator::roles::{FollowerOperations, LeaderOperations};
use crate::coordinator::state::{
    UpgradeCoordinationState, UpgradePhase, WorkerAcknowledgment, ACK_KEYS, STATE_KEYS,
    WORKER_READY_COUNT_KEY,
};
use crate::coordinator::storage::{DownloadRequest, DownloadResult, StorageCoordinator};
use crate::ops::ServiceManager;

/// Timeouts for [`UpgradeCoordinator::run_upgrade`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeOptions {
    pub workers_ready_timeout: Duration,
    pub workers_restarted_timeout: Duration,
    pub lock_timeout: Duration,
    /// Restart the leader's own service before signalling Complete
    pub restart_local_service: bool,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self::from(&UpgradeConfig::default())
    }
}

impl From<&UpgradeConfig> for UpgradeOptions {
    fn from(config: &UpgradeConfig) -> Self {
        Self {
            workers_ready_timeout: Duration::from_secs(config.workers_ready_timeout_secs),
            workers_restarted_timeout: Duration::from_secs(config.workers_restarted_timeout_secs),
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
            restart_local_service: true,
        }
    }
}

pub struct UpgradeCoordinator {
    storage: Arc<StorageCoordinator>,
    store: Arc<dyn CoordinationStore>,
    services: Arc<dyn ServiceManager>,
    service: ServiceConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    /// Last phase this follower acted on
    last_seen: Mutex<Option<UpgradePhase>>,
}

impl UpgradeCoordinator {
    pub fn new(
        storage: Arc<StorageCoordinator>,
        store: Arc<dyn CoordinationStore>,
        services: Arc<dyn ServiceManager>,
    ) -> Self {
        Self {
            storage,
            store,
            services,
            service: ServiceConfig::default(),
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            last_seen: Mutex::new(None),
        }
    }

    pub fn from_config(
        config: &Config,
        storage: Arc<StorageCoordinator>,
        store: Arc<dyn CoordinationStore>,
        services: Arc<dyn ServiceManager>,
    ) -> Self {
        Self::new(storage, store, services)
            .with_service(config.service.clone())
            .with_retry_policy(config.poll.retry_policy())
    }

    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn storage(&self) -> &StorageCoordinator {
        &self.storage
    }

    pub fn is_leader(&self) -> bool {
        self.storage.is_leader()
    }

    /// This coordinator as a leader, or `Permission` on a follower
    pub fn as_leader(&self) -> Result<&dyn LeaderOperations> {
        self.ensure_leader("leader operations")?;
        Ok(self)
    }

    /// This coordinator as a follower, or `Permission` on the leader
    pub fn as_follower(&self) -> Result<&dyn FollowerOperations> {
        self.ensure_follower("follower operations")?;
        Ok(self)
    }

    /// Current state as seen through the store; any peer
    pub fn get_upgrade_state(&self) -> Result<UpgradeCoordinationState> {
        let bag = self.store.get_application_bag(&STATE_KEYS)?;
        UpgradeCoordinationState::from_bag(&bag)
    }

    /// Units in the relation other than this one
    pub fn expected_worker_count(&self) -> Result<u32> {
        Ok(self.followers()?.len() as u32)
    }

    // === Leader ===

    /// Start a cycle: `Idle → Prepare`
    pub fn initiate_upgrade(&self, target_version: &str, expected_worker_count: u32) -> Result<()> {
        self.ensure_leader("initiate_upgrade")?;

        let current = self.get_upgrade_state()?;
        if current.phase != UpgradePhase::Idle {
            tracing::warn!(
                "Upgrade to {} refused: phase is {} (target {})",
                target_version,
                current.phase,
                current.target_version.as_deref().unwrap_or("none")
            );
            return Err(Error::UpgradeInProgress {
                phase: current.phase.to_string(),
            });
        }

        let state = UpgradeCoordinationState::prepare(
            target_version,
            &self.storage.identity().unit_name,
            expected_worker_count,
            self.clock.now(),
        );
        self.store.set_application_bag(&state.to_bag())?;
        tracing::info!(
            "Upgrade to {} initiated, expecting {} workers",
            target_version,
            expected_worker_count
        );
        Ok(())
    }

    /// Wait until every expected follower acknowledged this cycle's Prepare.
    ///
    /// Returns `false` on timeout; the caller decides whether to proceed.
    pub async fn wait_for_workers_ready(&self, timeout: Duration) -> Result<bool> {
        self.ensure_leader("wait_for_workers_ready")?;

        let state = self.get_upgrade_state()?;
        let expected = state.expected_worker_count;
        let mut published = state.worker_ready_count;
        let mut poller = self.retry.poller(Some(timeout));

        loop {
            match self.ready_workers(&state) {
                Ok(ready) => {
                    let count = ready.len() as u32;
                    if count != published {
                        match self
                            .store
                            .set_application_data(WORKER_READY_COUNT_KEY, &count.to_string())
                        {
                            Ok(()) => published = count,
                            Err(e) => tracing::warn!("Cannot publish ready count: {}", e),
                        }
                    }
                    if count >= expected {
                        tracing::info!("{}/{} workers ready", count, expected);
                        return Ok(true);
                    }
                    tracing::debug!("Waiting on workers: {}/{} ready {:?}", count, expected, ready);
                }
                Err(e) => tracing::warn!("Cannot read acknowledgments, will retry: {}", e),
            }

            if !poller.wait().await {
                tracing::warn!(
                    "Only {}/{} workers ready after {:?}",
                    published,
                    expected,
                    poller.elapsed()
                );
                return Ok(false);
            }
        }
    }

    /// `Prepare → Downloading`
    pub fn mark_download_phase(&self) -> Result<()> {
        self.transition("mark_download_phase", UpgradePhase::Downloading)
    }

    /// `Downloading → Complete`
    pub fn complete_upgrade(&self) -> Result<()> {
        self.transition("complete_upgrade", UpgradePhase::Complete)
    }

    /// `Complete → Idle`
    pub fn reset_upgrade_state(&self) -> Result<()> {
        self.transition("reset_upgrade_state", UpgradePhase::Idle)
    }

    /// Force `Idle` from any phase
    pub fn abort_upgrade(&self) -> Result<()> {
        self.ensure_leader("abort_upgrade")?;
        let state = self.get_upgrade_state()?;
        if state.phase == UpgradePhase::Idle {
            return Ok(());
        }
        tracing::warn!(
            "Aborting upgrade to {} in phase {}",
            state.target_version.as_deref().unwrap_or("none"),
            state.phase
        );
        let idle = state.with_phase(UpgradePhase::Idle, self.clock.now());
        self.store.set_application_bag(&idle.to_bag())
    }

    /// Wait until no follower is still acknowledged (best effort)
    pub async fn wait_for_workers_restarted(&self, timeout: Duration) -> Result<bool> {
        self.ensure_leader("wait_for_workers_restarted")?;

        let mut poller = self.retry.poller(Some(timeout));
        loop {
            match self.pending_workers() {
                Ok(pending) if pending.is_empty() => return Ok(true),
                Ok(pending) => tracing::debug!("Waiting on {:?} to restart", pending),
                Err(e) => tracing::warn!("Cannot read acknowledgments, will retry: {}", e),
            }
            if !poller.wait().await {
                tracing::warn!("Workers still restarting after {:?}", poller.elapsed());
                return Ok(false);
            }
        }
    }

    /// Drive a whole cycle: prepare, wait, install, complete, reset
    pub async fn run_upgrade(
        &self,
        request: &DownloadRequest,
        options: &UpgradeOptions,
    ) -> Result<DownloadResult> {
        self.ensure_leader("run_upgrade")?;

        let expected = self.expected_worker_count()?;
        self.initiate_upgrade(&request.version, expected)?;

        if !self.wait_for_workers_ready(options.workers_ready_timeout).await? {
            tracing::warn!("Proceeding with upgrade to {} without all workers", request.version);
        }
        self.mark_download_phase()?;

        let result = match self
            .storage
            .install_binaries(request, options.lock_timeout)
            .await
            .and_then(DownloadResult::into_result)
        {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Upgrade to {} failed: {}", request.version, e);
                if let Err(abort_err) = self.abort_upgrade() {
                    tracing::error!("Cannot abort upgrade to {}: {}", request.version, abort_err);
                }
                return Err(e);
            }
        };

        // binaries are in place: the cycle runs to Idle even if our own restart fails
        let restart = if options.restart_local_service {
            self.services
                .restart(&self.service.name, self.service.timeout())
                .await
        } else {
            Ok(())
        };
        if let Err(e) = &restart {
            tracing::error!(
                "Restarting {} on {} failed, completing the cycle anyway: {}",
                self.service.name,
                request.version,
                e
            );
        }

        if let Err(e) = self.complete_upgrade() {
            tracing::error!("Cannot complete upgrade to {}: {}", request.version, e);
            if let Err(abort_err) = self.abort_upgrade() {
                tracing::error!("Cannot abort upgrade to {}: {}", request.version, abort_err);
            }
            return Err(e);
        }

        if !self
            .wait_for_workers_restarted(options.workers_restarted_timeout)
            .await?
        {
            tracing::warn!("Resetting upgrade state before all workers restarted");
        }
        self.reset_upgrade_state()?;
        restart.map(|()| result)
    }

    fn transition(&self, operation: &'static str, to: UpgradePhase) -> Result<()> {
        self.ensure_leader(operation)?;

        let state = self.get_upgrade_state()?;
        if !state.phase.can_transition_to(to) {
            tracing::warn!("{}: refusing {} -> {}", operation, state.phase, to);
            return Err(Error::ProtocolViolation {
                from: state.phase.to_string(),
                to: to.to_string(),
            });
        }

        let next = state.with_phase(to, self.clock.now());
        self.store.set_application_bag(&next.to_bag())?;
        tracing::info!(
            "Upgrade to {}: {} -> {}",
            next.target_version.as_deref().unwrap_or("none"),
            state.phase,
            to
        );
        Ok(())
    }

    fn followers(&self) -> Result<Vec<String>> {
        let local = self.store.local_unit().to_string();
        Ok(self
            .store
            .get_all_units()?
            .into_iter()
            .filter(|unit| *unit != local)
            .collect())
    }

    fn acknowledgment(&self, unit: &str) -> Result<WorkerAcknowledgment> {
        let bag = self.store.get_unit_bag(unit, &ACK_KEYS)?;
        WorkerAcknowledgment::from_bag(unit, &bag)
    }

    /// Followers whose acknowledgment belongs to this cycle
    fn ready_workers(&self, state: &UpgradeCoordinationState) -> Result<Vec<String>> {
        let mut ready = Vec::new();
        for unit in self.followers()? {
            match self.acknowledgment(&unit) {
                Ok(ack) if ack.is_ready_for(state) => ready.push(unit),
                Ok(_) => {}
                Err(e) => tracing::warn!("Ignoring malformed acknowledgment from {}: {}", unit, e),
            }
        }
        Ok(ready)
    }

    /// Followers still flagged `upgrade-ready`
    fn pending_workers(&self) -> Result<Vec<String>> {
        let mut pending = Vec::new();
        for unit in self.followers()? {
            if self.acknowledgment(&unit).is_ok_and(|ack| ack.upgrade_ready) {
                pending.push(unit);
            }
        }
        Ok(pending)
    }

    // === Follower ===

    /// Stop the local service and acknowledge; safe to repeat
    pub async fn handle_prepare_signal(&self) -> Result<()> {
        self.ensure_follower("handle_prepare_signal")?;

        let cycle = self.get_upgrade_state()?.cycle_id();
        self.services
            .stop(&self.service.name, self.service.timeout())
            .await?;
        self.acknowledge(true, cycle)?;
        tracing::info!("{} ready for upgrade", self.storage.identity());
        Ok(())
    }

    /// Verify the new binaries, start the service and clear the acknowledgment
    pub async fn handle_complete_signal(&self) -> Result<()> {
        self.ensure_follower("handle_complete_signal")?;

        let state = self.get_upgrade_state()?;
        let version = match state.target_version {
            Some(version) => version,
            None => self.storage.get_installed_version()?.ok_or_else(|| {
                Error::BinaryValidation("no target version and nothing installed".into())
            })?,
        };
        self.restart_on(&version).await
    }

    /// Reconcile with the leader's current phase.
    ///
    /// Returns the phase acted upon, `None` when nothing changed or the
    /// observed transition was invalid (logged and ignored).
    pub async fn observe(&self) -> Result<Option<UpgradePhase>> {
        self.ensure_follower("observe")?;

        let state = self.get_upgrade_state()?;
        let current = state.phase;
        let previous = match self.last_seen() {
            Some(phase) => phase,
            // fresh process: an outstanding acknowledgment means we were mid-cycle
            None if self.acknowledgment(self.store.local_unit())?.upgrade_ready => {
                UpgradePhase::Prepare
            }
            None => UpgradePhase::Idle,
        };

        if previous == current {
            if current == UpgradePhase::Prepare
                && !self
                    .acknowledgment(self.store.local_unit())?
                    .is_ready_for(&state)
            {
                // a new cycle started between two polls
                self.handle_prepare_signal().await?;
                self.set_last_seen(current);
                return Ok(Some(current));
            }
            self.set_last_seen(current);
            return Ok(None);
        }

        if current == UpgradePhase::Idle {
            if self.acknowledgment(self.store.local_unit())?.upgrade_ready {
                // the leader finished or aborted while we were stopped
                tracing::warn!(
                    "Upgrade returned to idle from {} while {} was stopped; restarting",
                    previous,
                    self.storage.identity()
                );
                let version = self.storage.get_installed_version()?.ok_or_else(|| {
                    Error::BinaryValidation("no installed version to restart on".into())
                })?;
                self.restart_on(&version).await?;
            }
            self.set_last_seen(current);
            return Ok(Some(current));
        }

        if !previous.is_valid_observation(current) {
            tracing::warn!(
                "Ignoring invalid upgrade transition {} -> {} (target {})",
                previous,
                current,
                state.target_version.as_deref().unwrap_or("none")
            );
            return Ok(None);
        }

        match current {
            UpgradePhase::Prepare => self.handle_prepare_signal().await?,
            UpgradePhase::Complete => self.handle_complete_signal().await?,
            UpgradePhase::Downloading | UpgradePhase::Idle => {}
        }
        self.set_last_seen(current);
        Ok(Some(current))
    }

    async fn restart_on(&self, version: &str) -> Result<()> {
        if let Some(reason) = self.storage.verification_failure(version)? {
            tracing::error!("Refusing to start on {}: {}", version, reason);
            return Err(Error::BinaryValidation(format!("{}: {}", version, reason)));
        }

        self.services
            .start(&self.service.name, self.service.timeout())
            .await?;
        self.acknowledge(false, None)?;
        tracing::info!("{} running {}", self.storage.identity(), version);
        Ok(())
    }

    fn acknowledge(&self, ready: bool, cycle: Option<String>) -> Result<()> {
        let ack =
            WorkerAcknowledgment::new(self.store.local_unit(), ready, cycle, self.clock.now());
        self.store.set_unit_bag(&ack.to_bag())
    }

    fn last_seen(&self) -> Option<UpgradePhase> {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_last_seen(&self, phase: UpgradePhase) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Some(phase);
    }

    fn ensure_leader(&self, operation: &'static str) -> Result<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(Error::leader_only(operation))
        }
    }

    fn ensure_follower(&self, operation: &'static str) -> Result<()> {
        if self.is_leader() {
            Err(Error::follower_only(operation))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for UpgradeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeCoordinator")
            .field("storage", &self.storage)
            .field("service", &self.service.name)
            .field("last_seen", &self.last_seen())
            .finish()
    }
}

#[async_trait]
impl LeaderOperations for UpgradeCoordinator {
    fn initiate_upgrade(&self, target_version: &str, expected_worker_count: u32) -> Result<()> {
        UpgradeCoordinator::initiate_upgrade(self, target_version, expected_worker_count)
    }

    async fn wait_for_workers_ready(&self, timeout: Duration) -> Result<bool> {
        UpgradeCoordinator::wait_for_workers_ready(self, timeout).await
    }

    fn mark_download_phase(&self) -> Result<()> {
        UpgradeCoordinator::mark_download_phase(self)
    }

    fn complete_upgrade(&self) -> Result<()> {
        UpgradeCoordinator::complete_upgrade(self)
    }

    fn reset_upgrade_state(&self) -> Result<()> {
        UpgradeCoordinator::reset_upgrade_state(self)
    }

    fn abort_upgrade(&self) -> Result<()> {
        UpgradeCoordinator::abort_upgrade(self)
    }

    async fn wait_for_workers_restarted(&self, timeout: Duration) -> Result<bool> {
        UpgradeCoordinator::wait_for_workers_restarted(self, timeout).await
    }

    fn get_upgrade_state(&self) -> Result<UpgradeCoordinationState> {
        UpgradeCoordinator::get_upgrade_state(self)
    }
}

#[async_trait]
impl FollowerOperations for UpgradeCoordinator {
    async fn handle_prepare_signal(&self) -> Result<()> {
        UpgradeCoordinator::handle_prepare_signal(self).await
    }

    async fn handle_complete_signal(&self) -> Result<()> {
        UpgradeCoordinator::handle_complete_signal(self).await
    }

    async fn observe(&self) -> Result<Option<UpgradePhase>> {
        UpgradeCoordinator::observe(self).await
    }

    fn get_upgrade_state(&self) -> Result<UpgradeCoordinationState> {
        UpgradeCoordinator::get_upgrade_state(self)
    }
}
