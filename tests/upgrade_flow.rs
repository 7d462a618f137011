//! Upgrade phase protocol between one leader and two followers

mod support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetsync::common::{
    CoordinationStore, Error, FileStore, ManualClock, MemoryRelation, MemoryStore, Result,
    RetryPolicy, RoleProvider, StaticRole,
};
use fleetsync::coordinator::state::{PHASE_KEY, UPGRADE_READY_KEY};
use fleetsync::coordinator::{DownloadRequest, UpgradeCoordinator, UpgradeOptions, UpgradePhase};
use support::{peer, FakeDownloader, RecordingServiceManager};
use tempfile::TempDir;

const STOP: &str = "stop fleet-worker.service";
const START: &str = "start fleet-worker.service";

struct Node {
    coordinator: UpgradeCoordinator,
    services: Arc<RecordingServiceManager>,
}

struct Fleet {
    dir: TempDir,
    clock: Arc<ManualClock>,
    relation: Arc<MemoryRelation>,
    downloader: Arc<FakeDownloader>,
    leader: Node,
    followers: Vec<Node>,
}

impl Fleet {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let relation = MemoryRelation::new();
        let downloader = FakeDownloader::new();

        let leader = node(&dir, &clock, &relation, "app/0", true, downloader.clone());
        let followers = ["app/1", "app/2"]
            .iter()
            .map(|unit| node(&dir, &clock, &relation, unit, false, FakeDownloader::new()))
            .collect();

        Self {
            dir,
            clock,
            relation,
            downloader,
            leader,
            followers,
        }
    }

    /// A second process for an existing follower unit
    fn respawn(&self, unit: &str) -> Node {
        node(
            &self.dir,
            &self.clock,
            &self.relation,
            unit,
            false,
            FakeDownloader::new(),
        )
    }

    fn leader(&self) -> &UpgradeCoordinator {
        &self.leader.coordinator
    }

    fn follower(&self, i: usize) -> &UpgradeCoordinator {
        &self.followers[i].coordinator
    }

    fn events(&self, i: usize) -> Vec<String> {
        self.followers[i].services.events()
    }

    async fn install(&self, version: &str) {
        let result = self
            .leader()
            .storage()
            .install_binaries(&request(version), Duration::ZERO)
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error_message);
    }
}

fn node(
    dir: &TempDir,
    clock: &Arc<ManualClock>,
    relation: &Arc<MemoryRelation>,
    unit: &str,
    leader: bool,
    downloader: Arc<FakeDownloader>,
) -> Node {
    let role: Arc<dyn RoleProvider> = Arc::new(StaticRole::new(leader));
    let storage = peer(dir.path(), unit, leader, clock, downloader);
    let services = RecordingServiceManager::running();
    let coordinator = UpgradeCoordinator::new(
        storage,
        Arc::new(relation.join(unit, role)),
        services.clone(),
    )
    .with_clock(clock.clone())
    .with_retry_policy(RetryPolicy::new(Duration::from_secs(1)));
    Node {
        coordinator,
        services,
    }
}

fn request(version: &str) -> DownloadRequest {
    DownloadRequest::new(version, format!("https://releases.example/app-{}.tgz", version))
}

fn options() -> UpgradeOptions {
    UpgradeOptions {
        workers_ready_timeout: Duration::from_secs(5),
        workers_restarted_timeout: Duration::from_secs(5),
        lock_timeout: Duration::ZERO,
        restart_local_service: true,
    }
}

/// Poll as a follower until it has seen Complete and then Idle
async fn drive_follower(fleet: &Fleet, i: usize) {
    let mut completed = false;
    for _ in 0..200 {
        match fleet.follower(i).observe().await.unwrap() {
            Some(UpgradePhase::Complete) => completed = true,
            Some(UpgradePhase::Idle) if completed => return,
            _ => {}
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("follower {} never finished the cycle", i);
}

#[tokio::test(start_paused = true)]
async fn test_full_cycle_step_by_step() {
    let fleet = Fleet::new();
    assert_eq!(fleet.leader().expected_worker_count().unwrap(), 2);
    assert_eq!(fleet.leader().get_upgrade_state().unwrap().phase, UpgradePhase::Idle);

    fleet.leader().initiate_upgrade("2.0.0", 2).unwrap();
    let state = fleet.follower(0).get_upgrade_state().unwrap();
    assert_eq!(state.phase, UpgradePhase::Prepare);
    assert_eq!(state.target_version.as_deref(), Some("2.0.0"));
    assert_eq!(state.initiated_by.as_deref(), Some("app/0"));
    assert_eq!(state.expected_worker_count, 2);

    for i in 0..2 {
        assert_eq!(
            fleet.follower(i).observe().await.unwrap(),
            Some(UpgradePhase::Prepare)
        );
        assert_eq!(fleet.events(i), vec![STOP]);
    }
    assert!(fleet
        .leader()
        .wait_for_workers_ready(Duration::from_secs(10))
        .await
        .unwrap());
    assert_eq!(fleet.leader().get_upgrade_state().unwrap().worker_ready_count, 2);

    fleet.leader().mark_download_phase().unwrap();
    for i in 0..2 {
        assert_eq!(
            fleet.follower(i).observe().await.unwrap(),
            Some(UpgradePhase::Downloading)
        );
    }
    fleet.install("2.0.0").await;

    fleet.leader().complete_upgrade().unwrap();
    for i in 0..2 {
        assert_eq!(
            fleet.follower(i).observe().await.unwrap(),
            Some(UpgradePhase::Complete)
        );
        assert_eq!(fleet.events(i), vec![STOP, START]);
    }
    assert!(fleet
        .leader()
        .wait_for_workers_restarted(Duration::from_secs(10))
        .await
        .unwrap());

    fleet.leader().reset_upgrade_state().unwrap();
    for i in 0..2 {
        assert_eq!(
            fleet.follower(i).observe().await.unwrap(),
            Some(UpgradePhase::Idle)
        );
        // already running, nothing to recover
        assert_eq!(fleet.events(i), vec![STOP, START]);
        assert_eq!(fleet.follower(i).observe().await.unwrap(), None);
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_upgrade_with_cooperating_followers() {
    let fleet = Fleet::new();

    let options = UpgradeOptions {
        workers_ready_timeout: Duration::from_secs(30),
        workers_restarted_timeout: Duration::from_secs(30),
        ..options()
    };
    let req = request("3.1.0");
    let (result, (), ()) = tokio::join!(
        fleet.leader().run_upgrade(&req, &options),
        drive_follower(&fleet, 0),
        drive_follower(&fleet, 1),
    );

    let result = result.unwrap();
    assert_eq!(result.version, "3.1.0");
    assert_eq!(fleet.downloader.calls(), 1);
    assert_eq!(
        fleet.leader.services.events(),
        vec!["restart fleet-worker.service"]
    );
    for i in 0..2 {
        assert_eq!(fleet.events(i), vec![STOP, START]);
        assert!(fleet.follower(i).storage().verify_binaries("3.1.0").unwrap());
    }
    assert_eq!(fleet.leader().get_upgrade_state().unwrap().phase, UpgradePhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_local_restart_failure_still_finishes_cycle() {
    let fleet = Fleet::new();
    fleet.leader.services.set_fail_restart(true);

    let options = UpgradeOptions {
        workers_ready_timeout: Duration::from_secs(30),
        workers_restarted_timeout: Duration::from_secs(30),
        ..options()
    };
    let req = request("3.2.0");
    let (result, (), ()) = tokio::join!(
        fleet.leader().run_upgrade(&req, &options),
        drive_follower(&fleet, 0),
        drive_follower(&fleet, 1),
    );

    let err = result.unwrap_err();
    assert!(matches!(err, Error::ServiceManagement { .. }), "{:?}", err);
    assert_eq!(fleet.leader().get_upgrade_state().unwrap().phase, UpgradePhase::Idle);
    for i in 0..2 {
        assert_eq!(fleet.events(i), vec![STOP, START]);
    }
    assert_eq!(
        fleet.leader().storage().get_installed_version().unwrap().as_deref(),
        Some("3.2.0")
    );

    // not wedged: the next cycle can start
    fleet.leader.services.set_fail_restart(false);
    fleet.leader().initiate_upgrade("3.2.1", 2).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_leader_proceeds_without_all_workers() {
    let fleet = Fleet::new();

    let late_ack = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        fleet.follower(0).observe().await.unwrap()
    };
    let started = tokio::time::Instant::now();
    let req = request("4.0.0");
    let opts = options();
    let (result, phase) = tokio::join!(
        fleet.leader().run_upgrade(&req, &opts),
        late_ack
    );

    assert_eq!(phase, Some(UpgradePhase::Prepare));
    assert!(result.unwrap().success);
    // both waits ran out
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(fleet.downloader.calls(), 1);

    let state = fleet.leader().get_upgrade_state().unwrap();
    assert_eq!(state.phase, UpgradePhase::Idle);
    assert_eq!(state.worker_ready_count, 1);

    // the acknowledged follower missed Downloading and Complete entirely
    assert_eq!(fleet.events(0), vec![STOP]);
    assert_eq!(
        fleet.follower(0).observe().await.unwrap(),
        Some(UpgradePhase::Idle)
    );
    assert_eq!(fleet.events(0), vec![STOP, START]);

    // the silent one never stopped, so it has nothing to do
    assert_eq!(fleet.follower(1).observe().await.unwrap(), None);
    assert!(fleet.events(1).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_follower_clock_behind_leader_still_counts() {
    let dir = TempDir::new().unwrap();
    let relation = MemoryRelation::new();
    let now = Utc::now();
    let leader_clock = Arc::new(ManualClock::new(now));
    let follower_clock = Arc::new(ManualClock::new(now - chrono::Duration::seconds(2)));
    let leader = node(&dir, &leader_clock, &relation, "app/0", true, FakeDownloader::new());
    let follower = node(&dir, &follower_clock, &relation, "app/1", false, FakeDownloader::new());

    leader.coordinator.initiate_upgrade("2.0.0", 1).unwrap();
    assert_eq!(
        follower.coordinator.observe().await.unwrap(),
        Some(UpgradePhase::Prepare)
    );

    let started = tokio::time::Instant::now();
    assert!(leader
        .coordinator
        .wait_for_workers_ready(Duration::from_secs(5))
        .await
        .unwrap());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(
        leader.coordinator.get_upgrade_state().unwrap().worker_ready_count,
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_acknowledgment_from_previous_cycle_is_not_counted() {
    let fleet = Fleet::new();
    fleet.leader().initiate_upgrade("2.0.0", 2).unwrap();
    fleet.follower(0).observe().await.unwrap();

    // aborted and restarted before the follower polled again
    fleet.leader().abort_upgrade().unwrap();
    fleet.clock.advance(Duration::from_secs(1));
    fleet.leader().initiate_upgrade("2.0.1", 1).unwrap();
    assert!(!fleet
        .leader()
        .wait_for_workers_ready(Duration::ZERO)
        .await
        .unwrap());

    assert_eq!(
        fleet.follower(0).observe().await.unwrap(),
        Some(UpgradePhase::Prepare)
    );
    assert_eq!(fleet.events(0), vec![STOP, STOP]);
    assert!(fleet
        .leader()
        .wait_for_workers_ready(Duration::ZERO)
        .await
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_leader_transitions_are_strict() {
    let fleet = Fleet::new();

    assert!(matches!(
        fleet.leader().mark_download_phase(),
        Err(Error::ProtocolViolation { .. })
    ));
    assert!(matches!(
        fleet.leader().reset_upgrade_state(),
        Err(Error::ProtocolViolation { .. })
    ));

    fleet.leader().initiate_upgrade("2.0.0", 2).unwrap();
    assert!(matches!(
        fleet.leader().initiate_upgrade("2.0.1", 2),
        Err(Error::UpgradeInProgress { ref phase }) if phase == "prepare"
    ));
    assert!(matches!(
        fleet.leader().complete_upgrade(),
        Err(Error::ProtocolViolation { .. })
    ));

    fleet.leader().mark_download_phase().unwrap();
    assert!(matches!(
        fleet.leader().mark_download_phase(),
        Err(Error::ProtocolViolation { .. })
    ));
    let state = fleet.leader().get_upgrade_state().unwrap();
    assert_eq!(state.phase, UpgradePhase::Downloading);
    assert_eq!(state.target_version.as_deref(), Some("2.0.0"));
}

#[tokio::test(start_paused = true)]
async fn test_prepare_is_idempotent() {
    let fleet = Fleet::new();
    fleet.leader().initiate_upgrade("2.0.0", 2).unwrap();

    fleet.follower(0).handle_prepare_signal().await.unwrap();
    fleet.follower(0).handle_prepare_signal().await.unwrap();
    assert_eq!(fleet.events(0), vec![STOP, STOP]);

    let store = fleet.relation.join("app/0", Arc::new(StaticRole::leader()));
    assert_eq!(
        store.get_unit_data("app/1", UPGRADE_READY_KEY).unwrap().as_deref(),
        Some("true")
    );
    assert_eq!(store.get_unit_data("app/2", UPGRADE_READY_KEY).unwrap(), None);

    // observing the same phase again does nothing
    assert_eq!(
        fleet.follower(1).observe().await.unwrap(),
        Some(UpgradePhase::Prepare)
    );
    assert_eq!(fleet.follower(1).observe().await.unwrap(), None);
    assert_eq!(fleet.events(1), vec![STOP]);
}

#[tokio::test(start_paused = true)]
async fn test_follower_ignores_skipped_phases() {
    let fleet = Fleet::new();
    fleet.leader().initiate_upgrade("2.0.0", 2).unwrap();
    fleet.leader().mark_download_phase().unwrap();

    // never saw Prepare
    assert_eq!(fleet.follower(0).observe().await.unwrap(), None);
    fleet.install("2.0.0").await;
    fleet.leader().complete_upgrade().unwrap();
    assert_eq!(fleet.follower(0).observe().await.unwrap(), None);
    assert!(fleet.events(0).is_empty());

    fleet.leader().reset_upgrade_state().unwrap();
    assert_eq!(fleet.follower(0).observe().await.unwrap(), None);
    assert!(fleet.events(0).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_follower_catches_up_from_prepare_to_complete() {
    let fleet = Fleet::new();
    fleet.leader().initiate_upgrade("2.0.0", 2).unwrap();
    fleet.follower(0).observe().await.unwrap();

    fleet.leader().mark_download_phase().unwrap();
    fleet.install("2.0.0").await;
    fleet.leader().complete_upgrade().unwrap();

    assert_eq!(
        fleet.follower(0).observe().await.unwrap(),
        Some(UpgradePhase::Complete)
    );
    assert_eq!(fleet.events(0), vec![STOP, START]);
}

#[tokio::test(start_paused = true)]
async fn test_restarted_follower_resumes_its_cycle() {
    let fleet = Fleet::new();
    fleet.leader().initiate_upgrade("2.0.0", 2).unwrap();
    fleet.follower(0).observe().await.unwrap();

    fleet.leader().mark_download_phase().unwrap();
    fleet.install("2.0.0").await;
    fleet.leader().complete_upgrade().unwrap();

    // new process, no memory of the phases it saw
    let respawned = fleet.respawn("app/1");
    assert_eq!(
        respawned.coordinator.observe().await.unwrap(),
        Some(UpgradePhase::Complete)
    );
    assert_eq!(respawned.services.events(), vec![START]);
}

#[tokio::test(start_paused = true)]
async fn test_complete_refuses_missing_binaries() {
    let fleet = Fleet::new();
    fleet.leader().initiate_upgrade("2.0.0", 2).unwrap();
    fleet.follower(0).observe().await.unwrap();
    fleet.leader().mark_download_phase().unwrap();
    // leader skipped the install
    fleet.leader().complete_upgrade().unwrap();

    let err = fleet.follower(0).observe().await.unwrap_err();
    assert!(matches!(err, Error::BinaryValidation(_)), "{:?}", err);
    assert_eq!(fleet.events(0), vec![STOP]);

    // still acknowledged, so the leader keeps waiting on it
    assert!(!fleet
        .leader()
        .wait_for_workers_restarted(Duration::from_secs(2))
        .await
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_failed_install_aborts_cycle() {
    let fleet = Fleet::new();
    fleet.install("1.0.0").await;
    fleet.downloader.set_failing(true);

    let observe_prepare = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        fleet.follower(0).observe().await.unwrap();
        fleet.follower(1).observe().await.unwrap();
    };
    let req = request("2.0.0");
    let opts = options();
    let (result, ()) = tokio::join!(
        fleet.leader().run_upgrade(&req, &opts),
        observe_prepare
    );
    assert!(matches!(result, Err(Error::Download(_))));
    assert_eq!(fleet.leader().get_upgrade_state().unwrap().phase, UpgradePhase::Idle);
    assert!(fleet.leader.services.events().is_empty());

    // followers come back up on what is still installed
    for i in 0..2 {
        assert_eq!(
            fleet.follower(i).observe().await.unwrap(),
            Some(UpgradePhase::Idle)
        );
        assert_eq!(fleet.events(i), vec![STOP, START]);
    }
    assert_eq!(
        fleet.leader().storage().get_installed_version().unwrap().as_deref(),
        Some("1.0.0")
    );
}

/// Store that refuses to write the idle phase
struct NoIdleStore {
    inner: MemoryStore,
}

impl CoordinationStore for NoIdleStore {
    fn local_unit(&self) -> &str {
        self.inner.local_unit()
    }

    fn set_unit_data(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set_unit_data(key, value)
    }

    fn get_unit_data(&self, unit_name: &str, key: &str) -> Result<Option<String>> {
        self.inner.get_unit_data(unit_name, key)
    }

    fn get_all_units(&self) -> Result<Vec<String>> {
        self.inner.get_all_units()
    }

    fn set_application_data(&self, key: &str, value: &str) -> Result<()> {
        if key == PHASE_KEY && value == "idle" {
            return Err(Error::Store("relation data is read-only".into()));
        }
        self.inner.set_application_data(key, value)
    }

    fn get_application_data(&self, key: &str) -> Result<Option<String>> {
        self.inner.get_application_data(key)
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_abort_keeps_install_error() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let relation = MemoryRelation::new();
    let role: Arc<dyn RoleProvider> = Arc::new(StaticRole::leader());
    let storage = peer(dir.path(), "app/0", true, &clock, FakeDownloader::failing());
    let store = NoIdleStore {
        inner: relation.join("app/0", role),
    };
    let services = RecordingServiceManager::running();
    let leader = UpgradeCoordinator::new(storage, Arc::new(store), services.clone())
        .with_clock(clock.clone())
        .with_retry_policy(RetryPolicy::new(Duration::from_secs(1)));

    let err = leader
        .run_upgrade(&request("2.0.0"), &options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Download(_)), "{:?}", err);
    // abort could not be written
    assert_eq!(
        leader.get_upgrade_state().unwrap().phase,
        UpgradePhase::Downloading
    );
    assert!(services.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_abort_lets_followers_recover() {
    let fleet = Fleet::new();
    fleet.install("1.0.0").await;
    fleet.leader().initiate_upgrade("2.0.0", 2).unwrap();
    fleet.follower(0).observe().await.unwrap();

    fleet.leader().abort_upgrade().unwrap();
    fleet.leader().abort_upgrade().unwrap();
    assert_eq!(fleet.leader().get_upgrade_state().unwrap().phase, UpgradePhase::Idle);

    assert_eq!(
        fleet.follower(0).observe().await.unwrap(),
        Some(UpgradePhase::Idle)
    );
    assert_eq!(fleet.events(0), vec![STOP, START]);

    // a fresh cycle can start right away
    fleet.leader().initiate_upgrade("2.0.1", 2).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_role_checks() {
    let fleet = Fleet::new();

    assert!(matches!(
        fleet.follower(0).initiate_upgrade("2.0.0", 1),
        Err(Error::Permission { .. })
    ));
    assert!(matches!(
        fleet.follower(0).abort_upgrade(),
        Err(Error::Permission { .. })
    ));
    assert!(matches!(
        fleet.leader().observe().await,
        Err(Error::Permission { .. })
    ));
    assert!(matches!(
        fleet.leader().handle_prepare_signal().await,
        Err(Error::Permission { .. })
    ));
    assert!(fleet.follower(0).as_leader().is_err());
    assert!(fleet.leader().as_follower().is_err());

    let leader = fleet.leader().as_leader().unwrap();
    leader.initiate_upgrade("2.0.0", 2).unwrap();
    let follower = fleet.follower(0).as_follower().unwrap();
    assert_eq!(
        follower.get_upgrade_state().unwrap().phase,
        UpgradePhase::Prepare
    );
    assert_eq!(follower.observe().await.unwrap(), Some(UpgradePhase::Prepare));
}

#[tokio::test(start_paused = true)]
async fn test_cycle_through_file_store() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let downloader = FakeDownloader::new();

    let open = |unit: &str, leader: bool| {
        let storage = peer(dir.path(), unit, leader, &clock, downloader.clone());
        let role: Arc<dyn RoleProvider> = Arc::new(StaticRole::new(leader));
        let store: Arc<dyn CoordinationStore> = Arc::new(
            FileStore::open(storage.volume().relation_directory(), unit, role).unwrap(),
        );
        let services = RecordingServiceManager::running();
        let coordinator = UpgradeCoordinator::new(storage, store, services.clone())
            .with_clock(clock.clone())
            .with_retry_policy(RetryPolicy::new(Duration::from_secs(1)));
        (coordinator, services)
    };
    let (leader, _) = open("app/0", true);
    let (follower, services) = open("app/1", false);

    assert_eq!(leader.expected_worker_count().unwrap(), 1);
    leader.initiate_upgrade("9.0.0", 1).unwrap();
    assert_eq!(follower.observe().await.unwrap(), Some(UpgradePhase::Prepare));
    assert!(leader
        .wait_for_workers_ready(Duration::ZERO)
        .await
        .unwrap());

    leader.mark_download_phase().unwrap();
    leader
        .storage()
        .install_binaries(&request("9.0.0"), Duration::ZERO)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    leader.complete_upgrade().unwrap();
    assert_eq!(follower.observe().await.unwrap(), Some(UpgradePhase::Complete));
    leader.reset_upgrade_state().unwrap();
    assert_eq!(follower.observe().await.unwrap(), Some(UpgradePhase::Idle));

    assert_eq!(services.events(), vec![STOP, START]);
}
