//! Upgrade coordination records and their store encoding
//!
//! All store values are strings: counts as decimal, flags as `"true"` /
//! `"false"`, timestamps as RFC 3339 UTC with microsecond precision.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::common::store::DataBag;
use crate::common::utils::{format_timestamp, parse_flag, parse_timestamp};
use crate::common::{Error, Result};

// Leader-owned application keys
pub const PHASE_KEY: &str = "upgrade-phase";
pub const TARGET_VERSION_KEY: &str = "target-version";
pub const INITIATED_BY_KEY: &str = "initiated-by";
pub const TIMESTAMP_KEY: &str = "timestamp";
pub const WORKER_READY_COUNT_KEY: &str = "worker-ready-count";
pub const EXPECTED_WORKER_COUNT_KEY: &str = "expected-worker-count";

// Follower-owned unit keys
pub const UPGRADE_READY_KEY: &str = "upgrade-ready";
pub const ACKNOWLEDGED_CYCLE_KEY: &str = "acknowledged-cycle";

pub const STATE_KEYS: [&str; 6] = [
    PHASE_KEY,
    TARGET_VERSION_KEY,
    INITIATED_BY_KEY,
    TIMESTAMP_KEY,
    WORKER_READY_COUNT_KEY,
    EXPECTED_WORKER_COUNT_KEY,
];

pub const ACK_KEYS: [&str; 3] = [UPGRADE_READY_KEY, ACKNOWLEDGED_CYCLE_KEY, TIMESTAMP_KEY];

/// Timestamp as it survives a trip through the store
pub fn store_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// Upgrade phase: `Idle → Prepare → Downloading → Complete → Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpgradePhase {
    #[default]
    Idle,
    Prepare,
    Downloading,
    Complete,
}

impl UpgradePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradePhase::Idle => "idle",
            UpgradePhase::Prepare => "prepare",
            UpgradePhase::Downloading => "downloading",
            UpgradePhase::Complete => "complete",
        }
    }

    /// The only phase the leader may move to from here
    pub fn next(&self) -> UpgradePhase {
        match self {
            UpgradePhase::Idle => UpgradePhase::Prepare,
            UpgradePhase::Prepare => UpgradePhase::Downloading,
            UpgradePhase::Downloading => UpgradePhase::Complete,
            UpgradePhase::Complete => UpgradePhase::Idle,
        }
    }

    /// Whether the leader may write `to` while the phase is `self`
    pub fn can_transition_to(&self, to: UpgradePhase) -> bool {
        self.next() == to
    }

    /// Whether a follower should act on seeing `to` after last seeing `self`.
    ///
    /// Besides the strict successor, `Prepare → Complete` is accepted because
    /// a follower polling slower than the leader can miss `Downloading`.
    pub fn is_valid_observation(&self, to: UpgradePhase) -> bool {
        self.can_transition_to(to)
            || (*self == UpgradePhase::Prepare && to == UpgradePhase::Complete)
    }

    pub fn is_active(&self) -> bool {
        *self != UpgradePhase::Idle
    }
}

impl fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpgradePhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" | "" => Ok(UpgradePhase::Idle),
            "prepare" => Ok(UpgradePhase::Prepare),
            "downloading" => Ok(UpgradePhase::Downloading),
            "complete" => Ok(UpgradePhase::Complete),
            other => Err(Error::Serialization(format!(
                "unknown upgrade phase '{}'",
                other
            ))),
        }
    }
}

/// Leader-owned upgrade state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpgradeCoordinationState {
    pub phase: UpgradePhase,
    pub target_version: Option<String>,
    pub initiated_by: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub worker_ready_count: u32,
    pub expected_worker_count: u32,
}

impl UpgradeCoordinationState {
    /// Fresh `Prepare` state for a new cycle
    pub fn prepare(
        target_version: &str,
        initiated_by: &str,
        expected_worker_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            phase: UpgradePhase::Prepare,
            target_version: Some(target_version.to_string()),
            initiated_by: Some(initiated_by.to_string()),
            timestamp: Some(store_timestamp(now)),
            worker_ready_count: 0,
            expected_worker_count,
        }
    }

    /// Copy of this state in `phase`, restamped
    pub fn with_phase(&self, phase: UpgradePhase, now: DateTime<Utc>) -> Self {
        Self {
            phase,
            timestamp: Some(store_timestamp(now)),
            ..self.clone()
        }
    }

    /// Identifier of the cycle this state belongs to, as written by the leader.
    ///
    /// Only meaningful while the phase is `Prepare`: later phases restamp.
    pub fn cycle_id(&self) -> Option<String> {
        match (&self.target_version, &self.timestamp) {
            (Some(version), Some(ts)) => Some(format!("{}@{}", version, format_timestamp(ts))),
            _ => None,
        }
    }

    pub fn to_bag(&self) -> DataBag {
        let mut bag = DataBag::new();
        bag.insert(PHASE_KEY.into(), self.phase.to_string());
        bag.insert(
            TARGET_VERSION_KEY.into(),
            self.target_version.clone().unwrap_or_default(),
        );
        bag.insert(
            INITIATED_BY_KEY.into(),
            self.initiated_by.clone().unwrap_or_default(),
        );
        bag.insert(
            TIMESTAMP_KEY.into(),
            self.timestamp.as_ref().map(format_timestamp).unwrap_or_default(),
        );
        bag.insert(
            WORKER_READY_COUNT_KEY.into(),
            self.worker_ready_count.to_string(),
        );
        bag.insert(
            EXPECTED_WORKER_COUNT_KEY.into(),
            self.expected_worker_count.to_string(),
        );
        bag
    }

    /// Decode from application data; missing keys take their defaults
    pub fn from_bag(bag: &DataBag) -> Result<Self> {
        Ok(Self {
            phase: match bag.get(PHASE_KEY) {
                Some(s) => s.parse()?,
                None => UpgradePhase::Idle,
            },
            target_version: non_empty(bag.get(TARGET_VERSION_KEY)),
            initiated_by: non_empty(bag.get(INITIATED_BY_KEY)),
            timestamp: non_empty(bag.get(TIMESTAMP_KEY))
                .map(|s| parse_timestamp(&s))
                .transpose()?,
            worker_ready_count: parse_count(bag.get(WORKER_READY_COUNT_KEY), WORKER_READY_COUNT_KEY)?,
            expected_worker_count: parse_count(
                bag.get(EXPECTED_WORKER_COUNT_KEY),
                EXPECTED_WORKER_COUNT_KEY,
            )?,
        })
    }
}

/// Follower-owned readiness flag.
///
/// `cycle` echoes the leader's [`UpgradeCoordinationState::cycle_id`] so the
/// leader can tell a current acknowledgment from a stale one without
/// comparing clocks across hosts. `timestamp` is informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAcknowledgment {
    pub unit_name: String,
    pub upgrade_ready: bool,
    pub cycle: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl WorkerAcknowledgment {
    pub fn new(
        unit_name: &str,
        upgrade_ready: bool,
        cycle: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            unit_name: unit_name.to_string(),
            upgrade_ready,
            cycle,
            timestamp: Some(store_timestamp(now)),
        }
    }

    /// Ready for the cycle `state` describes
    pub fn is_ready_for(&self, state: &UpgradeCoordinationState) -> bool {
        self.upgrade_ready && self.cycle.is_some() && self.cycle == state.cycle_id()
    }

    pub fn to_bag(&self) -> DataBag {
        let mut bag = DataBag::new();
        bag.insert(UPGRADE_READY_KEY.into(), self.upgrade_ready.to_string());
        bag.insert(
            ACKNOWLEDGED_CYCLE_KEY.into(),
            self.cycle.clone().unwrap_or_default(),
        );
        bag.insert(
            TIMESTAMP_KEY.into(),
            self.timestamp.as_ref().map(format_timestamp).unwrap_or_default(),
        );
        bag
    }

    pub fn from_bag(unit_name: &str, bag: &DataBag) -> Result<Self> {
        Ok(Self {
            unit_name: unit_name.to_string(),
            upgrade_ready: bag.get(UPGRADE_READY_KEY).is_some_and(|s| parse_flag(s)),
            cycle: non_empty(bag.get(ACKNOWLEDGED_CYCLE_KEY)),
            timestamp: non_empty(bag.get(TIMESTAMP_KEY))
                .map(|s| parse_timestamp(&s))
                .transpose()?,
        })
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_count(value: Option<&String>, key: &str) -> Result<u32> {
    match non_empty(value) {
        Some(s) => s
            .parse()
            .map_err(|e| Error::Serialization(format!("invalid {} '{}': {}", key, s, e))),
        None => Ok(0),
    }
}
