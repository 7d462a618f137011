//! Peer identity and role
//!
//! Role assignment happens outside fleetsync. The coordinators only ask
//! "am I the leader right now?" through [`RoleProvider`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Supplies the externally assigned role of the local peer
pub trait RoleProvider: Send + Sync + fmt::Debug {
    fn is_leader(&self) -> bool;
}

/// Role fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticRole {
    leader: bool,
}

impl StaticRole {
    pub fn new(leader: bool) -> Self {
        Self { leader }
    }

    pub fn leader() -> Self {
        Self::new(true)
    }

    pub fn follower() -> Self {
        Self::new(false)
    }
}

impl RoleProvider for StaticRole {
    fn is_leader(&self) -> bool {
        self.leader
    }
}

/// Role that can change at runtime (leadership failover)
#[derive(Debug, Clone, Default)]
pub struct SwitchableRole {
    leader: Arc<AtomicBool>,
}

impl SwitchableRole {
    pub fn new(leader: bool) -> Self {
        Self {
            leader: Arc::new(AtomicBool::new(leader)),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

impl RoleProvider for SwitchableRole {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}

/// Who the local peer is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Unit name, e.g. "app/1"
    pub unit_name: String,
    /// Identity recorded in the lock file
    pub holder_id: String,
}

impl Identity {
    pub fn new(unit_name: impl Into<String>, holder_id: impl Into<String>) -> Self {
        Self {
            unit_name: unit_name.into(),
            holder_id: holder_id.into(),
        }
    }

    /// Identity whose holder id is the unit name
    pub fn from_unit(unit_name: impl Into<String>) -> Self {
        let unit_name = unit_name.into();
        Self {
            holder_id: unit_name.clone(),
            unit_name,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unit_name == self.holder_id {
            write!(f, "{}", self.unit_name)
        } else {
            write!(f, "{} ({})", self.unit_name, self.holder_id)
        }
    }
}
