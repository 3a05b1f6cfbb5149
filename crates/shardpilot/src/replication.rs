//! Cluster-wide replication mode tracking.
//!
//! The status snapshot is embedded into bootstrap, store-registration and
//! heartbeat responses so nodes learn the mode without an extra round
//! trip. Mode changes come from an external monitor and never block
//! heartbeat processing.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Durability/consistency policy the cluster acknowledges writes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMode {
    Majority,
    DrAutoSync,
}

/// Sync state of the DR auto-sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrSyncState {
    Sync,
    Async,
    SyncRecover,
}

/// DR auto-sync detail attached to the status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrAutoSyncStatus {
    /// Store label key distinguishing the two replication zones.
    pub label_key: String,
    pub state: DrSyncState,
    pub state_id: u64,
}

/// Immutable snapshot handed out with outbound responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub mode: ReplicationMode,
    pub dr_auto_sync: Option<DrAutoSyncStatus>,
}

impl ReplicationStatus {
    pub fn majority() -> Self {
        Self {
            mode: ReplicationMode::Majority,
            dr_auto_sync: None,
        }
    }

    pub fn dr_auto_sync(label_key: impl Into<String>, state: DrSyncState, state_id: u64) -> Self {
        Self {
            mode: ReplicationMode::DrAutoSync,
            dr_auto_sync: Some(DrAutoSyncStatus {
                label_key: label_key.into(),
                state,
                state_id,
            }),
        }
    }
}

/// Read-mostly holder updated by the external replication monitor.
pub struct ReplicationState {
    status: RwLock<ReplicationStatus>,
}

impl Default for ReplicationState {
    fn default() -> Self {
        Self::new(ReplicationStatus::majority())
    }
}

impl ReplicationState {
    pub fn new(initial: ReplicationStatus) -> Self {
        Self {
            status: RwLock::new(initial),
        }
    }

    /// Current snapshot; readers never block writers for long, the clone
    /// happens under a short read lock.
    pub fn status(&self) -> ReplicationStatus {
        self.status.read().clone()
    }

    pub fn set_status(&self, status: ReplicationStatus) {
        *self.status.write() = status;
    }

    /// Advance the DR sync state; no-op unless the mode is DrAutoSync.
    pub fn set_dr_state(&self, state: DrSyncState, state_id: u64) {
        let mut status = self.status.write();
        if let Some(dr) = status.dr_auto_sync.as_mut() {
            dr.state = state;
            dr.state_id = state_id;
        }
    }
}
