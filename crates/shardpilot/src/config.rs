//! Scheduling and replication configuration consumed by the core.
//!
//! Every mutation is persisted through the storage collaborator before the
//! in-memory sections are swapped, so a failed durable write never leaves
//! half-applied configuration behind.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::limiter::StoreLimit;
use crate::meta::{StoreId, StoreLabel};

/// Cluster-wide metadata record, persisted at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMeta {
    pub id: u64,
    pub max_peer_count: u32,
}

impl ClusterMeta {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            max_peer_count: 3,
        }
    }
}

/// Per-store limit entry persisted with the schedule config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoreLimitConfig {
    pub add_peer: StoreLimit,
    pub remove_peer: StoreLimit,
}

impl Default for StoreLimitConfig {
    fn default() -> Self {
        Self {
            add_peer: StoreLimit::Unlimited,
            remove_peer: StoreLimit::Unlimited,
        }
    }
}

/// Knobs consumed by operator admission and external schedulers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Upper bound on stores concurrently sending snapshots.
    pub max_snapshot_count: u64,
    pub max_pending_peer_count: u64,
    /// Per-store relocation limits; stores absent here run on the
    /// process-wide defaults.
    #[serde(default)]
    pub store_limit: HashMap<StoreId, StoreLimitConfig>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_snapshot_count: 3,
            max_pending_peer_count: 16,
            store_limit: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub max_replicas: u64,
    #[serde(default)]
    pub location_labels: Vec<String>,
    #[serde(default)]
    pub enable_placement_rules: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_replicas: 3,
            location_labels: Vec::new(),
            enable_placement_rules: false,
        }
    }
}

/// Label-type to an ordered sequence of `(key, value)` pairs.
pub type LabelPropertyConfig = HashMap<String, Vec<StoreLabel>>;

/// Append `label` to `typ` unless an equal pair is already present.
pub fn add_label_property(config: &mut LabelPropertyConfig, typ: &str, label: StoreLabel) {
    let entry = config.entry(typ.to_string()).or_default();
    if !entry.contains(&label) {
        entry.push(label);
    }
}

/// Remove every pair equal to `label` from `typ`.
pub fn remove_label_property(config: &mut LabelPropertyConfig, typ: &str, label: &StoreLabel) {
    if let Some(entry) = config.get_mut(typ) {
        entry.retain(|l| l != label);
    }
}

/// Snapshot of every persisted config section, written as one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub schedule: ScheduleConfig,
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub label_property: LabelPropertyConfig,
}

/// Independently locked live configuration sections.
pub struct Options {
    schedule: RwLock<ScheduleConfig>,
    replication: RwLock<ReplicationConfig>,
    label_property: RwLock<LabelPropertyConfig>,
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl Options {
    pub fn new() -> Self {
        Self::from_persisted(PersistedConfig::default())
    }

    pub fn from_persisted(config: PersistedConfig) -> Self {
        Self {
            schedule: RwLock::new(config.schedule),
            replication: RwLock::new(config.replication),
            label_property: RwLock::new(config.label_property),
        }
    }

    pub fn schedule(&self) -> ScheduleConfig {
        self.schedule.read().clone()
    }

    pub fn replication(&self) -> ReplicationConfig {
        self.replication.read().clone()
    }

    pub fn label_property(&self) -> LabelPropertyConfig {
        self.label_property.read().clone()
    }

    /// Assemble the snapshot that goes to durable storage.
    pub fn persisted(&self) -> PersistedConfig {
        PersistedConfig {
            schedule: self.schedule(),
            replication: self.replication(),
            label_property: self.label_property(),
        }
    }

    /// Swap in a fully-persisted snapshot.
    pub fn apply(&self, config: PersistedConfig) {
        *self.schedule.write() = config.schedule;
        *self.replication.write() = config.replication;
        *self.label_property.write() = config.label_property;
    }
}
