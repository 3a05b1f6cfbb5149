//! Control-plane metadata records: stores, regions, peers, epochs.

use serde::{Deserialize, Serialize};

pub type StoreId = u64;
pub type RegionId = u64;
pub type PeerId = u64;

/// Store lifecycle state. Transitions only move towards `Tombstone` and a
/// tombstoned identity is never revived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreState {
    Up,
    Offline,
    Tombstone,
}

/// One `key=value` label attached to a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLabel {
    pub key: String,
    pub value: String,
}

impl StoreLabel {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Store registration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub id: StoreId,
    pub address: String,
    #[serde(default)]
    pub version: String,
    pub state: StoreState,
    #[serde(default)]
    pub labels: Vec<StoreLabel>,
}

impl StoreMeta {
    pub fn new(id: StoreId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            version: String::new(),
            state: StoreState::Up,
            labels: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_state(mut self, state: StoreState) -> Self {
        self.state = state;
        self
    }

    pub fn with_labels(mut self, labels: Vec<StoreLabel>) -> Self {
        self.labels = labels;
        self
    }
}

/// Rolling statistics reported by store heartbeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub store_id: StoreId,
    pub capacity: u64,
    pub available: u64,
    pub region_count: u64,
    pub leader_count: u64,
}

impl StoreStats {
    pub fn new(store_id: StoreId) -> Self {
        Self {
            store_id,
            ..Self::default()
        }
    }
}

/// Store record held in the topology: registration plus last observed
/// liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    pub meta: StoreMeta,
    #[serde(default)]
    pub stats: StoreStats,
    /// Unix ms of the most recent store or region heartbeat from this store.
    #[serde(default)]
    pub last_heartbeat_ms: u64,
}

impl Store {
    pub fn new(meta: StoreMeta) -> Self {
        let stats = StoreStats::new(meta.id);
        Self {
            meta,
            stats,
            last_heartbeat_ms: 0,
        }
    }

    pub fn id(&self) -> StoreId {
        self.meta.id
    }

    pub fn state(&self) -> StoreState {
        self.meta.state
    }

    pub fn is_up(&self) -> bool {
        self.meta.state == StoreState::Up
    }

    pub fn is_tombstone(&self) -> bool {
        self.meta.state == StoreState::Tombstone
    }
}

/// Region version pair, compared lexicographically as `(version, conf_ver)`.
///
/// `version` advances on range changes (splits/merges), `conf_ver` on peer
/// membership changes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RegionEpoch {
    pub version: u64,
    pub conf_ver: u64,
}

impl RegionEpoch {
    pub const fn new(version: u64, conf_ver: u64) -> Self {
        Self { version, conf_ver }
    }
}

/// Replica role within a region's peer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Voter,
    Learner,
}

/// One replica of a region placed on one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub store_id: StoreId,
    pub role: PeerRole,
}

impl Peer {
    pub fn voter(id: PeerId, store_id: StoreId) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Voter,
        }
    }

    pub fn learner(id: PeerId, store_id: StoreId) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Learner,
        }
    }
}

/// Key-range shard descriptor. Ranges are lexicographic and end-exclusive;
/// an empty `end_key` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub epoch: RegionEpoch,
    pub peers: Vec<Peer>,
    pub leader: Option<PeerId>,
}

impl Region {
    pub fn new(
        id: RegionId,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        epoch: RegionEpoch,
        peers: Vec<Peer>,
    ) -> Self {
        Self {
            id,
            start_key,
            end_key,
            epoch,
            peers,
            leader: None,
        }
    }

    pub fn with_leader(mut self, leader: PeerId) -> Self {
        self.leader = Some(leader);
        self
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key_in_range(key, &self.start_key, &self.end_key)
    }

    pub fn leader_peer(&self) -> Option<&Peer> {
        let leader = self.leader?;
        self.peers.iter().find(|p| p.id == leader)
    }

    pub fn peer_on_store(&self, store_id: StoreId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.store_id == store_id)
    }

    /// Store this region reports from: the leader's store, else the first
    /// peer's store.
    pub fn origin_store(&self) -> Option<StoreId> {
        self.leader_peer()
            .or_else(|| self.peers.first())
            .map(|p| p.store_id)
    }
}

pub(crate) fn key_in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    key >= start && (end.is_empty() || key < end)
}
