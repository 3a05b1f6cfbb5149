//! Cluster-state and scheduling-admission core for a range-sharded,
//! replicated key-value cluster.
//!
//! shardpilot tracks storage nodes ("stores") and the key-range shards
//! ("regions") replicated across them, ingests epoch-ordered region
//! heartbeats into a consistent in-memory topology, rate-limits per-store
//! relocation work, and is the single gatekeeper admitting relocation
//! operators proposed by an external scheduler. Wire transport, durable
//! storage engines, leader election and the scheduler itself are external
//! collaborators; the [`storage::Persistence`] trait and the bounded
//! outbound instruction queues are the seams they plug into.

pub mod admission;
pub mod cluster;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod id;
pub mod limiter;
pub mod meta;
pub mod operator;
pub mod replication;
pub mod storage;
pub mod topology;

pub use cluster::Cluster;
pub use error::{ClusterError, Result};
pub use heartbeat::{HeartbeatOutcome, RegionInstruction};
pub use limiter::{OperationKind, StoreLimit, StoreLimiter};
pub use meta::{Peer, PeerRole, Region, RegionEpoch, Store, StoreMeta, StoreState};
pub use operator::{OpKind, OpStep, Operator};
pub use replication::{DrSyncState, ReplicationMode, ReplicationStatus};
