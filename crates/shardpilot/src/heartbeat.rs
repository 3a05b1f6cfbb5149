//! Region-heartbeat ingestion and the outbound instruction channel.
//!
//! Reports arrive unordered and concurrently from many stores. Application
//! is serialized per region id and ordered by epoch; a stale report is an
//! expected race and is dropped silently.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::cluster::unix_time_ms;
use crate::error::{ClusterError, Result};
use crate::meta::{Region, RegionEpoch, RegionId, StoreId};
use crate::operator::OpStep;
use crate::topology::ClusterTopology;

/// Whether a region report mutated the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Applied,
    Stale,
}

/// Instruction derived from an admitted operator, sent back on a store's
/// heartbeat response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInstruction {
    pub region_id: RegionId,
    pub epoch: RegionEpoch,
    pub step: OpStep,
}

pub struct HeartbeatIngestor {
    topology: Arc<ClusterTopology>,
}

impl HeartbeatIngestor {
    pub fn new(topology: Arc<ClusterTopology>) -> Self {
        Self { topology }
    }

    /// Apply one region report.
    ///
    /// First write wins; a cached region is replaced iff the incoming epoch
    /// advances it: `version > cached.version`, or equal version with
    /// `conf_ver >= cached.conf_ver`. The origin store's liveness refreshes
    /// even when the region payload is stale.
    pub fn handle_report(&self, report: Region) -> Result<HeartbeatOutcome> {
        let origin = report
            .origin_store()
            .ok_or(ClusterError::InvalidReport(report.id, "no peers"))?;
        let store = self
            .topology
            .get_store(origin)
            .ok_or(ClusterError::StoreNotFound(origin))?;
        if store.is_tombstone() {
            return Err(ClusterError::StoreTombstoned(origin));
        }

        let region_id = report.id;
        let outcome = {
            let _guard = self.topology.lock_region(region_id);
            match self.topology.get_region_by_id(region_id) {
                None => {
                    self.topology.put_region(report);
                    HeartbeatOutcome::Applied
                }
                Some(cached) if epoch_advances(report.epoch, cached.epoch) => {
                    self.topology.put_region(report);
                    HeartbeatOutcome::Applied
                }
                Some(cached) => {
                    tracing::trace!(
                        region_id,
                        incoming = ?report.epoch,
                        cached = ?cached.epoch,
                        "dropping stale region report"
                    );
                    HeartbeatOutcome::Stale
                }
            }
        };

        self.topology.touch_store(origin, unix_time_ms());
        Ok(outcome)
    }
}

fn epoch_advances(incoming: RegionEpoch, cached: RegionEpoch) -> bool {
    incoming.version > cached.version
        || (incoming.version == cached.version && incoming.conf_ver >= cached.conf_ver)
}

/// Default capacity of one store's outbound instruction queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Per-store bounded queues carrying instructions back to reporting nodes.
/// The transport collaborator multiplexes one receiver per connection;
/// backpressure and drop policy beyond the bound are its concern.
pub struct OutboundRouter {
    streams: Mutex<HashMap<StoreId, mpsc::Sender<RegionInstruction>>>,
}

impl Default for OutboundRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundRouter {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the outbound stream for a store connection.
    pub fn register(&self, store_id: StoreId) -> mpsc::Receiver<RegionInstruction> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        self.streams.lock().insert(store_id, tx);
        rx
    }

    pub fn deregister(&self, store_id: StoreId) {
        self.streams.lock().remove(&store_id);
    }

    /// Never blocks: a full or closed queue drops the instruction.
    pub fn publish(&self, store_id: StoreId, instruction: RegionInstruction) -> bool {
        let streams = self.streams.lock();
        let Some(tx) = streams.get(&store_id) else {
            return false;
        };
        match tx.try_send(instruction) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(store_id, error = %err, "dropping outbound instruction");
                false
            }
        }
    }
}
