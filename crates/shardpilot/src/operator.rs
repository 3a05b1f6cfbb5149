//! Relocation operators proposed by an external scheduler.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::limiter::OperationKind;
use crate::meta::{PeerId, RegionEpoch, RegionId, StoreId};

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// One step of a relocation operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStep {
    AddPeer { store_id: StoreId, peer_id: PeerId },
    RemovePeer { store_id: StoreId },
}

impl OpStep {
    /// The limiter bucket this step charges: the target store for peer
    /// additions, the source store for removals.
    pub fn charge(&self) -> (StoreId, OperationKind) {
        match *self {
            OpStep::AddPeer { store_id, .. } => (store_id, OperationKind::AddPeer),
            OpStep::RemovePeer { store_id } => (store_id, OperationKind::RemovePeer),
        }
    }
}

/// Coarse operator category, carried for observability and prioritization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Leader,
    Region,
    Admin,
}

/// A proposed relocation for one region. At most one operator per region is
/// ever active; admission is decided by [`crate::admission::OperatorAdmission`].
#[derive(Debug, Clone)]
pub struct Operator {
    seq: u64,
    pub desc: String,
    pub region_id: RegionId,
    /// Region epoch observed when the operator was proposed. Admission
    /// rejects the operator once the region has moved past it.
    pub epoch: RegionEpoch,
    pub kind: OpKind,
    pub steps: Vec<OpStep>,
}

impl Operator {
    pub fn new(
        desc: impl Into<String>,
        region_id: RegionId,
        epoch: RegionEpoch,
        kind: OpKind,
        steps: Vec<OpStep>,
    ) -> Self {
        Self {
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            desc: desc.into(),
            region_id,
            epoch,
            kind,
            steps,
        }
    }

    /// Process-unique identity assigned at construction; clones share it.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn charges(&self) -> Vec<(StoreId, OperationKind)> {
        self.steps.iter().map(OpStep::charge).collect()
    }
}
