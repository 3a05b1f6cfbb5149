//! Single gatekeeper deciding which proposed operators become active.
//!
//! All admission checks and the registration run under one critical
//! section, so two operators can never be admitted for the same region in
//! a race window.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::limiter::StoreLimiter;
use crate::meta::RegionId;
use crate::operator::Operator;
use crate::topology::ClusterTopology;

pub struct OperatorAdmission {
    topology: Arc<ClusterTopology>,
    limiter: Arc<StoreLimiter>,
    active: Mutex<HashMap<RegionId, Operator>>,
}

impl OperatorAdmission {
    pub fn new(topology: Arc<ClusterTopology>, limiter: Arc<StoreLimiter>) -> Self {
        Self {
            topology,
            limiter,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Admit `op`. Rejection (false) has no side effect: no token is
    /// consumed and nothing is registered.
    pub fn add_operator(&self, op: Operator) -> bool {
        let mut active = self.active.lock();

        if active.contains_key(&op.region_id) {
            tracing::debug!(
                region_id = op.region_id,
                desc = %op.desc,
                "rejecting operator: region already has an active operator"
            );
            return false;
        }

        let Some(region) = self.topology.get_region_by_id(op.region_id) else {
            tracing::debug!(region_id = op.region_id, "rejecting operator for unknown region");
            return false;
        };
        if op.epoch < region.epoch {
            tracing::debug!(
                region_id = op.region_id,
                op_epoch = ?op.epoch,
                current_epoch = ?region.epoch,
                "rejecting operator with stale epoch"
            );
            return false;
        }

        if !self.limiter.take_all(&op.charges()) {
            tracing::debug!(
                region_id = op.region_id,
                desc = %op.desc,
                "rejecting operator: store limit exhausted"
            );
            return false;
        }

        active.insert(op.region_id, op);
        true
    }

    /// Deregister `op` if it is the currently active operator for its
    /// region. Idempotent: a second call returns false. Consumed tokens are
    /// not refunded; they model throughput, not leases.
    pub fn remove_operator(&self, op: &Operator) -> bool {
        let mut active = self.active.lock();
        match active.get(&op.region_id) {
            Some(current) if current.seq() == op.seq() => {
                active.remove(&op.region_id);
                true
            }
            _ => false,
        }
    }

    pub fn get_operator(&self, region_id: RegionId) -> Option<Operator> {
        self.active.lock().get(&region_id).cloned()
    }

    pub fn operator_count(&self) -> usize {
        self.active.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::{OperationKind, StoreLimit};
    use crate::meta::{Peer, Region, RegionEpoch};
    use crate::operator::{OpKind, OpStep};

    fn harness() -> (Arc<ClusterTopology>, Arc<StoreLimiter>, OperatorAdmission) {
        let topology = Arc::new(ClusterTopology::new());
        let limiter = Arc::new(StoreLimiter::new());
        let admission = OperatorAdmission::new(topology.clone(), limiter.clone());
        (topology, limiter, admission)
    }

    fn seed_region(topology: &ClusterTopology, id: u64, epoch: RegionEpoch) {
        topology.put_region(Region::new(
            id,
            Vec::new(),
            Vec::new(),
            epoch,
            vec![Peer::voter(id + 100, 1)],
        ));
    }

    fn remove_peer_op(region_id: u64, epoch: RegionEpoch, store_id: u64) -> Operator {
        Operator::new(
            "test",
            region_id,
            epoch,
            OpKind::Region,
            vec![OpStep::RemovePeer { store_id }],
        )
    }

    #[test]
    fn at_most_one_active_operator_per_region() {
        let (topology, _, admission) = harness();
        seed_region(&topology, 1, RegionEpoch::new(1, 1));

        let first = remove_peer_op(1, RegionEpoch::new(1, 1), 1);
        let second = remove_peer_op(1, RegionEpoch::new(1, 1), 1);
        assert!(admission.add_operator(first.clone()));
        assert!(!admission.add_operator(second.clone()));

        assert!(admission.remove_operator(&first));
        assert!(!admission.remove_operator(&first));
        assert!(admission.add_operator(second));
    }

    #[test]
    fn stale_epoch_is_rejected() {
        let (topology, _, admission) = harness();
        seed_region(&topology, 1, RegionEpoch::new(2, 2));

        assert!(!admission.add_operator(remove_peer_op(1, RegionEpoch::new(1, 1), 1)));
        assert!(!admission.add_operator(remove_peer_op(1, RegionEpoch::new(2, 1), 1)));
        assert!(admission.add_operator(remove_peer_op(1, RegionEpoch::new(2, 2), 1)));
    }

    #[test]
    fn unknown_region_is_rejected() {
        let (_, _, admission) = harness();
        assert!(!admission.add_operator(remove_peer_op(99, RegionEpoch::new(1, 1), 1)));
    }

    #[test]
    fn exhausted_limit_rejects_without_registration() {
        let (topology, limiter, admission) = harness();
        seed_region(&topology, 1, RegionEpoch::new(1, 1));
        seed_region(&topology, 2, RegionEpoch::new(1, 1));
        limiter.set_store_limit(7, OperationKind::RemovePeer, StoreLimit::with_burst(1.0, 1));

        assert!(admission.add_operator(remove_peer_op(1, RegionEpoch::new(1, 1), 7)));
        assert!(!admission.add_operator(remove_peer_op(2, RegionEpoch::new(1, 1), 7)));
        assert!(admission.get_operator(2).is_none());
        assert_eq!(admission.operator_count(), 1);
    }

    #[test]
    fn concurrent_adds_admit_exactly_one() {
        let (topology, _, admission) = harness();
        seed_region(&topology, 1, RegionEpoch::new(1, 1));
        let admission = Arc::new(admission);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let admission = admission.clone();
            handles.push(std::thread::spawn(move || {
                admission.add_operator(remove_peer_op(1, RegionEpoch::new(1, 1), 1))
            }));
        }
        let admitted = handles
            .into_iter()
            .map(|h| h.join().expect("join add thread"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(admission.operator_count(), 1);
    }
}
