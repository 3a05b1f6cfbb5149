//! Operator admission against store limits: burst accounting, atomic
//! multi-bucket charges and the one-operator-per-region invariant.

mod common;

use std::sync::Arc;

use common::{bootstrapped_cluster, region, region_with_epoch, store, INIT_EPOCH};
use shardpilot::limiter::{OperationKind, StoreLimit};
use shardpilot::meta::RegionEpoch;
use shardpilot::operator::{OpKind, OpStep, Operator};

fn remove_peer_op(region_id: u64, epoch: RegionEpoch, store_id: u64) -> Operator {
    Operator::new(
        "evict-peer",
        region_id,
        epoch,
        OpKind::Region,
        vec![OpStep::RemovePeer { store_id }],
    )
}

#[test]
fn burst_admits_five_pairs_then_rejects_until_bury() {
    let cluster = bootstrapped_cluster();
    cluster.put_store(store(7, "127.0.1.1:7")).unwrap();
    cluster
        .handle_region_heartbeat(region(40, b"a", b"b", 7, 400))
        .unwrap();
    cluster
        .set_store_limit(7, OperationKind::RemovePeer, StoreLimit::with_burst(1.0, 5))
        .unwrap();

    for _ in 0..5 {
        let op = remove_peer_op(40, INIT_EPOCH, 7);
        assert!(cluster.add_operator(op.clone()));
        assert!(cluster.remove_operator(&op));
    }

    let op = remove_peer_op(40, INIT_EPOCH, 7);
    assert!(!cluster.add_operator(op.clone()));
    assert!(!cluster.remove_operator(&op));

    // Burying the store deletes its buckets; admission is no longer
    // throttled on its behalf.
    cluster.bury_store(7, true).unwrap();
    let op = remove_peer_op(40, INIT_EPOCH, 7);
    assert!(cluster.add_operator(op.clone()));
    assert!(cluster.remove_operator(&op));
}

#[test]
fn all_stores_limit_applies_per_store_and_resets() {
    let cluster = bootstrapped_cluster();
    cluster.put_store(store(2, "127.0.1.1:2")).unwrap();
    cluster
        .handle_region_heartbeat(region(41, b"a", b"b", 1, 410))
        .unwrap();
    cluster
        .handle_region_heartbeat(region(42, b"b", b"c", 2, 420))
        .unwrap();

    cluster
        .set_all_stores_limit(OperationKind::RemovePeer, StoreLimit::per_min(1.0))
        .unwrap();

    // Five remove-peer operators per store, independently.
    for _ in 0..5 {
        let op = remove_peer_op(41, INIT_EPOCH, 1);
        assert!(cluster.add_operator(op.clone()));
        assert!(cluster.remove_operator(&op));
    }
    let op = remove_peer_op(41, INIT_EPOCH, 1);
    assert!(!cluster.add_operator(op));

    for _ in 0..5 {
        let op = remove_peer_op(42, INIT_EPOCH, 2);
        assert!(cluster.add_operator(op.clone()));
        assert!(cluster.remove_operator(&op));
    }
    let op = remove_peer_op(42, INIT_EPOCH, 2);
    assert!(!cluster.add_operator(op));

    // Re-applying the all-stores limit reinitializes every bucket.
    cluster
        .set_all_stores_limit(OperationKind::RemovePeer, StoreLimit::per_min(2.0))
        .unwrap();
    for _ in 0..5 {
        let op = remove_peer_op(42, INIT_EPOCH, 2);
        assert!(cluster.add_operator(op.clone()));
        assert!(cluster.remove_operator(&op));
    }
    let op = remove_peer_op(42, INIT_EPOCH, 2);
    assert!(!cluster.add_operator(op));

    // Offline store 1: its RemovePeer bucket becomes Unlimited and far more
    // operators than any burst admit.
    cluster.remove_store(1).unwrap();
    for _ in 0..30 {
        let op = remove_peer_op(41, INIT_EPOCH, 1);
        assert!(cluster.add_operator(op.clone()));
        assert!(cluster.remove_operator(&op));
    }
}

#[test]
fn admission_is_all_or_nothing_across_buckets() {
    let cluster = bootstrapped_cluster();
    cluster.put_store(store(2, "127.0.1.1:2")).unwrap();
    cluster
        .handle_region_heartbeat(region(43, b"a", b"b", 1, 430))
        .unwrap();
    cluster
        .handle_region_heartbeat(region(44, b"b", b"c", 2, 440))
        .unwrap();

    cluster
        .set_store_limit(1, OperationKind::AddPeer, StoreLimit::with_burst(1.0, 1))
        .unwrap();
    cluster
        .set_store_limit(2, OperationKind::RemovePeer, StoreLimit::with_burst(1.0, 5))
        .unwrap();

    // Drain store 1's AddPeer bucket.
    let drain = Operator::new(
        "add-peer",
        43,
        INIT_EPOCH,
        OpKind::Region,
        vec![OpStep::AddPeer {
            store_id: 1,
            peer_id: 431,
        }],
    );
    assert!(cluster.add_operator(drain.clone()));
    assert!(cluster.remove_operator(&drain));

    // A joint move now fails on store 1 and must not debit store 2.
    let joint = Operator::new(
        "move-peer",
        44,
        INIT_EPOCH,
        OpKind::Region,
        vec![
            OpStep::AddPeer {
                store_id: 1,
                peer_id: 441,
            },
            OpStep::RemovePeer { store_id: 2 },
        ],
    );
    assert!(!cluster.add_operator(joint));

    for _ in 0..5 {
        let op = remove_peer_op(44, INIT_EPOCH, 2);
        assert!(cluster.add_operator(op.clone()));
        assert!(cluster.remove_operator(&op));
    }
}

#[test]
fn tokens_are_not_refunded_on_operator_removal() {
    let cluster = bootstrapped_cluster();
    cluster
        .handle_region_heartbeat(region(45, b"a", b"b", 1, 450))
        .unwrap();
    cluster
        .set_store_limit(1, OperationKind::RemovePeer, StoreLimit::with_burst(1.0, 1))
        .unwrap();

    let op = remove_peer_op(45, INIT_EPOCH, 1);
    assert!(cluster.add_operator(op.clone()));
    assert!(cluster.remove_operator(&op));

    // The region slot is free again, but the consumed token is not.
    assert!(!cluster.add_operator(remove_peer_op(45, INIT_EPOCH, 1)));
}

#[test]
fn stale_operator_is_rejected_after_region_advances() {
    let cluster = bootstrapped_cluster();
    cluster
        .handle_region_heartbeat(region_with_epoch(46, b"a", b"b", 1, 460, RegionEpoch::new(3, 1)))
        .unwrap();

    assert!(!cluster.add_operator(remove_peer_op(46, RegionEpoch::new(2, 9), 1)));
    assert!(!cluster.add_operator(remove_peer_op(46, RegionEpoch::new(3, 0), 1)));
    assert!(cluster.add_operator(remove_peer_op(46, RegionEpoch::new(3, 1), 1)));
}

#[test]
fn concurrent_adds_for_one_region_admit_exactly_one() {
    let cluster = Arc::new(bootstrapped_cluster());
    cluster
        .handle_region_heartbeat(region(47, b"a", b"b", 1, 470))
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cluster = cluster.clone();
        handles.push(std::thread::spawn(move || {
            cluster.add_operator(remove_peer_op(47, INIT_EPOCH, 1))
        }));
    }
    let admitted = handles
        .into_iter()
        .map(|h| h.join().expect("join admission thread"))
        .filter(|ok| *ok)
        .count();
    assert_eq!(admitted, 1);
    assert!(cluster.admission().get_operator(47).is_some());
}

#[test]
fn removal_is_idempotent_and_identity_checked() {
    let cluster = bootstrapped_cluster();
    cluster
        .handle_region_heartbeat(region(48, b"a", b"b", 1, 480))
        .unwrap();

    let first = remove_peer_op(48, INIT_EPOCH, 1);
    let imposter = remove_peer_op(48, INIT_EPOCH, 1);
    assert!(cluster.add_operator(first.clone()));

    // A different operator for the same region cannot deregister it.
    assert!(!cluster.remove_operator(&imposter));
    assert!(cluster.remove_operator(&first));
    assert!(!cluster.remove_operator(&first));
}
