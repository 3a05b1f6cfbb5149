//! Shared builders for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use shardpilot::cluster::Cluster;
use shardpilot::meta::{Peer, Region, RegionEpoch, StoreMeta};
use shardpilot::storage::MemStorage;

pub const INIT_EPOCH: RegionEpoch = RegionEpoch {
    version: 1,
    conf_ver: 1,
};

/// Best-effort tracing init; repeated calls are fine.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn new_cluster() -> Cluster {
    init_tracing();
    Cluster::new(1, Arc::new(MemStorage::new()))
}

/// Store 1 at `127.0.0.1:0` plus the full-keyspace region 2, as the first
/// node would bootstrap it.
pub fn bootstrap(cluster: &Cluster) {
    let store = StoreMeta::new(1, "127.0.0.1:0");
    let region = Region::new(2, Vec::new(), Vec::new(), INIT_EPOCH, vec![Peer::voter(3, 1)])
        .with_leader(3);
    cluster.bootstrap(store, region).expect("bootstrap cluster");
}

pub fn bootstrapped_cluster() -> Cluster {
    let cluster = new_cluster();
    bootstrap(&cluster);
    cluster
}

pub fn store(id: u64, addr: &str) -> StoreMeta {
    StoreMeta::new(id, addr).with_version("4.0.0")
}

/// Single-peer region led from `store_id`.
pub fn region(id: u64, start: &[u8], end: &[u8], store_id: u64, peer_id: u64) -> Region {
    region_with_epoch(id, start, end, store_id, peer_id, INIT_EPOCH)
}

pub fn region_with_epoch(
    id: u64,
    start: &[u8],
    end: &[u8],
    store_id: u64,
    peer_id: u64,
    epoch: RegionEpoch,
) -> Region {
    Region::new(
        id,
        start.to_vec(),
        end.to_vec(),
        epoch,
        vec![Peer::voter(peer_id, store_id)],
    )
    .with_leader(peer_id)
}
