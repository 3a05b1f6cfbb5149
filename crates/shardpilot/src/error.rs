//! Error taxonomy for the cluster core.
//!
//! Expected control-flow outcomes (a stale heartbeat, a rejected operator)
//! are ordinary return values, not errors; only genuine faults and invalid
//! requests surface here.

use thiserror::Error;

use crate::meta::{RegionId, StoreId};

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster is already bootstrapped")]
    AlreadyBootstrapped,

    #[error("cluster is not bootstrapped")]
    NotBootstrapped,

    /// Address uniqueness is enforced among all non-tombstone stores.
    #[error("store address {address} is already used by store {conflict}")]
    DuplicateAddress { address: String, conflict: StoreId },

    #[error("store {0} not found")]
    StoreNotFound(StoreId),

    #[error("region {0} not found")]
    RegionNotFound(RegionId),

    /// Any write targeting a buried store.
    #[error("store {0} is tombstoned")]
    StoreTombstoned(StoreId),

    /// Burying an Up store requires `force`.
    #[error("store {0} is still up; offline it first or bury with force")]
    StoreNotOffline(StoreId),

    #[error("invalid region report for region {0}: {1}")]
    InvalidReport(RegionId, &'static str),

    /// The external storage collaborator failed; the in-memory side effect
    /// of the failed write was not applied.
    #[error("persistence failure: {0}")]
    Persistence(#[source] anyhow::Error),
}
