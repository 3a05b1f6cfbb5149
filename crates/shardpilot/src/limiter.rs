//! Per-store, per-operation-kind token-bucket rate limiting for relocation
//! work.
//!
//! One bucket exists per `(store, kind)`. `take` never blocks: it consumes
//! a token and returns true, or returns false immediately. All buckets live
//! under a single guard so a multi-step operator can charge several buckets
//! atomically, all-or-nothing.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::meta::StoreId;

/// Relocation operation kind a bucket throttles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    AddPeer,
    RemovePeer,
}

/// Bucket capacity used when a limit is configured without an explicit
/// burst.
pub const DEFAULT_BURST: u64 = 5;

/// Configured limit for one `(store, kind)` bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StoreLimit {
    /// `take` always succeeds and consumes nothing.
    Unlimited,
    /// Token bucket refilling `rate` tokens per minute, capped at `burst`.
    Limited { rate: f64, burst: u64 },
}

impl StoreLimit {
    pub fn per_min(rate: f64) -> Self {
        Self::Limited {
            rate,
            burst: DEFAULT_BURST,
        }
    }

    pub fn with_burst(rate: f64, burst: u64) -> Self {
        Self::Limited {
            rate,
            burst: burst.max(1),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

struct Bucket {
    limit: StoreLimit,
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn new(limit: StoreLimit) -> Self {
        let tokens = match limit {
            StoreLimit::Limited { burst, .. } => burst as f64,
            StoreLimit::Unlimited => 0.0,
        };
        Self {
            limit,
            tokens,
            refilled_at: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let StoreLimit::Limited { rate, burst } = self.limit else {
            return;
        };
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + rate * elapsed / 60.0).min(burst as f64);
        self.refilled_at = now;
    }
}

pub struct StoreLimiter {
    buckets: Mutex<HashMap<(StoreId, OperationKind), Bucket>>,
    defaults: Mutex<HashMap<OperationKind, StoreLimit>>,
}

impl Default for StoreLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
        }
    }

    /// Create or replace the bucket for `(store, kind)`.
    pub fn set_store_limit(&self, store_id: StoreId, kind: OperationKind, limit: StoreLimit) {
        self.buckets
            .lock()
            .insert((store_id, kind), Bucket::new(limit));
    }

    /// Delete both buckets for a store. `take` always succeeds afterwards.
    pub fn remove_store_limit(&self, store_id: StoreId) {
        let mut buckets = self.buckets.lock();
        buckets.remove(&(store_id, OperationKind::AddPeer));
        buckets.remove(&(store_id, OperationKind::RemovePeer));
    }

    /// Record the process-wide default for `kind` and (re)initialize the
    /// bucket of every currently-known store.
    pub fn set_all_stores_limit(&self, kind: OperationKind, limit: StoreLimit, stores: &[StoreId]) {
        self.defaults.lock().insert(kind, limit);
        let mut buckets = self.buckets.lock();
        for store_id in stores {
            buckets.insert((*store_id, kind), Bucket::new(limit));
        }
    }

    /// Give a newly-registered store the recorded defaults, without
    /// clobbering explicitly-configured buckets.
    pub fn apply_default_limits(&self, store_id: StoreId) {
        let defaults = self.defaults.lock().clone();
        let mut buckets = self.buckets.lock();
        for (kind, limit) in defaults {
            buckets
                .entry((store_id, kind))
                .or_insert_with(|| Bucket::new(limit));
        }
    }

    /// Whether any bucket exists for this store.
    pub fn has_limit(&self, store_id: StoreId) -> bool {
        let buckets = self.buckets.lock();
        buckets.contains_key(&(store_id, OperationKind::AddPeer))
            || buckets.contains_key(&(store_id, OperationKind::RemovePeer))
    }

    /// The configured limit for `(store, kind)`, if a bucket exists.
    pub fn limit(&self, store_id: StoreId, kind: OperationKind) -> Option<StoreLimit> {
        self.buckets.lock().get(&(store_id, kind)).map(|b| b.limit)
    }

    /// Non-blocking single take.
    pub fn take(&self, store_id: StoreId, kind: OperationKind) -> bool {
        self.take_all(&[(store_id, kind)])
    }

    /// Consume one token per charge, atomically: if any bucket lacks
    /// tokens, nothing is consumed. A missing bucket never limits.
    pub fn take_all(&self, charges: &[(StoreId, OperationKind)]) -> bool {
        if charges.is_empty() {
            return true;
        }
        let mut needed: HashMap<(StoreId, OperationKind), u64> = HashMap::new();
        for charge in charges {
            *needed.entry(*charge).or_insert(0) += 1;
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        for (key, need) in &needed {
            let Some(bucket) = buckets.get_mut(key) else {
                continue;
            };
            bucket.refill(now);
            match bucket.limit {
                StoreLimit::Unlimited => {}
                StoreLimit::Limited { .. } if bucket.tokens + 1e-9 >= *need as f64 => {}
                StoreLimit::Limited { .. } => return false,
            }
        }
        for (key, need) in &needed {
            if let Some(bucket) = buckets.get_mut(key) {
                if !bucket.limit.is_unlimited() {
                    bucket.tokens -= *need as f64;
                }
            }
        }
        true
    }
}
