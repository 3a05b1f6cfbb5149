//! In-memory cluster topology: store and region tables with a key-range
//! index for O(log n) key routing.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::{ClusterError, Result};
use crate::meta::{Region, RegionId, Store, StoreId, StoreStats};

const LOCK_STRIPES: usize = 64;

/// Striped locks serializing mutations to one entity id while unrelated
/// entities proceed in parallel.
struct LockTable {
    stripes: Vec<Mutex<()>>,
}

impl LockTable {
    fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, id: u64) -> MutexGuard<'_, ()> {
        self.stripes[(id as usize) % LOCK_STRIPES].lock()
    }
}

#[derive(Default)]
struct RegionTable {
    by_id: HashMap<RegionId, Arc<Region>>,
    // start_key -> region id, maintained alongside `by_id` for key routing.
    by_start: BTreeMap<Vec<u8>, RegionId>,
}

pub struct ClusterTopology {
    stores: RwLock<HashMap<StoreId, Arc<Store>>>,
    regions: RwLock<RegionTable>,
    region_locks: LockTable,
}

impl Default for ClusterTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterTopology {
    pub fn new() -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            regions: RwLock::new(RegionTable::default()),
            region_locks: LockTable::new(),
        }
    }

    /// Serialize report application for one region id.
    pub(crate) fn lock_region(&self, id: RegionId) -> MutexGuard<'_, ()> {
        self.region_locks.lock(id)
    }

    /// Upsert a store record, enforcing address uniqueness among all
    /// non-tombstone stores. Tombstone records are exempt and retained.
    pub fn put_store(&self, store: Store) -> Result<()> {
        let mut stores = self.stores.write();
        if !store.is_tombstone() {
            if let Some(conflict) = stores.values().find(|s| {
                s.id() != store.id() && !s.is_tombstone() && s.meta.address == store.meta.address
            }) {
                return Err(ClusterError::DuplicateAddress {
                    address: store.meta.address.clone(),
                    conflict: conflict.id(),
                });
            }
        }
        stores.insert(store.id(), Arc::new(store));
        Ok(())
    }

    /// Read-only duplicate-address probe used before persisting a record.
    pub fn check_address_conflict(&self, store: &Store) -> Result<()> {
        if store.is_tombstone() {
            return Ok(());
        }
        let stores = self.stores.read();
        match stores.values().find(|s| {
            s.id() != store.id() && !s.is_tombstone() && s.meta.address == store.meta.address
        }) {
            Some(conflict) => Err(ClusterError::DuplicateAddress {
                address: store.meta.address.clone(),
                conflict: conflict.id(),
            }),
            None => Ok(()),
        }
    }

    pub fn get_store(&self, id: StoreId) -> Option<Arc<Store>> {
        self.stores.read().get(&id).cloned()
    }

    pub fn get_all_stores(&self) -> Vec<Arc<Store>> {
        let mut stores: Vec<_> = self.stores.read().values().cloned().collect();
        stores.sort_by_key(|s| s.id());
        stores
    }

    pub fn store_count(&self) -> usize {
        self.stores.read().len()
    }

    /// Refresh a store's liveness instant.
    pub fn touch_store(&self, id: StoreId, now_ms: u64) {
        let mut stores = self.stores.write();
        if let Some(existing) = stores.get(&id) {
            let mut updated = Store::clone(existing);
            updated.last_heartbeat_ms = now_ms;
            stores.insert(id, Arc::new(updated));
        }
    }

    /// Replace a store's rolling stats and refresh liveness.
    pub fn update_store_stats(&self, stats: StoreStats, now_ms: u64) -> bool {
        let mut stores = self.stores.write();
        match stores.get(&stats.store_id) {
            Some(existing) => {
                let mut updated = Store::clone(existing);
                updated.stats = stats;
                updated.last_heartbeat_ms = now_ms;
                stores.insert(stats.store_id, Arc::new(updated));
                true
            }
            None => false,
        }
    }

    /// Upsert a region and re-index its key range. The old indexed range is
    /// removed first so a moved/shrunk range cannot leave duplicate coverage.
    pub fn put_region(&self, region: Region) -> Arc<Region> {
        let region = Arc::new(region);
        let mut table = self.regions.write();
        if let Some(old) = table.by_id.insert(region.id, region.clone()) {
            if table.by_start.get(&old.start_key) == Some(&old.id) {
                table.by_start.remove(&old.start_key);
            }
        }
        table.by_start.insert(region.start_key.clone(), region.id);
        region
    }

    /// Region containing `key`, resolved through the range index.
    pub fn get_region(&self, key: &[u8]) -> Option<Arc<Region>> {
        let table = self.regions.read();
        let (_, id) = table
            .by_start
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()?;
        let region = table.by_id.get(id)?;
        region.contains_key(key).then(|| region.clone())
    }

    pub fn get_region_by_id(&self, id: RegionId) -> Option<Arc<Region>> {
        self.regions.read().by_id.get(&id).cloned()
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().by_id.len()
    }
}
