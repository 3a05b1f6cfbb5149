//! Cluster context object: store lifecycle, request handlers and
//! background upkeep.
//!
//! One explicitly-constructed `Cluster` owns the topology, limiter,
//! admission gate, replication state and configuration, and is passed by
//! reference to all handlers. No handler performs blocking I/O inline;
//! durable flushes run on the background loop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::admission::OperatorAdmission;
use crate::config::{
    add_label_property, remove_label_property, ClusterMeta, Options, ReplicationConfig,
    ScheduleConfig, StoreLimitConfig,
};
use crate::error::{ClusterError, Result};
use crate::heartbeat::{HeartbeatIngestor, HeartbeatOutcome, OutboundRouter, RegionInstruction};
use crate::id::IdAllocator;
use crate::limiter::{OperationKind, StoreLimit, StoreLimiter};
use crate::meta::{Region, RegionId, Store, StoreId, StoreMeta, StoreState, StoreStats};
use crate::operator::Operator;
use crate::replication::{ReplicationState, ReplicationStatus};
use crate::storage::Persistence;
use crate::topology::ClusterTopology;

/// Interval between background flushes of the persistence collaborator.
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

pub struct Cluster {
    meta: RwLock<ClusterMeta>,
    topology: Arc<ClusterTopology>,
    limiter: Arc<StoreLimiter>,
    admission: OperatorAdmission,
    ingestor: HeartbeatIngestor,
    outbound: OutboundRouter,
    replication: ReplicationState,
    options: Options,
    storage: Arc<dyn Persistence>,
    id_alloc: IdAllocator,
    bootstrapped: AtomicBool,
    regions_loaded: AtomicBool,
    // Regions mutated by heartbeats since the last flush point.
    dirty_regions: Mutex<HashSet<RegionId>>,
    // Serializes store registration and lifecycle writes; heartbeats and
    // region ingestion never take it.
    store_mu: Mutex<()>,
    flush_interval: Duration,
    background: Mutex<Option<Background>>,
}

struct Background {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Cluster {
    pub fn new(cluster_id: u64, storage: Arc<dyn Persistence>) -> Self {
        let topology = Arc::new(ClusterTopology::new());
        let limiter = Arc::new(StoreLimiter::new());
        Self {
            meta: RwLock::new(ClusterMeta::new(cluster_id)),
            admission: OperatorAdmission::new(topology.clone(), limiter.clone()),
            ingestor: HeartbeatIngestor::new(topology.clone()),
            outbound: OutboundRouter::new(),
            replication: ReplicationState::default(),
            options: Options::new(),
            topology,
            limiter,
            storage,
            id_alloc: IdAllocator::new(1000),
            bootstrapped: AtomicBool::new(false),
            regions_loaded: AtomicBool::new(false),
            dirty_regions: Mutex::new(HashSet::new()),
            store_mu: Mutex::new(()),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            background: Mutex::new(None),
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn limiter(&self) -> &StoreLimiter {
        &self.limiter
    }

    pub fn admission(&self) -> &OperatorAdmission {
        &self.admission
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn id_allocator(&self) -> &IdAllocator {
        &self.id_alloc
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    fn check_bootstrapped(&self) -> Result<()> {
        if self.is_bootstrapped() {
            Ok(())
        } else {
            Err(ClusterError::NotBootstrapped)
        }
    }

    /// Seed the cluster with its first store and the full-keyspace region.
    pub fn bootstrap(&self, store: StoreMeta, region: Region) -> Result<ReplicationStatus> {
        let _guard = self.store_mu.lock();
        if self.is_bootstrapped() {
            return Err(ClusterError::AlreadyBootstrapped);
        }

        let meta = self.meta.read().clone();
        let store = Store::new(store);
        self.storage
            .save_meta(&meta)
            .map_err(ClusterError::Persistence)?;
        self.storage
            .save_store(&store)
            .map_err(ClusterError::Persistence)?;
        self.storage
            .save_region(&region)
            .map_err(ClusterError::Persistence)?;

        let store_id = store.id();
        self.id_alloc.seed(store_id.max(region.id));
        self.topology.put_store(store)?;
        self.limiter.apply_default_limits(store_id);
        self.topology.put_region(region);
        self.bootstrapped.store(true, Ordering::SeqCst);
        tracing::info!(cluster_id = meta.id, store_id, "cluster bootstrapped");
        Ok(self.replication.status())
    }

    /// Register or update a store.
    ///
    /// Lifecycle state never changes here; it only moves through
    /// [`Cluster::remove_store`] and [`Cluster::bury_store`]. A tombstoned
    /// id rejects same-address updates, but a rebuilt node may re-register
    /// the id under a new address (the record stays tombstoned and its
    /// identity retired).
    pub fn put_store(&self, meta: StoreMeta) -> Result<ReplicationStatus> {
        self.check_bootstrapped()?;
        let _guard = self.store_mu.lock();

        let store_id = meta.id;
        let existing = self.topology.get_store(store_id);
        let next = match &existing {
            Some(current) if current.is_tombstone() => {
                if current.meta.address == meta.address {
                    return Err(ClusterError::StoreTombstoned(store_id));
                }
                let mut updated = Store::clone(current);
                updated.meta.address = meta.address;
                updated.meta.version = meta.version;
                updated.meta.labels = meta.labels;
                updated
            }
            Some(current) => {
                let mut updated = Store::clone(current);
                updated.meta.address = meta.address;
                updated.meta.version = meta.version;
                updated.meta.labels = meta.labels;
                updated
            }
            None => Store::new(meta),
        };

        self.topology.check_address_conflict(&next)?;
        self.storage
            .save_store(&next)
            .map_err(ClusterError::Persistence)?;
        self.topology.put_store(next)?;
        if existing.is_none() {
            self.limiter.apply_default_limits(store_id);
            tracing::info!(store_id, "store registered");
        }
        Ok(self.replication.status())
    }

    pub fn get_store(&self, store_id: StoreId) -> Option<Arc<Store>> {
        self.topology.get_store(store_id)
    }

    pub fn get_all_stores(&self) -> Vec<Arc<Store>> {
        self.topology.get_all_stores()
    }

    pub fn store_count(&self) -> usize {
        self.topology.store_count()
    }

    /// Up -> Offline. Idempotent for an already-offline store; a tombstoned
    /// store can never come back.
    pub fn remove_store(&self, store_id: StoreId) -> Result<()> {
        self.check_bootstrapped()?;
        let _guard = self.store_mu.lock();

        let store = self
            .topology
            .get_store(store_id)
            .ok_or(ClusterError::StoreNotFound(store_id))?;
        match store.state() {
            StoreState::Tombstone => Err(ClusterError::StoreTombstoned(store_id)),
            StoreState::Offline => Ok(()),
            StoreState::Up => {
                let mut updated = Store::clone(&store);
                updated.meta.state = StoreState::Offline;
                self.storage
                    .save_store(&updated)
                    .map_err(ClusterError::Persistence)?;
                self.topology.put_store(updated)?;
                // Fast evacuation: stop throttling peer removals from a
                // draining store.
                self.limiter
                    .set_store_limit(store_id, OperationKind::RemovePeer, StoreLimit::Unlimited);
                tracing::info!(store_id, "store marked offline");
                Ok(())
            }
        }
    }

    /// Offline -> Tombstone (Up -> Tombstone only with `force`). Idempotent
    /// for an already-buried store.
    pub fn bury_store(&self, store_id: StoreId, force: bool) -> Result<()> {
        self.check_bootstrapped()?;
        let _guard = self.store_mu.lock();

        let store = self
            .topology
            .get_store(store_id)
            .ok_or(ClusterError::StoreNotFound(store_id))?;
        match store.state() {
            StoreState::Tombstone => Ok(()),
            StoreState::Up if !force => Err(ClusterError::StoreNotOffline(store_id)),
            StoreState::Up | StoreState::Offline => {
                let mut updated = Store::clone(&store);
                updated.meta.state = StoreState::Tombstone;
                self.storage
                    .save_store(&updated)
                    .map_err(ClusterError::Persistence)?;

                let mut next = self.options.persisted();
                next.schedule.store_limit.remove(&store_id);
                self.storage
                    .save_config(&next)
                    .map_err(ClusterError::Persistence)?;

                self.topology.put_store(updated)?;
                self.options.apply(next);
                self.limiter.remove_store_limit(store_id);
                self.outbound.deregister(store_id);
                tracing::info!(store_id, force, "store buried");
                Ok(())
            }
        }
    }

    /// Refresh a store's rolling stats. Fails `Tombstoned` after bury.
    pub fn store_heartbeat(&self, stats: StoreStats) -> Result<ReplicationStatus> {
        self.check_bootstrapped()?;
        let store_id = stats.store_id;
        let store = self
            .topology
            .get_store(store_id)
            .ok_or(ClusterError::StoreNotFound(store_id))?;
        if store.is_tombstone() {
            return Err(ClusterError::StoreTombstoned(store_id));
        }
        self.topology.update_store_stats(stats, unix_time_ms());
        Ok(self.replication.status())
    }

    pub fn handle_region_heartbeat(&self, report: Region) -> Result<HeartbeatOutcome> {
        self.check_bootstrapped()?;
        let region_id = report.id;
        let outcome = self.ingestor.handle_report(report)?;
        if outcome == HeartbeatOutcome::Applied {
            self.dirty_regions.lock().insert(region_id);
        }
        Ok(outcome)
    }

    /// Explicit flush point: persist regions dirtied by heartbeats, then
    /// make prior saves durable. A save failure is local to the offending
    /// region; it stays dirty and the next flush retries it.
    pub fn flush(&self) -> Result<()> {
        let dirty: Vec<RegionId> = self.dirty_regions.lock().drain().collect();
        for region_id in dirty {
            let Some(region) = self.topology.get_region_by_id(region_id) else {
                continue;
            };
            if let Err(err) = self.storage.save_region(&region) {
                self.dirty_regions.lock().insert(region_id);
                tracing::warn!(region_id, error = ?err, "region flush failed");
            }
        }
        self.storage.flush().map_err(ClusterError::Persistence)
    }

    pub fn get_region(&self, key: &[u8]) -> Option<Arc<Region>> {
        self.topology.get_region(key)
    }

    pub fn get_region_by_id(&self, region_id: RegionId) -> Option<Arc<Region>> {
        self.topology.get_region_by_id(region_id)
    }

    pub fn region_count(&self) -> usize {
        self.topology.region_count()
    }

    pub fn get_cluster_config(&self) -> ClusterMeta {
        self.meta.read().clone()
    }

    pub fn set_cluster_config(&self, meta: ClusterMeta) -> Result<()> {
        self.storage
            .save_meta(&meta)
            .map_err(ClusterError::Persistence)?;
        *self.meta.write() = meta;
        Ok(())
    }

    pub fn set_schedule_config(&self, schedule: ScheduleConfig) -> Result<()> {
        let mut next = self.options.persisted();
        next.schedule = schedule;
        self.storage
            .save_config(&next)
            .map_err(ClusterError::Persistence)?;
        self.options.apply(next);
        Ok(())
    }

    pub fn set_replication_config(&self, replication: ReplicationConfig) -> Result<()> {
        let mut next = self.options.persisted();
        next.replication = replication;
        self.storage
            .save_config(&next)
            .map_err(ClusterError::Persistence)?;
        self.options.apply(next);
        Ok(())
    }

    pub fn set_label_property(&self, typ: &str, key: &str, value: &str) -> Result<()> {
        let mut next = self.options.persisted();
        add_label_property(
            &mut next.label_property,
            typ,
            crate::meta::StoreLabel::new(key, value),
        );
        self.storage
            .save_config(&next)
            .map_err(ClusterError::Persistence)?;
        self.options.apply(next);
        Ok(())
    }

    pub fn delete_label_property(&self, typ: &str, key: &str, value: &str) -> Result<()> {
        let mut next = self.options.persisted();
        remove_label_property(
            &mut next.label_property,
            typ,
            &crate::meta::StoreLabel::new(key, value),
        );
        self.storage
            .save_config(&next)
            .map_err(ClusterError::Persistence)?;
        self.options.apply(next);
        Ok(())
    }

    /// Configure one `(store, kind)` bucket, persisted with the schedule
    /// config.
    pub fn set_store_limit(
        &self,
        store_id: StoreId,
        kind: OperationKind,
        limit: StoreLimit,
    ) -> Result<()> {
        let mut next = self.options.persisted();
        let entry = next
            .schedule
            .store_limit
            .entry(store_id)
            .or_insert_with(StoreLimitConfig::default);
        match kind {
            OperationKind::AddPeer => entry.add_peer = limit,
            OperationKind::RemovePeer => entry.remove_peer = limit,
        }
        self.storage
            .save_config(&next)
            .map_err(ClusterError::Persistence)?;
        self.options.apply(next);
        self.limiter.set_store_limit(store_id, kind, limit);
        Ok(())
    }

    pub fn remove_store_limit(&self, store_id: StoreId) -> Result<()> {
        let mut next = self.options.persisted();
        next.schedule.store_limit.remove(&store_id);
        self.storage
            .save_config(&next)
            .map_err(ClusterError::Persistence)?;
        self.options.apply(next);
        self.limiter.remove_store_limit(store_id);
        Ok(())
    }

    /// (Re)initialize the `kind` bucket of every known non-tombstone store
    /// and record the default for stores registered later. Recovers from a
    /// missing-limits condition across a restart.
    pub fn set_all_stores_limit(&self, kind: OperationKind, limit: StoreLimit) -> Result<()> {
        let stores: Vec<StoreId> = self
            .topology
            .get_all_stores()
            .iter()
            .filter(|s| !s.is_tombstone())
            .map(|s| s.id())
            .collect();

        let mut next = self.options.persisted();
        for store_id in &stores {
            let entry = next
                .schedule
                .store_limit
                .entry(*store_id)
                .or_insert_with(StoreLimitConfig::default);
            match kind {
                OperationKind::AddPeer => entry.add_peer = limit,
                OperationKind::RemovePeer => entry.remove_peer = limit,
            }
        }
        self.storage
            .save_config(&next)
            .map_err(ClusterError::Persistence)?;
        self.options.apply(next);
        self.limiter.set_all_stores_limit(kind, limit, &stores);
        Ok(())
    }

    /// Admit a proposed operator; on success its steps are published to the
    /// target region's reporting store.
    pub fn add_operator(&self, op: Operator) -> bool {
        if !self.admission.add_operator(op.clone()) {
            return false;
        }
        self.dispatch_operator(&op);
        true
    }

    pub fn remove_operator(&self, op: &Operator) -> bool {
        self.admission.remove_operator(op)
    }

    fn dispatch_operator(&self, op: &Operator) {
        let Some(region) = self.topology.get_region_by_id(op.region_id) else {
            return;
        };
        let Some(target) = region.origin_store() else {
            return;
        };
        for step in &op.steps {
            self.outbound.publish(
                target,
                RegionInstruction {
                    region_id: op.region_id,
                    epoch: region.epoch,
                    step: *step,
                },
            );
        }
    }

    /// Outbound half of a store's heartbeat stream; the transport
    /// collaborator drains the receiver.
    pub fn register_heartbeat_stream(&self, store_id: StoreId) -> mpsc::Receiver<RegionInstruction> {
        self.outbound.register(store_id)
    }

    pub fn replication_status(&self) -> ReplicationStatus {
        self.replication.status()
    }

    /// Hook for the external replication monitor.
    pub fn set_replication_status(&self, status: ReplicationStatus) {
        self.replication.set_status(status);
    }

    /// Rebuild topology and configuration from storage. Returns false when
    /// storage holds no bootstrapped cluster.
    pub fn load_cluster_info(&self) -> Result<bool> {
        let Some(meta) = self.storage.load_meta().map_err(ClusterError::Persistence)? else {
            return Ok(false);
        };
        *self.meta.write() = meta;

        if let Some(config) = self
            .storage
            .load_config()
            .map_err(ClusterError::Persistence)?
        {
            self.options.apply(config);
        }
        let schedule = self.options.schedule();
        for (store_id, limits) in &schedule.store_limit {
            self.limiter
                .set_store_limit(*store_id, OperationKind::AddPeer, limits.add_peer);
            self.limiter
                .set_store_limit(*store_id, OperationKind::RemovePeer, limits.remove_peer);
        }

        let mut max_id = 0u64;
        for store in self.storage.load_stores().map_err(ClusterError::Persistence)? {
            max_id = max_id.max(store.id());
            self.topology.put_store(store)?;
        }
        let mut loaded = 0usize;
        self.storage
            .load_regions(&mut |region| {
                max_id = max_id.max(region.id);
                self.topology.put_region(region);
                loaded += 1;
            })
            .map_err(ClusterError::Persistence)?;
        self.id_alloc.seed(max_id);
        self.regions_loaded.store(true, Ordering::SeqCst);
        self.bootstrapped.store(true, Ordering::SeqCst);
        tracing::info!(
            stores = self.store_count(),
            regions = loaded,
            "cluster info loaded"
        );
        Ok(true)
    }

    /// One-shot region load for deployments that only persist regions
    /// lazily; subsequent calls are no-ops once regions have been loaded.
    pub fn load_regions_once(&self) -> Result<()> {
        if self.regions_loaded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.storage
            .load_regions(&mut |region| {
                self.topology.put_region(region);
            })
            .map_err(ClusterError::Persistence)
    }

    /// Spawn the background flush loop. A no-op while already running.
    pub fn start(self: &Arc<Self>) {
        let mut background = self.background.lock();
        if background.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let cluster = Arc::clone(self);
        let interval = self.flush_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = cluster.flush() {
                            tracing::warn!(error = ?err, "background flush failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("background flush loop stopped");
        });
        *background = Some(Background { shutdown, task });
    }

    /// Stop the background loop and wait for it to exit. Safe to call
    /// repeatedly and to interleave with `start`.
    pub async fn stop(&self) {
        let background = self.background.lock().take();
        if let Some(background) = background {
            let _ = background.shutdown.send(true);
            if let Err(err) = background.task.await {
                tracing::warn!(error = ?err, "background flush task join failed");
            }
        }
    }
}

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
