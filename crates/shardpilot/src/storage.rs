//! Persistence collaborator: durable saves and startup loading.
//!
//! The core never reads through storage on the heartbeat hot path; saves
//! report success/failure only and loading happens at startup.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::Mutex;

use crate::config::{ClusterMeta, PersistedConfig};
use crate::meta::{Region, RegionId, Store, StoreId};

/// Durable storage interface implemented by the external collaborator.
pub trait Persistence: Send + Sync {
    fn save_meta(&self, meta: &ClusterMeta) -> anyhow::Result<()>;
    fn save_store(&self, store: &Store) -> anyhow::Result<()>;
    fn save_region(&self, region: &Region) -> anyhow::Result<()>;
    fn save_config(&self, config: &PersistedConfig) -> anyhow::Result<()>;
    /// Make previously-accepted saves durable.
    fn flush(&self) -> anyhow::Result<()>;

    fn load_meta(&self) -> anyhow::Result<Option<ClusterMeta>>;
    fn load_config(&self) -> anyhow::Result<Option<PersistedConfig>>;
    fn load_stores(&self) -> anyhow::Result<Vec<Store>>;
    /// Stream every persisted region through `apply`, in id order.
    fn load_regions(&self, apply: &mut dyn FnMut(Region)) -> anyhow::Result<()>;
}

/// In-memory storage for tests and embedders that bring their own
/// durability.
#[derive(Default)]
pub struct MemStorage {
    inner: Mutex<MemInner>,
}

#[derive(Default)]
struct MemInner {
    meta: Option<ClusterMeta>,
    config: Option<PersistedConfig>,
    stores: BTreeMap<StoreId, Store>,
    regions: BTreeMap<RegionId, Region>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemStorage {
    fn save_meta(&self, meta: &ClusterMeta) -> anyhow::Result<()> {
        self.inner.lock().meta = Some(meta.clone());
        Ok(())
    }

    fn save_store(&self, store: &Store) -> anyhow::Result<()> {
        self.inner.lock().stores.insert(store.id(), store.clone());
        Ok(())
    }

    fn save_region(&self, region: &Region) -> anyhow::Result<()> {
        self.inner.lock().regions.insert(region.id, region.clone());
        Ok(())
    }

    fn save_config(&self, config: &PersistedConfig) -> anyhow::Result<()> {
        self.inner.lock().config = Some(config.clone());
        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn load_meta(&self) -> anyhow::Result<Option<ClusterMeta>> {
        Ok(self.inner.lock().meta.clone())
    }

    fn load_config(&self) -> anyhow::Result<Option<PersistedConfig>> {
        Ok(self.inner.lock().config.clone())
    }

    fn load_stores(&self) -> anyhow::Result<Vec<Store>> {
        Ok(self.inner.lock().stores.values().cloned().collect())
    }

    fn load_regions(&self, apply: &mut dyn FnMut(Region)) -> anyhow::Result<()> {
        for region in self.inner.lock().regions.values() {
            apply(region.clone());
        }
        Ok(())
    }
}

/// Fjall-backed storage: one partition per record family, JSON values.
pub struct FjallStorage {
    keyspace: Keyspace,
    meta: PartitionHandle,
    stores: PartitionHandle,
    regions: PartitionHandle,
}

const META_KEY: &str = "cluster";
const CONFIG_KEY: &str = "config";

impl FjallStorage {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path)
            .open()
            .context("open fjall keyspace")?;
        let meta = keyspace.open_partition("meta", PartitionCreateOptions::default())?;
        let stores = keyspace.open_partition("stores", PartitionCreateOptions::default())?;
        let regions = keyspace.open_partition("regions", PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            meta,
            stores,
            regions,
        })
    }
}

impl Persistence for FjallStorage {
    fn save_meta(&self, meta: &ClusterMeta) -> anyhow::Result<()> {
        let value = serde_json::to_vec(meta).context("serialize cluster meta")?;
        self.meta.insert(META_KEY, value)?;
        Ok(())
    }

    fn save_store(&self, store: &Store) -> anyhow::Result<()> {
        let value = serde_json::to_vec(store).context("serialize store")?;
        self.stores.insert(store.id().to_be_bytes(), value)?;
        Ok(())
    }

    fn save_region(&self, region: &Region) -> anyhow::Result<()> {
        let value = serde_json::to_vec(region).context("serialize region")?;
        self.regions.insert(region.id.to_be_bytes(), value)?;
        Ok(())
    }

    fn save_config(&self, config: &PersistedConfig) -> anyhow::Result<()> {
        let value = serde_json::to_vec(config).context("serialize config")?;
        self.meta.insert(CONFIG_KEY, value)?;
        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(PersistMode::SyncData)
            .context("persist fjall keyspace")
    }

    fn load_meta(&self) -> anyhow::Result<Option<ClusterMeta>> {
        match self.meta.get(META_KEY)? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("decode cluster meta")?,
            )),
            None => Ok(None),
        }
    }

    fn load_config(&self) -> anyhow::Result<Option<PersistedConfig>> {
        match self.meta.get(CONFIG_KEY)? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("decode config")?,
            )),
            None => Ok(None),
        }
    }

    fn load_stores(&self) -> anyhow::Result<Vec<Store>> {
        let mut out = Vec::new();
        for item in self.stores.iter() {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value).context("decode store")?);
        }
        Ok(out)
    }

    fn load_regions(&self, apply: &mut dyn FnMut(Region)) -> anyhow::Result<()> {
        for item in self.regions.iter() {
            let (_, value) = item?;
            apply(serde_json::from_slice(&value).context("decode region")?);
        }
        Ok(())
    }
}
