//! Discovered partitions per asset and the read-mostly cache around them.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use sluice_core::{BatchIdentifiers, Result, TableRef};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

/// Where a discovered partition's rows live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionSource {
    /// Object key relative to the connector's location.
    File(String),
    Table(TableRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub batch_identifiers: BatchIdentifiers,
    pub source: PartitionSource,
}

/// Partitions keyed by asset name, each list sorted by identifiers.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    assets: BTreeMap<String, Vec<Partition>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asset even if it ends up with no partitions.
    pub fn declare_asset(&mut self, asset: impl Into<String>) {
        self.assets.entry(asset.into()).or_default();
    }

    /// Add a partition; a second partition with the same identifiers is
    /// dropped with a warning.
    pub fn insert(&mut self, asset: impl Into<String>, partition: Partition) {
        let asset = asset.into();
        let partitions = self.assets.entry(asset.clone()).or_default();
        match partitions.binary_search_by(|p| p.batch_identifiers.cmp(&partition.batch_identifiers)) {
            Ok(existing) => warn!(
                asset = %asset,
                kept = ?partitions[existing].source,
                dropped = ?partition.source,
                "Duplicate partition identifiers"
            ),
            Err(pos) => partitions.insert(pos, partition),
        }
    }

    pub fn asset_names(&self) -> BTreeSet<String> {
        self.assets.keys().cloned().collect()
    }

    pub fn contains(&self, asset: &str) -> bool {
        self.assets.contains_key(asset)
    }

    pub fn partitions(&self, asset: &str) -> Option<&[Partition]> {
        self.assets.get(asset).map(Vec::as_slice)
    }

    pub fn partition_count(&self) -> usize {
        self.assets.values().map(Vec::len).sum()
    }
}

/// Per-connector inventory cache.
///
/// Readers clone the current `Arc` under a short read lock. A refresh builds
/// the new inventory without holding that lock and swaps it in, so readers
/// never observe a partial inventory. Concurrent refreshes are serialized.
#[derive(Default)]
pub struct InventoryCache {
    current: RwLock<Option<Arc<Inventory>>>,
    refresh_lock: Mutex<()>,
}

impl InventoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached inventory, building it on first use.
    pub async fn get_or_build<F, Fut>(&self, build: F) -> Result<Arc<Inventory>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Inventory>>,
    {
        if let Some(inventory) = self.current.read().await.clone() {
            return Ok(inventory);
        }
        let _guard = self.refresh_lock.lock().await;
        // Another caller may have built it while we waited.
        if let Some(inventory) = self.current.read().await.clone() {
            return Ok(inventory);
        }
        let inventory = Arc::new(build().await?);
        *self.current.write().await = Some(inventory.clone());
        Ok(inventory)
    }

    /// Rebuild unconditionally. On failure the previous inventory stays.
    pub async fn refresh<F, Fut>(&self, build: F) -> Result<Arc<Inventory>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Inventory>>,
    {
        let _guard = self.refresh_lock.lock().await;
        let inventory = Arc::new(build().await?);
        *self.current.write().await = Some(inventory.clone());
        Ok(inventory)
    }

    pub async fn is_built(&self) -> bool {
        self.current.read().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{BatchError, IdentifierValue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn partition(month: &str) -> Partition {
        Partition {
            batch_identifiers: BatchIdentifiers::from([(
                "month".to_string(),
                IdentifierValue::from(month),
            )]),
            source: PartitionSource::File(format!("trips_{}.csv", month)),
        }
    }

    #[test]
    fn test_partitions_stay_sorted_and_unique() {
        let mut inventory = Inventory::new();
        inventory.insert("trips", partition("03"));
        inventory.insert("trips", partition("01"));
        inventory.insert("trips", partition("02"));
        inventory.insert("trips", partition("01"));
        inventory.declare_asset("empty");

        let months: Vec<_> = inventory
            .partitions("trips")
            .unwrap()
            .iter()
            .map(|p| p.batch_identifiers["month"].to_string())
            .collect();
        assert_eq!(months, vec!["01", "02", "03"]);
        assert_eq!(inventory.partition_count(), 3);
        assert!(inventory.contains("empty"));
        assert_eq!(inventory.partitions("empty").unwrap().len(), 0);

        assert_eq!(
            inventory.partitions("trips").unwrap()[1].source,
            PartitionSource::File("trips_02.csv".into())
        );
    }

    #[tokio::test]
    async fn test_cache_builds_once_until_refresh() {
        let cache = InventoryCache::new();
        let builds = AtomicUsize::new(0);
        let build = || async {
            builds.fetch_add(1, Ordering::SeqCst);
            let mut inventory = Inventory::new();
            inventory.insert("trips", partition("01"));
            Ok(inventory)
        };

        assert!(!cache.is_built().await);
        cache.get_or_build(build).await.unwrap();
        cache.get_or_build(build).await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        cache.refresh(build).await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_inventory() {
        let cache = InventoryCache::new();
        cache
            .get_or_build(|| async {
                let mut inventory = Inventory::new();
                inventory.insert("trips", partition("01"));
                Ok(inventory)
            })
            .await
            .unwrap();

        let err = cache
            .refresh(|| async { Err(BatchError::discovery("files", "bucket unreachable")) })
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Discovery { .. }));

        let inventory = cache
            .get_or_build(|| async { Ok(Inventory::new()) })
            .await
            .unwrap();
        assert!(inventory.contains("trips"));
    }
}
