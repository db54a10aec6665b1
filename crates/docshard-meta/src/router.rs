//! Query routing over cached chunk maps.
//!
//! Routers hold read-only [`ChunkMap`] snapshots, one per collection, each
//! tagged with the config version it was read at. A lookup reuses the
//! snapshot while the config version is unchanged and refetches otherwise.
//! A shard that rejects a request as stale also forces a refetch. Snapshots
//! are replaced whole, so a router sees either the pre- or post-commit map
//! and never a mix.

use std::sync::Arc;

use dashmap::DashMap;

use crate::chunk_map::ChunkMap;
use crate::config_store::ConfigStore;
use crate::types::*;

#[derive(Clone)]
struct CachedMap {
    map: Arc<ChunkMap>,
    config_version: u64,
}

/// Per-router cache of collection chunk maps.
pub struct RouterCache {
    store: Arc<ConfigStore>,
    maps: DashMap<Namespace, CachedMap>,
}

impl RouterCache {
    /// Creates an empty cache reading from `store`.
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            maps: DashMap::new(),
        }
    }

    /// Chunk map for `ns`, refreshed if the config version moved.
    pub fn chunk_map(&self, ns: &Namespace) -> Result<Arc<ChunkMap>, MetaError> {
        let current = self.store.config_version();
        if let Some(entry) = self.maps.get(ns) {
            if entry.config_version == current {
                return Ok(entry.map.clone());
            }
        }
        self.refresh(ns)
    }

    /// Shard owning `key` in `ns`.
    pub fn route(&self, ns: &Namespace, key: &ShardKeyValue) -> Result<ShardId, MetaError> {
        let map = self.chunk_map(ns)?;
        Ok(map.lookup(key)?.shard.clone())
    }

    /// Version of the cached map, if any.
    pub fn cached_version(&self, ns: &Namespace) -> Option<CollectionVersion> {
        self.maps.get(ns).map(|e| e.map.version())
    }

    /// Drops the cached map for `ns`.
    pub fn invalidate(&self, ns: &Namespace) {
        self.maps.remove(ns);
    }

    /// Reacts to a shard rejecting a request.
    ///
    /// `StaleVersion` and epoch mismatches trigger a refetch; any other error
    /// is handed back unchanged.
    pub fn handle_shard_error(
        &self,
        ns: &Namespace,
        error: MetaError,
    ) -> Result<Arc<ChunkMap>, MetaError> {
        match error {
            MetaError::StaleVersion { current, .. } => {
                tracing::debug!(ns = %ns, shard_version = %current, "shard reported stale routing");
                self.refresh(ns)
            }
            other => Err(other),
        }
    }

    /// Rejects a request routed with `sent` when the authoritative version differs.
    ///
    /// This is the check a shard runs against its own copy of the metadata.
    pub fn check_version(
        &self,
        ns: &Namespace,
        sent: CollectionVersion,
    ) -> Result<(), MetaError> {
        let (_, current) = self.store.read_metadata(ns)?;
        if current != sent {
            return Err(MetaError::StaleVersion {
                ns: ns.clone(),
                expected: sent,
                current,
            });
        }
        Ok(())
    }

    /// Refetches the map for `ns` from the config store.
    pub fn refresh(&self, ns: &Namespace) -> Result<Arc<ChunkMap>, MetaError> {
        let config_version = self.store.config_version();
        let metadata = match self.store.read_metadata(ns) {
            Ok((metadata, _)) => metadata,
            Err(e @ MetaError::NamespaceNotFound(_)) => {
                self.maps.remove(ns);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let map = Arc::new(metadata.chunks);
        if let Some(old) = self.maps.get(ns) {
            if old.map.epoch() != map.epoch() {
                tracing::info!(
                    ns = %ns,
                    old_epoch = %old.map.epoch(),
                    new_epoch = %map.epoch(),
                    "collection epoch changed, cached routing dropped"
                );
            }
        }
        self.maps.insert(
            ns.clone(),
            CachedMap {
                map: map.clone(),
                config_version,
            },
        );
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::config_store::ShardRecord;
    use crate::split::SplitPlanner;

    fn ns() -> Namespace {
        Namespace::new("testDB", "foo")
    }

    async fn setup() -> (Arc<ConfigStore>, RouterCache) {
        let store = Arc::new(ConfigStore::in_memory(1));
        store
            .add_shard(ShardRecord::new(ShardId::new("shard0000"), "h"))
            .await
            .unwrap();
        store.enable_database("testDB").await.unwrap();
        store
            .create_collection(&ns(), ShardKeyPattern::new("a"))
            .await
            .unwrap();
        let router = RouterCache::new(store.clone());
        (store, router)
    }

    #[tokio::test]
    async fn test_cache_reused_until_config_changes() {
        let (store, router) = setup().await;
        let first = router.chunk_map(&ns()).unwrap();
        let again = router.chunk_map(&ns()).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        SplitPlanner::new(store.clone(), RetryConfig::default())
            .split_at(&ns(), ShardKeyValue::Int(100))
            .await
            .unwrap();
        let after = router.chunk_map(&ns()).unwrap();
        assert!(!Arc::ptr_eq(&first, &after));
        assert_eq!(after.len(), 2);
        assert_eq!(first.len(), 1);
    }

    #[tokio::test]
    async fn test_route_finds_owner() {
        let (_, router) = setup().await;
        assert_eq!(
            router.route(&ns(), &ShardKeyValue::Int(42)).unwrap(),
            ShardId::new("shard0000")
        );
    }

    #[tokio::test]
    async fn test_stale_shard_error_triggers_refresh() {
        let (store, router) = setup().await;
        let old = router.cached_version(&ns());
        assert!(old.is_none());
        let sent = router.chunk_map(&ns()).unwrap().version();

        SplitPlanner::new(store.clone(), RetryConfig::default())
            .split_at(&ns(), ShardKeyValue::Int(5))
            .await
            .unwrap();
        let err = router.check_version(&ns(), sent).unwrap_err();
        let map = router.handle_shard_error(&ns(), err).unwrap();
        assert_eq!(map.version().version, ChunkVersion::new(1, 2));
        router.check_version(&ns(), map.version()).unwrap();
    }

    #[tokio::test]
    async fn test_epoch_change_replaces_map() {
        let (store, router) = setup().await;
        let before = router.chunk_map(&ns()).unwrap().epoch();
        store.drop_collection(&ns()).await.unwrap();
        assert!(matches!(
            router.chunk_map(&ns()),
            Err(MetaError::NamespaceNotFound(_))
        ));
        assert!(router.cached_version(&ns()).is_none());

        store
            .create_collection(&ns(), ShardKeyPattern::new("a"))
            .await
            .unwrap();
        let after = router.chunk_map(&ns()).unwrap().epoch();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_non_stale_errors_pass_through() {
        let (_, router) = setup().await;
        let err = router
            .handle_shard_error(&ns(), MetaError::InvalidRequest("x".into()))
            .unwrap_err();
        assert!(matches!(err, MetaError::InvalidRequest(_)));
    }
}
