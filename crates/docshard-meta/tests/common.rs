//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use docshard_meta::admin::AdminService;
use docshard_meta::auth::{AllowAll, Principal};
use docshard_meta::config::CoordinatorConfig;
use docshard_meta::config_store::ConfigStore;
use docshard_meta::memory_shard::MemoryShardCluster;
use docshard_meta::migration::DocumentKey;
use docshard_meta::types::*;

/// Test configuration with sensible defaults for fast testing
pub fn test_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.balancer.interval_ms = 20;
    config.balancer.lease_ttl_ms = 500;
    config.migration.clone_batch_size = 4;
    config.migration.critical_section_timeout_ms = 200;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config
}

/// An in-process cluster: config store, shard nodes and an admin service.
pub struct TestCluster {
    pub store: Arc<ConfigStore>,
    pub shards: Arc<MemoryShardCluster>,
    pub admin: AdminService,
    pub shard_ids: Vec<ShardId>,
}

impl TestCluster {
    /// Create a cluster with `num_shards` shards named shard0000, shard0001, ...
    pub async fn new(num_shards: usize) -> Self {
        Self::with_config(num_shards, test_config()).await
    }

    pub async fn with_config(num_shards: usize, config: CoordinatorConfig) -> Self {
        let store = Arc::new(ConfigStore::in_memory(3));
        let shards = Arc::new(MemoryShardCluster::new());
        let admin = AdminService::new(
            store.clone(),
            shards.clone(),
            Arc::new(AllowAll),
            config,
            "config-test",
        );
        let mut shard_ids = Vec::new();
        for i in 0..num_shards {
            let id = ShardId::new(format!("shard{:04}", i));
            shards.add_shard(id.clone());
            admin
                .add_shard(&root(), id.clone(), &format!("rs{}/localhost:{}", i, 27018 + i))
                .await
                .expect("add shard");
            shard_ids.push(id);
        }
        Self {
            store,
            shards,
            admin,
            shard_ids,
        }
    }

    pub fn shard(&self, i: usize) -> &ShardId {
        &self.shard_ids[i]
    }

    /// enableSharding plus shardCollection on key `a`.
    pub async fn shard_collection(&self, db: &str, coll: &str) -> Namespace {
        let ns = Namespace::new(db, coll);
        self.admin
            .enable_sharding(&root(), db)
            .await
            .expect("enable sharding");
        self.admin
            .shard_collection(&root(), &ns, ShardKeyPattern::new("a"))
            .await
            .expect("shard collection");
        ns
    }

    /// Inserts documents with integer keys `keys` on `shard`.
    pub fn insert_docs(&self, shard: &ShardId, ns: &Namespace, keys: impl IntoIterator<Item = i64>) {
        for (id, k) in keys.into_iter().enumerate() {
            self.shards
                .insert(
                    shard,
                    ns,
                    DocumentKey::new(k, id as u64),
                    serde_json::json!({ "a": k }),
                )
                .expect("insert");
        }
    }

    pub fn version(&self, ns: &Namespace) -> CollectionVersion {
        self.store.read_metadata(ns).expect("metadata").1
    }

    pub fn owner(&self, ns: &Namespace, key: i64) -> ShardId {
        let (metadata, _) = self.store.read_metadata(ns).expect("metadata");
        metadata
            .chunks
            .lookup(&ShardKeyValue::Int(key))
            .expect("lookup")
            .shard
            .clone()
    }
}

/// Principal with every privilege under `AllowAll`.
pub fn root() -> Principal {
    Principal::new("root", "admin")
}
