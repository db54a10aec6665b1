//! Admin command surface.
//!
//! [`AdminService`] wires the config store, split planner, migration
//! coordinator and balancer together behind the operator commands. Every
//! command checks the caller with the [`Authorizer`] before touching
//! metadata. Config writes that fail on version conflicts or an unreachable
//! replica set are retried a bounded number of times; everything else is
//! returned to the caller as is.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::auth::{ActionType, Authorizer, Principal, Resource};
use crate::balancer::{Balancer, RoundReport};
use crate::config::CoordinatorConfig;
use crate::config_store::{BalancerSettings, ConfigStore, DatabaseRecord, ShardRecord, ZoneRange};
use crate::migration::{MigrationCoordinator, MigrationOutcome, ShardTransport};
use crate::retry::RetryExecutor;
use crate::split::{ChunkSizeEstimate, SplitPlanner};
use crate::status::ShardingStatus;
use crate::types::*;

/// Structured failure returned with every rejected command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Taxonomy kind
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
    /// Stored version that made the request stale or conflicting
    pub version: Option<String>,
    /// Whether retrying later may succeed
    pub retryable: bool,
}

impl From<&MetaError> for ErrorReply {
    fn from(e: &MetaError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            version: e.conflicting_version().map(|v| v.to_string()),
            retryable: e.is_retryable(),
        }
    }
}

/// Reply to one admin command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    /// True on success
    pub ok: bool,
    /// Command result on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReply>,
}

impl CommandReply {
    /// Builds a reply from a command result.
    pub fn from_result<T: Serialize>(result: Result<T, MetaError>) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(v) => Self {
                    ok: true,
                    result: Some(v),
                    error: None,
                },
                Err(e) => Self::failure(&MetaError::Codec(e.to_string())),
            },
            Err(e) => Self::failure(&e),
        }
    }

    /// Failed reply for `e`.
    pub fn failure(e: &MetaError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ErrorReply::from(e)),
        }
    }
}

/// Result of a split, moveChunk or shardCollection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReply {
    /// Collection
    pub ns: String,
    /// Collection version after the command
    pub version: String,
    /// Epoch
    pub epoch: String,
}

impl VersionReply {
    fn new(ns: &Namespace, v: CollectionVersion) -> Self {
        Self {
            ns: ns.to_string(),
            version: v.version.to_string(),
            epoch: v.epoch.to_string(),
        }
    }
}

/// Result of a moveChunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveReply {
    /// Previous owner
    pub from: String,
    /// New owner
    pub to: String,
    /// Documents cloned
    pub docs_cloned: usize,
    /// Collection version after the move
    pub version: String,
}

impl From<MigrationOutcome> for MoveReply {
    fn from(o: MigrationOutcome) -> Self {
        Self {
            from: o.from.to_string(),
            to: o.to.to_string(),
            docs_cloned: o.docs_cloned,
            version: o.version.version.to_string(),
        }
    }
}

/// Operator-facing coordinator.
pub struct AdminService {
    store: Arc<ConfigStore>,
    authorizer: Arc<dyn Authorizer>,
    planner: SplitPlanner,
    migrations: Arc<MigrationCoordinator>,
    balancer: Arc<Balancer>,
    retry: RetryExecutor,
    config: CoordinatorConfig,
}

impl AdminService {
    /// Builds the coordinator for `instance` over an existing config store.
    pub fn new(
        store: Arc<ConfigStore>,
        transport: Arc<dyn ShardTransport>,
        authorizer: Arc<dyn Authorizer>,
        config: CoordinatorConfig,
        instance: impl Into<String>,
    ) -> Self {
        let migrations = Arc::new(MigrationCoordinator::new(
            store.clone(),
            transport,
            config.migration.clone(),
        ));
        let balancer = Arc::new(Balancer::new(
            store.clone(),
            migrations.clone(),
            instance,
            config.balancer.clone(),
        ));
        Self {
            planner: SplitPlanner::new(store.clone(), config.retry.clone()),
            retry: RetryExecutor::new(config.retry.clone()),
            store,
            authorizer,
            migrations,
            balancer,
            config,
        }
    }

    /// Config store
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Balancer, for spawning its background loop
    pub fn balancer(&self) -> &Arc<Balancer> {
        &self.balancer
    }

    /// Migration coordinator
    pub fn migrations(&self) -> &Arc<MigrationCoordinator> {
        &self.migrations
    }

    fn check(
        &self,
        principal: &Principal,
        action: ActionType,
        resource: Resource,
    ) -> Result<(), MetaError> {
        self.authorizer.check(principal, action, &resource)
    }

    /// Adds a shard to the inventory.
    pub async fn add_shard(
        &self,
        principal: &Principal,
        id: ShardId,
        host: &str,
    ) -> Result<(), MetaError> {
        self.check(principal, ActionType::AddShard, Resource::Cluster)?;
        let store = &self.store;
        let id = &id;
        self.retry
            .execute("addShard", move || async move {
                store.add_shard(ShardRecord::new(id.clone(), host)).await
            })
            .await
    }

    /// enableSharding: marks a database partitioned and assigns its primary shard.
    pub async fn enable_sharding(
        &self,
        principal: &Principal,
        db: &str,
    ) -> Result<DatabaseRecord, MetaError> {
        self.check(
            principal,
            ActionType::EnableSharding,
            Resource::Database(db.to_string()),
        )?;
        let store = &self.store;
        self.retry
            .execute("enableSharding", move || async move {
                store.enable_database(db).await
            })
            .await
    }

    /// shardCollection: one chunk over the full key range on the database primary.
    pub async fn shard_collection(
        &self,
        principal: &Principal,
        ns: &Namespace,
        key: ShardKeyPattern,
    ) -> Result<VersionReply, MetaError> {
        self.check(
            principal,
            ActionType::ShardCollection,
            Resource::Collection(ns.clone()),
        )?;
        let store = &self.store;
        let key = &key;
        let metadata = self
            .retry
            .execute("shardCollection", move || async move {
                store.create_collection(ns, key.clone()).await
            })
            .await?;
        Ok(VersionReply::new(ns, metadata.version()))
    }

    /// split: splits the chunk containing `middle` at `middle`.
    pub async fn split(
        &self,
        principal: &Principal,
        ns: &Namespace,
        middle: ShardKeyValue,
    ) -> Result<VersionReply, MetaError> {
        self.check(principal, ActionType::SplitChunk, Resource::Collection(ns.clone()))?;
        let version = self.planner.split_at(ns, middle).await?;
        Ok(VersionReply::new(ns, version))
    }

    /// Splits one chunk at several points.
    pub async fn split_points(
        &self,
        principal: &Principal,
        ns: &Namespace,
        points: Vec<ShardKeyValue>,
    ) -> Result<VersionReply, MetaError> {
        self.check(principal, ActionType::SplitChunk, Resource::Collection(ns.clone()))?;
        let version = self.planner.split_points(ns, points).await?;
        Ok(VersionReply::new(ns, version))
    }

    /// moveChunk: moves the chunk containing `find` to `to`.
    pub async fn move_chunk(
        &self,
        principal: &Principal,
        ns: &Namespace,
        find: &ShardKeyValue,
        to: &ShardId,
    ) -> Result<MoveReply, MetaError> {
        self.check(principal, ActionType::MoveChunk, Resource::Collection(ns.clone()))?;
        let outcome = self.migrations.move_chunk(ns, find, to).await?;
        Ok(outcome.into())
    }

    /// balancerStart
    pub async fn balancer_start(&self, principal: &Principal) -> Result<BalancerSettings, MetaError> {
        self.update_settings(principal, "balancerStart", |s| s.enabled = true)
            .await
    }

    /// balancerStop
    pub async fn balancer_stop(&self, principal: &Principal) -> Result<BalancerSettings, MetaError> {
        self.update_settings(principal, "balancerStop", |s| s.enabled = false)
            .await
    }

    /// enableAutoSplit
    pub async fn enable_auto_split(
        &self,
        principal: &Principal,
    ) -> Result<BalancerSettings, MetaError> {
        self.update_settings(principal, "enableAutoSplit", |s| s.auto_split = true)
            .await
    }

    /// disableAutoSplit
    pub async fn disable_auto_split(
        &self,
        principal: &Principal,
    ) -> Result<BalancerSettings, MetaError> {
        self.update_settings(principal, "disableAutoSplit", |s| s.auto_split = false)
            .await
    }

    async fn update_settings(
        &self,
        principal: &Principal,
        what: &str,
        f: fn(&mut BalancerSettings),
    ) -> Result<BalancerSettings, MetaError> {
        self.check(principal, ActionType::ManageBalancer, Resource::Cluster)?;
        let store = &self.store;
        let settings = self
            .retry
            .execute(what, move || async move { store.update_balancer_settings(f).await })
            .await?;
        tracing::info!(
            command = what,
            balancer = settings.enabled,
            auto_split = settings.auto_split,
            "balancer settings updated"
        );
        Ok(settings)
    }

    /// addShardToZone / removeShardFromZone
    pub async fn update_shard_zone(
        &self,
        principal: &Principal,
        shard: &ShardId,
        zone: &str,
        add: bool,
    ) -> Result<ShardRecord, MetaError> {
        self.check(principal, ActionType::ManageZones, Resource::Cluster)?;
        let store = &self.store;
        self.retry
            .execute("updateShardZone", move || async move {
                store.update_shard_zone(shard, zone, add).await
            })
            .await
    }

    /// addShardToZone
    pub async fn add_shard_to_zone(
        &self,
        principal: &Principal,
        shard: &ShardId,
        zone: &str,
    ) -> Result<ShardRecord, MetaError> {
        self.update_shard_zone(principal, shard, zone, true).await
    }

    /// removeShardFromZone
    pub async fn remove_shard_from_zone(
        &self,
        principal: &Principal,
        shard: &ShardId,
        zone: &str,
    ) -> Result<ShardRecord, MetaError> {
        self.update_shard_zone(principal, shard, zone, false).await
    }

    /// updateZoneKeyRange: assigns `range` to `zone`, or removes the range when `zone` is None.
    pub async fn update_zone_range(
        &self,
        principal: &Principal,
        ns: &Namespace,
        range: ChunkRange,
        zone: Option<String>,
    ) -> Result<Vec<ZoneRange>, MetaError> {
        self.check(principal, ActionType::ManageZones, Resource::Collection(ns.clone()))?;
        let store = &self.store;
        let range = &range;
        let zone = &zone;
        self.retry
            .execute("updateZoneKeyRange", move || async move {
                let range = range.clone();
                let zone = zone.clone();
                store
                    .update_zone_ranges(ns, move |zones| {
                        zones.retain(|z| z.range != range);
                        if let Some(zone) = zone {
                            zones.push(ZoneRange { range, zone });
                        }
                    })
                    .await
            })
            .await
    }

    /// Drops a sharded collection's metadata.
    pub async fn drop_collection(
        &self,
        principal: &Principal,
        ns: &Namespace,
    ) -> Result<(), MetaError> {
        self.check(
            principal,
            ActionType::DropCollection,
            Resource::Collection(ns.clone()),
        )?;
        let store = &self.store;
        self.retry
            .execute("drop", move || async move { store.drop_collection(ns).await })
            .await
    }

    /// Auto-split hook: a shard reports a chunk's size after writes.
    pub async fn record_chunk_growth(
        &self,
        principal: &Principal,
        ns: &Namespace,
        chunk_min: &ShardKeyValue,
        estimate: &ChunkSizeEstimate,
    ) -> Result<Option<VersionReply>, MetaError> {
        self.check(principal, ActionType::SplitChunk, Resource::Collection(ns.clone()))?;
        let version = self
            .planner
            .maybe_auto_split(ns, chunk_min, estimate, &self.config.split)
            .await?;
        Ok(version.map(|v| VersionReply::new(ns, v)))
    }

    /// Runs one balancer round now.
    pub async fn run_balancer_round(&self, principal: &Principal) -> Result<RoundReport, MetaError> {
        self.check(principal, ActionType::ManageBalancer, Resource::Cluster)?;
        self.balancer.run_round().await
    }

    /// Sharding status snapshot.
    pub fn status(&self, principal: &Principal) -> Result<ShardingStatus, MetaError> {
        self.check(principal, ActionType::ViewStatus, Resource::Cluster)?;
        ShardingStatus::collect(
            &self.store,
            self.balancer.state(),
            &self.migrations.active_migrations(),
        )
    }
}
