//! In-process cluster driven by admin scripts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use docshard_meta::admin::{AdminService, CommandReply};
use docshard_meta::auth::{AllowAll, Authorizer, GrantTable, Principal, Privilege};
use docshard_meta::config_store::{ConfigStore, ShardRecord};
use docshard_meta::memory_shard::MemoryShardCluster;
use docshard_meta::migration::DocumentKey;
use docshard_meta::router::RouterCache;
use docshard_meta::status::ShardingStatus;
use docshard_meta::types::*;
use serde::Serialize;

use crate::config::MgmtConfig;
use crate::script::{parse_key, AdminCommand};

/// Config store, shards and admin service for one run.
pub struct Cluster {
    admin: AdminService,
    shards: Arc<MemoryShardCluster>,
    router: RouterCache,
    next_doc_id: AtomicU64,
}

/// A command and its reply, as printed by `run`.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptStep {
    /// Command as parsed
    pub command: AdminCommand,
    /// Its reply
    pub reply: CommandReply,
}

impl Cluster {
    /// Builds the cluster described by `config`.
    pub async fn bootstrap(config: &MgmtConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let store = Arc::new(ConfigStore::in_memory(config.config_replicas));
        let shards = Arc::new(MemoryShardCluster::new());

        for spec in &config.shards {
            let id = ShardId::new(spec.id.clone());
            let mut record = ShardRecord::new(id.clone(), spec.host.clone());
            record.zones = spec.zones.iter().cloned().collect();
            store.add_shard(record).await?;
            shards.add_shard(id);
        }
        let auto_split = config.coordinator.split.auto_split;
        store
            .update_balancer_settings(|s| s.auto_split = auto_split)
            .await?;

        let authorizer: Arc<dyn Authorizer> = if config.grants.is_empty() {
            Arc::new(AllowAll)
        } else {
            let table = GrantTable::new();
            for grant in &config.grants {
                table.grant(
                    Principal::new(grant.user.clone(), grant.db.clone()),
                    Privilege {
                        resource: grant.resource.clone(),
                        actions: grant.actions.clone(),
                    },
                );
            }
            Arc::new(table)
        };

        let admin = AdminService::new(
            store.clone(),
            shards.clone(),
            authorizer,
            config.coordinator.clone(),
            config.instance.clone(),
        );
        tracing::info!(
            shards = config.shards.len(),
            replicas = config.config_replicas,
            instance = %config.instance,
            "cluster bootstrapped"
        );
        Ok(Self {
            admin,
            shards,
            router: RouterCache::new(store),
            next_doc_id: AtomicU64::new(0),
        })
    }

    /// Admin command surface.
    pub fn admin(&self) -> &AdminService {
        &self.admin
    }

    /// In-process shard nodes.
    pub fn shards(&self) -> &MemoryShardCluster {
        &self.shards
    }

    /// Current sharding status.
    pub fn status(&self, principal: &Principal) -> Result<ShardingStatus, MetaError> {
        self.admin.status(principal)
    }

    /// Runs every command in order. A failed command does not stop the script.
    pub async fn run_script(
        &self,
        principal: &Principal,
        commands: Vec<AdminCommand>,
    ) -> Vec<ScriptStep> {
        let mut steps = Vec::with_capacity(commands.len());
        for command in commands {
            let reply = self.execute(principal, &command).await;
            if let Some(error) = &reply.error {
                tracing::warn!(cmd = command.name(), kind = %error.kind, error = %error.message, "command failed");
            } else {
                tracing::debug!(cmd = command.name(), "command succeeded");
            }
            steps.push(ScriptStep { command, reply });
        }
        steps
    }

    /// Runs one command and wraps the outcome in a reply.
    pub async fn execute(&self, principal: &Principal, command: &AdminCommand) -> CommandReply {
        let admin = &self.admin;
        match command {
            AdminCommand::AddShard { id, host } => {
                let id = ShardId::new(id.clone());
                let result = admin.add_shard(principal, id.clone(), host).await;
                if result.is_ok() {
                    self.shards.add_shard(id);
                }
                CommandReply::from_result(result)
            }
            AdminCommand::EnableSharding { db } => {
                CommandReply::from_result(admin.enable_sharding(principal, db).await)
            }
            AdminCommand::ShardCollection { ns, key } => match parse_ns(ns) {
                Ok(ns) => CommandReply::from_result(
                    admin
                        .shard_collection(principal, &ns, ShardKeyPattern::new(key.clone()))
                        .await,
                ),
                Err(e) => CommandReply::failure(&e),
            },
            AdminCommand::Split { ns, middle } => match (parse_ns(ns), key_value(middle)) {
                (Ok(ns), Ok(middle)) => {
                    CommandReply::from_result(admin.split(principal, &ns, middle).await)
                }
                (Err(e), _) | (_, Err(e)) => CommandReply::failure(&e),
            },
            AdminCommand::SplitPoints { ns, points } => {
                let points: Result<Vec<_>, _> = points.iter().map(key_value).collect();
                match (parse_ns(ns), points) {
                    (Ok(ns), Ok(points)) => {
                        CommandReply::from_result(admin.split_points(principal, &ns, points).await)
                    }
                    (Err(e), _) | (_, Err(e)) => CommandReply::failure(&e),
                }
            }
            AdminCommand::MoveChunk { ns, find, to } => match (parse_ns(ns), key_value(find)) {
                (Ok(ns), Ok(find)) => CommandReply::from_result(
                    admin
                        .move_chunk(principal, &ns, &find, &ShardId::new(to.clone()))
                        .await,
                ),
                (Err(e), _) | (_, Err(e)) => CommandReply::failure(&e),
            },
            AdminCommand::BalancerStart => {
                CommandReply::from_result(admin.balancer_start(principal).await)
            }
            AdminCommand::BalancerStop => {
                CommandReply::from_result(admin.balancer_stop(principal).await)
            }
            AdminCommand::EnableAutoSplit => {
                CommandReply::from_result(admin.enable_auto_split(principal).await)
            }
            AdminCommand::DisableAutoSplit => {
                CommandReply::from_result(admin.disable_auto_split(principal).await)
            }
            AdminCommand::AddShardToZone { shard, zone } => CommandReply::from_result(
                admin
                    .add_shard_to_zone(principal, &ShardId::new(shard.clone()), zone)
                    .await,
            ),
            AdminCommand::RemoveShardFromZone { shard, zone } => CommandReply::from_result(
                admin
                    .remove_shard_from_zone(principal, &ShardId::new(shard.clone()), zone)
                    .await,
            ),
            AdminCommand::UpdateZoneKeyRange { ns, min, max, zone } => {
                match (parse_ns(ns), key_value(min), key_value(max)) {
                    (Ok(ns), Ok(min), Ok(max)) => CommandReply::from_result(
                        admin
                            .update_zone_range(principal, &ns, ChunkRange::new(min, max), zone.clone())
                            .await,
                    ),
                    (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => CommandReply::failure(&e),
                }
            }
            AdminCommand::Drop { ns } => match parse_ns(ns) {
                Ok(ns) => CommandReply::from_result(admin.drop_collection(principal, &ns).await),
                Err(e) => CommandReply::failure(&e),
            },
            AdminCommand::Insert { ns, keys } => {
                let keys: Result<Vec<_>, _> = keys.iter().map(key_value).collect();
                match (parse_ns(ns), keys) {
                    (Ok(ns), Ok(keys)) => CommandReply::from_result(self.insert(&ns, keys)),
                    (Err(e), _) | (_, Err(e)) => CommandReply::failure(&e),
                }
            }
            AdminCommand::RunBalancer => {
                CommandReply::from_result(admin.run_balancer_round(principal).await)
            }
            AdminCommand::Status => CommandReply::from_result(admin.status(principal)),
        }
    }

    /// Routes each key to its owning shard and writes a document there.
    fn insert(
        &self,
        ns: &Namespace,
        keys: Vec<ShardKeyValue>,
    ) -> Result<BTreeMap<String, usize>, MetaError> {
        let map = self.router.chunk_map(ns)?;
        let mut written: BTreeMap<String, usize> = BTreeMap::new();
        for key in keys {
            let shard = map.lookup(&key)?.shard.clone();
            let id = self.next_doc_id.fetch_add(1, Ordering::Relaxed);
            let doc = serde_json::json!({ "_id": id, "key": key.to_string() });
            self.shards.insert(&shard, ns, DocumentKey::new(key, id), doc)?;
            *written.entry(shard.to_string()).or_insert(0) += 1;
        }
        Ok(written)
    }
}

fn parse_ns(ns: &str) -> Result<Namespace, MetaError> {
    ns.parse()
}

fn key_value(value: &serde_json::Value) -> Result<ShardKeyValue, MetaError> {
    parse_key(value).map_err(|e| MetaError::InvalidRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GrantSpec;
    use crate::script::parse_script;
    use docshard_meta::auth::{ActionType, Resource};

    fn admin() -> Principal {
        Principal::new("admin", "admin")
    }

    #[tokio::test]
    async fn test_script_splits_and_balances() {
        let cluster = Cluster::bootstrap(&MgmtConfig::default()).await.unwrap();
        let script = r#"
{"cmd": "enableSharding", "db": "testDB"}
{"cmd": "shardCollection", "ns": "testDB.foo", "key": "a"}
{"cmd": "splitPoints", "ns": "testDB.foo", "points": [10, 20, 30]}
{"cmd": "insert", "ns": "testDB.foo", "keys": [1, 11, 21, 31]}
{"cmd": "runBalancer"}
"#;
        let steps = cluster
            .run_script(&admin(), parse_script(script).unwrap())
            .await;
        assert!(steps.iter().all(|s| s.reply.ok), "{:?}", steps);
        let report = steps[4].reply.result.as_ref().unwrap();
        assert_eq!(report["migrations"], 2);

        let status = cluster.status(&admin()).unwrap();
        assert_eq!(status.chunks_on("testDB.foo", "shard0000"), 2);
        assert_eq!(status.chunks_on("testDB.foo", "shard0001"), 2);
        let ns = Namespace::new("testDB", "foo");
        assert_eq!(cluster.shards().count(&ShardId::new("shard0001"), &ns), 2);
    }

    #[tokio::test]
    async fn test_failed_command_does_not_stop_script() {
        let cluster = Cluster::bootstrap(&MgmtConfig::default()).await.unwrap();
        let script = r#"
{"cmd": "shardCollection", "ns": "testDB.foo", "key": "a"}
{"cmd": "split", "ns": "bad", "middle": 1}
{"cmd": "enableSharding", "db": "testDB"}
"#;
        let steps = cluster
            .run_script(&admin(), parse_script(script).unwrap())
            .await;
        let errors: Vec<_> = steps
            .iter()
            .map(|s| s.reply.error.as_ref().map(|e| e.kind))
            .collect();
        assert_eq!(
            errors,
            vec![Some(ErrorKind::InvalidRequest), Some(ErrorKind::InvalidRequest), None]
        );
    }

    #[tokio::test]
    async fn test_grants_restrict_commands() {
        let mut config = MgmtConfig::default();
        config.grants.push(GrantSpec {
            user: "admin".into(),
            db: "admin".into(),
            resource: Resource::Cluster,
            actions: vec![ActionType::EnableSharding, ActionType::ViewStatus],
        });
        let cluster = Cluster::bootstrap(&config).await.unwrap();
        let ok = cluster
            .execute(&admin(), &AdminCommand::EnableSharding { db: "testDB".into() })
            .await;
        assert!(ok.ok);
        let denied = cluster.execute(&admin(), &AdminCommand::BalancerStop).await;
        assert_eq!(denied.error.unwrap().kind, ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_config_auto_split_setting_applied() {
        let mut config = MgmtConfig::default();
        config.coordinator.split.auto_split = false;
        let cluster = Cluster::bootstrap(&config).await.unwrap();
        let status = cluster.status(&admin()).unwrap();
        assert!(!status.balancer.auto_split);
        assert!(status.balancer.enabled);
    }
}
