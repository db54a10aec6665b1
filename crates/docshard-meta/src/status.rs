//! Read-only sharding status snapshot.
//!
//! Gathers the shard inventory, balancer state, databases and chunk
//! distribution into one serializable value. `Display` renders the familiar
//! sharding-status printout.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::balancer::{distribution, BalancerState};
use crate::config_store::ConfigStore;
use crate::lease::current_holder;
use crate::migration::MigrationTicket;
use crate::types::*;

/// Balancer section of the status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerStatus {
    /// balancerStart / balancerStop setting
    pub enabled: bool,
    /// Auto-split setting
    pub auto_split: bool,
    /// State of the local balancer
    pub state: BalancerState,
    /// Instance holding the balancer lease
    pub lease_holder: Option<String>,
}

/// One shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatus {
    /// Shard id
    pub id: String,
    /// Host string
    pub host: String,
    /// Zones served
    pub zones: Vec<String>,
    /// Chunks owned across all collections
    pub chunks: usize,
}

/// One database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStatus {
    /// Database name
    pub name: String,
    /// Primary shard
    pub primary: String,
    /// Whether sharding is enabled
    pub partitioned: bool,
}

/// One chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStatus {
    /// Lower bound
    pub min: String,
    /// Upper bound
    pub max: String,
    /// Owner
    pub shard: String,
    /// Chunk version
    pub version: String,
}

/// One zone key range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneStatus {
    /// Zone name
    pub zone: String,
    /// Range as `[min, max)`
    pub range: String,
}

/// One sharded collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStatus {
    /// Namespace
    pub ns: String,
    /// Shard key pattern
    pub key: String,
    /// Shard key field
    pub key_field: String,
    /// Epoch
    pub epoch: String,
    /// Collection version
    pub version: String,
    /// Chunk count per shard
    pub distribution: BTreeMap<String, usize>,
    /// Chunks in key order
    pub chunks: Vec<ChunkStatus>,
    /// Zone ranges
    pub zones: Vec<ZoneStatus>,
}

/// One in-flight migration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    /// Namespace
    pub ns: String,
    /// Range being moved
    pub range: String,
    /// Donor
    pub from: String,
    /// Recipient
    pub to: String,
    /// Protocol state
    pub state: String,
}

/// Snapshot of cluster sharding state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingStatus {
    /// Global config version
    pub config_version: u64,
    /// Balancer
    pub balancer: BalancerStatus,
    /// Shards in id order
    pub shards: Vec<ShardStatus>,
    /// Databases in name order
    pub databases: Vec<DatabaseStatus>,
    /// Sharded collections in namespace order
    pub collections: Vec<CollectionStatus>,
    /// Migrations in flight
    pub migrations: Vec<MigrationStatus>,
}

impl ShardingStatus {
    /// Reads a status snapshot from the config store.
    pub fn collect(
        store: &ConfigStore,
        balancer_state: BalancerState,
        active: &[MigrationTicket],
    ) -> Result<Self, MetaError> {
        let settings = store.balancer_settings()?;
        let shard_records = store.shards()?;
        let counts = store.chunk_counts_by_shard()?;

        let shards = shard_records
            .iter()
            .map(|s| ShardStatus {
                id: s.id.to_string(),
                host: s.host.clone(),
                zones: s.zones.iter().cloned().collect(),
                chunks: counts.get(&s.id).copied().unwrap_or(0),
            })
            .collect();

        let databases = store
            .databases()?
            .into_iter()
            .map(|d| DatabaseStatus {
                name: d.name,
                primary: d.primary.to_string(),
                partitioned: d.partitioned,
            })
            .collect();

        let collections = store
            .collections()?
            .into_iter()
            .map(|c| CollectionStatus {
                ns: c.ns.to_string(),
                key: c.key_pattern.to_string(),
                key_field: c.key_pattern.field.clone(),
                epoch: c.epoch().to_string(),
                version: c.version().version.to_string(),
                distribution: distribution(&c, &shard_records)
                    .into_iter()
                    .map(|(id, n)| (id.to_string(), n))
                    .collect(),
                chunks: c
                    .chunks
                    .iter()
                    .map(|chunk| ChunkStatus {
                        min: chunk.range.min.to_string(),
                        max: chunk.range.max.to_string(),
                        shard: chunk.shard.to_string(),
                        version: chunk.version.to_string(),
                    })
                    .collect(),
                zones: c
                    .zones
                    .iter()
                    .map(|z| ZoneStatus {
                        zone: z.zone.clone(),
                        range: z.range.to_string(),
                    })
                    .collect(),
            })
            .collect();

        let migrations = active
            .iter()
            .map(|t| MigrationStatus {
                ns: t.chunk.ns.to_string(),
                range: t.range.to_string(),
                from: t.donor.to_string(),
                to: t.recipient.to_string(),
                state: t.state.to_string(),
            })
            .collect();

        Ok(Self {
            config_version: store.config_version(),
            balancer: BalancerStatus {
                enabled: settings.enabled,
                auto_split: settings.auto_split,
                state: balancer_state,
                lease_holder: current_holder(store, Timestamp::now())?.map(|l| l.holder),
            },
            shards,
            databases,
            collections,
            migrations,
        })
    }

    /// Chunk count of a shard in one collection, 0 if unknown.
    pub fn chunks_on(&self, ns: &str, shard: &str) -> usize {
        self.collections
            .iter()
            .find(|c| c.ns == ns)
            .and_then(|c| c.distribution.get(shard).copied())
            .unwrap_or(0)
    }
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

impl fmt::Display for ShardingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Sharding Status ---")?;
        writeln!(f, "  config version: {}", self.config_version)?;
        writeln!(f, "  shards:")?;
        for s in &self.shards {
            write!(f, "    {{ _id: \"{}\", host: \"{}\"", s.id, s.host)?;
            if !s.zones.is_empty() {
                write!(f, ", tags: [ {} ]", s.zones.join(", "))?;
            }
            writeln!(f, " }}  chunks: {}", s.chunks)?;
        }
        writeln!(f, "  balancer:")?;
        writeln!(f, "    enabled: {}", yes_no(self.balancer.enabled))?;
        writeln!(f, "    auto-split: {}", yes_no(self.balancer.auto_split))?;
        writeln!(f, "    state: {}", self.balancer.state)?;
        if let Some(holder) = &self.balancer.lease_holder {
            writeln!(f, "    lease holder: {}", holder)?;
        }
        if !self.migrations.is_empty() {
            writeln!(f, "  migrations in progress:")?;
            for m in &self.migrations {
                writeln!(f, "    {} {} {} -> {} ({})", m.ns, m.range, m.from, m.to, m.state)?;
            }
        }
        writeln!(f, "  databases:")?;
        for db in &self.databases {
            writeln!(
                f,
                "    {{ _id: \"{}\", primary: \"{}\", partitioned: {} }}",
                db.name, db.primary, db.partitioned
            )?;
            let prefix = format!("{}.", db.name);
            for c in self.collections.iter().filter(|c| c.ns.starts_with(&prefix)) {
                writeln!(f, "      {}", c.ns)?;
                writeln!(f, "        shard key: {}", c.key)?;
                writeln!(f, "        version: {}||{}", c.version, c.epoch)?;
                writeln!(f, "        chunks:")?;
                for (shard, n) in &c.distribution {
                    writeln!(f, "          {}\t{}", shard, n)?;
                }
                for chunk in &c.chunks {
                    writeln!(
                        f,
                        "        {{ {field}: {} }} -->> {{ {field}: {} }} on : {} {}",
                        chunk.min,
                        chunk.max,
                        chunk.shard,
                        chunk.version,
                        field = c.key_field
                    )?;
                }
                for z in &c.zones {
                    writeln!(f, "        tag: {}  {}", z.zone, z.range)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::ShardRecord;

    #[tokio::test]
    async fn test_status_reports_distribution() {
        let store = ConfigStore::in_memory(1);
        for id in ["shard0000", "shard0001"] {
            store
                .add_shard(ShardRecord::new(ShardId::new(id), format!("rs/{}:27018", id)))
                .await
                .unwrap();
        }
        store
            .update_shard_zone(&ShardId::new("shard0001"), "EU", true)
            .await
            .unwrap();
        store.enable_database("testDB").await.unwrap();
        let ns = Namespace::new("testDB", "foo");
        store
            .create_collection(&ns, ShardKeyPattern::new("a"))
            .await
            .unwrap();

        let status = ShardingStatus::collect(&store, BalancerState::Idle, &[]).unwrap();
        assert_eq!(status.shards.len(), 2);
        assert_eq!(status.shards[1].zones, vec!["EU".to_string()]);
        assert_eq!(status.chunks_on("testDB.foo", "shard0000"), 1);
        assert_eq!(status.chunks_on("testDB.foo", "shard0001"), 0);
        assert_eq!(status.collections[0].version, "1|0");
        assert!(status.balancer.enabled);
        assert!(status.balancer.lease_holder.is_none());

        let text = status.to_string();
        assert!(text.contains("--- Sharding Status ---"));
        assert!(text.contains("testDB.foo"));
        assert!(text.contains("{ a: MinKey } -->> { a: MaxKey } on : shard0000 1|0"));
        assert!(text.contains("tags: [ EU ]"));

        let json = serde_json::to_string(&status).unwrap();
        let back: ShardingStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
