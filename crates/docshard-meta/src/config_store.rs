//! Authoritative cluster metadata: shards, databases, collections, settings, leases.
//!
//! Each record is a bincode value in the [`KvStore`] under a typed key
//! prefix. A write checks the caller's expected version, ships the new record
//! to the replica set, and applies it locally only after a majority has
//! acknowledged. Writes to the same key are serialized by a per-key gate, so
//! a slow replicated write only holds up writers of that one record. Callers
//! never hold locks across operations; they read a snapshot, build a change
//! against its version, and commit with compare-and-swap semantics.
//!
//! Every successful write bumps a global config version published on a
//! [`watch`] channel, which routers use to notice that their caches are old.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

use crate::chunk_map::{Chunk, ChunkMap};
use crate::kvstore::{KvStore, MemoryKvStore, Revision};
use crate::replication::{LocalReplicaSet, ReplicationPayload, Replicator};
use crate::split::SplitPlanner;
use crate::types::*;

const SHARD_PREFIX: &str = "shards/";
const DATABASE_PREFIX: &str = "databases/";
const COLLECTION_PREFIX: &str = "collections/";
const BALANCER_SETTINGS_KEY: &str = "settings/balancer";
/// Key of the balancer lease record.
pub const BALANCER_LOCK_KEY: &str = "locks/balancer";

/// A shard in the cluster inventory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    /// Shard identifier
    pub id: ShardId,
    /// Connection string of the shard's replica set
    pub host: String,
    /// Zones (tags) this shard serves
    pub zones: BTreeSet<String>,
}

impl ShardRecord {
    /// Creates a shard record with no zones
    pub fn new(id: ShardId, host: impl Into<String>) -> Self {
        Self {
            id,
            host: host.into(),
            zones: BTreeSet::new(),
        }
    }

    /// Returns true if the shard serves `zone`
    pub fn serves(&self, zone: &str) -> bool {
        self.zones.contains(zone)
    }
}

/// A database known to the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    /// Database name
    pub name: String,
    /// Shard that receives the first chunk of every new collection
    pub primary: ShardId,
    /// Whether enableSharding has run
    pub partitioned: bool,
}

/// A key range pinned to a zone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRange {
    /// Pinned range
    pub range: ChunkRange,
    /// Zone name
    pub zone: String,
}

/// Everything the cluster knows about one sharded collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    /// Collection name
    pub ns: Namespace,
    /// Shard key
    pub key_pattern: ShardKeyPattern,
    /// Chunk map (carries the epoch)
    pub chunks: ChunkMap,
    /// Zone key ranges, non-overlapping
    pub zones: Vec<ZoneRange>,
}

impl CollectionMetadata {
    /// Collection epoch
    pub fn epoch(&self) -> Epoch {
        self.chunks.epoch()
    }

    /// Collection version
    pub fn version(&self) -> CollectionVersion {
        self.chunks.version()
    }

    /// Zone of a chunk, if the chunk lies wholly inside a zone range
    pub fn zone_for(&self, range: &ChunkRange) -> Option<&str> {
        self.zones
            .iter()
            .find(|z| z.range.covers(range))
            .map(|z| z.zone.as_str())
    }

    /// Zones whose ranges overlap `range`.
    pub fn zones_overlapping<'a>(&'a self, range: &'a ChunkRange) -> impl Iterator<Item = &'a str> {
        self.zones
            .iter()
            .filter(move |z| z.range.overlaps(range))
            .map(|z| z.zone.as_str())
    }

    /// Returns true if `shard` serves every zone that touches `range`.
    pub fn may_hold(&self, range: &ChunkRange, shard: &ShardRecord) -> bool {
        self.zones_overlapping(range).all(|z| shard.serves(z))
    }

    /// Splits chunks so that none straddles a zone range boundary.
    ///
    /// Returns the number of splits applied.
    fn align_chunks_to_zones(&mut self) -> Result<usize, MetaError> {
        let bounds: BTreeSet<ShardKeyValue> = self
            .zones
            .iter()
            .flat_map(|z| [z.range.min.clone(), z.range.max.clone()])
            .collect();
        let mut splits = 0;
        for bound in bounds {
            let chunk = match self.chunks.lookup(&bound) {
                Ok(chunk) if chunk.range.min != bound => chunk.clone(),
                _ => continue,
            };
            let version = self.version();
            let children = SplitPlanner::plan_split(&chunk, &[bound], version.version)?;
            self.chunks.apply_delta(version, children)?;
            splits += 1;
        }
        Ok(splits)
    }
}

/// Runtime toggles persisted with the metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerSettings {
    /// balancerStart / balancerStop
    pub enabled: bool,
    /// enableAutoSplit / disableAutoSplit
    pub auto_split: bool,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_split: true,
        }
    }
}

/// A time-bounded lease record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Instance currently holding the lease
    pub holder: String,
    /// Expiry in wall-clock millis
    pub expires_at: Timestamp,
    /// Incremented on every change of holder
    pub generation: u64,
}

/// A change to a collection's chunk map, committed against an expected version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectionMutation {
    /// Replace the chunks covering the span of `new_chunks` (splits).
    ReplaceChunks(Vec<Chunk>),
    /// Hand the chunk starting at `min` from `donor` to `recipient`.
    ///
    /// Rejected once `critical_section_deadline` has passed, since the donor
    /// no longer guarantees that writes to the range are blocked.
    CommitMigration {
        /// Lower bound of the migrated chunk
        min: ShardKeyValue,
        /// Current owner
        donor: ShardId,
        /// New owner
        recipient: ShardId,
        /// Deadline of the donor's critical section
        critical_section_deadline: Timestamp,
    },
}

/// Replicated, versioned store of cluster metadata.
pub struct ConfigStore {
    kv: Arc<dyn KvStore>,
    replicator: Arc<dyn Replicator>,
    gates: DashMap<String, Arc<Mutex<()>>>,
    version_tx: watch::Sender<u64>,
}

impl ConfigStore {
    /// Creates a store over the given KV backend and replica set.
    pub fn new(kv: Arc<dyn KvStore>, replicator: Arc<dyn Replicator>) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            kv,
            replicator,
            gates: DashMap::new(),
            version_tx,
        }
    }

    /// In-memory store backed by a local replica set of `replicas` members.
    pub fn in_memory(replicas: usize) -> Self {
        Self::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(LocalReplicaSet::new(replicas, Duration::from_secs(1))),
        )
    }

    /// Current global config version.
    pub fn config_version(&self) -> u64 {
        *self.version_tx.borrow()
    }

    /// Subscribes to config version changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    // ---- shards ----

    /// Adds a shard to the inventory.
    pub async fn add_shard(&self, record: ShardRecord) -> Result<(), MetaError> {
        let key = format!("{}{}", SHARD_PREFIX, record.id);
        let _gate = self.lock_key(&key).await;
        if self.get_record::<ShardRecord>(&key)?.is_some() {
            return Err(MetaError::InvalidRequest(format!(
                "shard {} already exists",
                record.id
            )));
        }
        self.persist(&key, 0, Some(&record)).await?;
        tracing::info!(shard = %record.id, host = %record.host, "shard added");
        Ok(())
    }

    /// All shards, ordered by id.
    pub fn shards(&self) -> Result<Vec<ShardRecord>, MetaError> {
        self.scan(SHARD_PREFIX)
    }

    /// A single shard.
    pub fn shard(&self, id: &ShardId) -> Result<ShardRecord, MetaError> {
        self.get_record(&format!("{}{}", SHARD_PREFIX, id))?
            .map(|(_, r)| r)
            .ok_or_else(|| MetaError::ShardNotFound(id.clone()))
    }

    /// Adds or removes a zone on a shard.
    pub async fn update_shard_zone(
        &self,
        id: &ShardId,
        zone: &str,
        add: bool,
    ) -> Result<ShardRecord, MetaError> {
        let key = format!("{}{}", SHARD_PREFIX, id);
        let _gate = self.lock_key(&key).await;
        let (rev, mut record) = self
            .get_record::<ShardRecord>(&key)?
            .ok_or_else(|| MetaError::ShardNotFound(id.clone()))?;
        if add {
            record.zones.insert(zone.to_string());
        } else {
            record.zones.remove(zone);
        }
        self.persist(&key, rev, Some(&record)).await?;
        Ok(record)
    }

    // ---- databases ----

    /// Marks a database partitioned, creating it with a primary shard if needed.
    ///
    /// The primary is the shard with the fewest chunks, then the fewest
    /// primaried databases, then the lowest id.
    pub async fn enable_database(&self, name: &str) -> Result<DatabaseRecord, MetaError> {
        let key = format!("{}{}", DATABASE_PREFIX, name);
        let _gate = self.lock_key(&key).await;
        if let Some((rev, mut record)) = self.get_record::<DatabaseRecord>(&key)? {
            if !record.partitioned {
                record.partitioned = true;
                self.persist(&key, rev, Some(&record)).await?;
            }
            return Ok(record);
        }

        let primary = self.choose_primary()?;
        let record = DatabaseRecord {
            name: name.to_string(),
            primary,
            partitioned: true,
        };
        self.persist(&key, 0, Some(&record)).await?;
        tracing::info!(db = name, primary = %record.primary, "sharding enabled");
        Ok(record)
    }

    /// A database record, if the database is known.
    pub fn database(&self, name: &str) -> Result<Option<DatabaseRecord>, MetaError> {
        Ok(self
            .get_record(&format!("{}{}", DATABASE_PREFIX, name))?
            .map(|(_, r)| r))
    }

    /// All database records, ordered by name.
    pub fn databases(&self) -> Result<Vec<DatabaseRecord>, MetaError> {
        self.scan(DATABASE_PREFIX)
    }

    fn choose_primary(&self) -> Result<ShardId, MetaError> {
        let shards = self.shards()?;
        if shards.is_empty() {
            return Err(MetaError::InvalidRequest(
                "no shards in the cluster".to_string(),
            ));
        }
        let chunks = self.chunk_counts_by_shard()?;
        let mut primaried: BTreeMap<ShardId, usize> = BTreeMap::new();
        for db in self.databases()? {
            *primaried.entry(db.primary).or_insert(0) += 1;
        }
        shards
            .into_iter()
            .map(|s| s.id)
            .min_by_key(|id| {
                (
                    chunks.get(id).copied().unwrap_or(0),
                    primaried.get(id).copied().unwrap_or(0),
                    id.clone(),
                )
            })
            .ok_or_else(|| MetaError::InvalidRequest("no shards in the cluster".to_string()))
    }

    // ---- collections ----

    /// Shards a collection: one chunk over the full key range on the database primary.
    pub async fn create_collection(
        &self,
        ns: &Namespace,
        key_pattern: ShardKeyPattern,
    ) -> Result<CollectionMetadata, MetaError> {
        let key = collection_key(ns);
        let _gate = self.lock_key(&key).await;
        let db = self
            .get_record::<DatabaseRecord>(&format!("{}{}", DATABASE_PREFIX, ns.db))?
            .map(|(_, r)| r)
            .filter(|r| r.partitioned)
            .ok_or_else(|| MetaError::ShardingNotEnabled(ns.db.clone()))?;
        if self.get_record::<CollectionMetadata>(&key)?.is_some() {
            return Err(MetaError::AlreadySharded(ns.clone()));
        }

        let metadata = CollectionMetadata {
            ns: ns.clone(),
            key_pattern,
            chunks: ChunkMap::new_full(ns.clone(), Epoch::generate(), db.primary.clone()),
            zones: Vec::new(),
        };
        self.persist(&key, 0, Some(&metadata)).await?;
        tracing::info!(
            ns = %ns,
            key = %metadata.key_pattern,
            epoch = %metadata.epoch(),
            shard = %db.primary,
            "collection sharded"
        );
        Ok(metadata)
    }

    /// Reads the current metadata and version of a collection.
    pub fn read_metadata(
        &self,
        ns: &Namespace,
    ) -> Result<(CollectionMetadata, CollectionVersion), MetaError> {
        let (_, metadata) = self.load_collection(ns)?;
        let version = metadata.version();
        Ok((metadata, version))
    }

    /// All sharded collections, ordered by namespace.
    pub fn collections(&self) -> Result<Vec<CollectionMetadata>, MetaError> {
        self.scan(COLLECTION_PREFIX)
    }

    /// Commits a chunk map change if the collection is still at `expected`.
    ///
    /// Fails with `VersionConflict` (carrying the current version) if another
    /// commit or an epoch change got there first. Exactly one of several
    /// commits against the same version succeeds.
    pub async fn commit(
        &self,
        ns: &Namespace,
        expected: CollectionVersion,
        mutation: CollectionMutation,
    ) -> Result<CollectionVersion, MetaError> {
        let _gate = self.lock_key(&collection_key(ns)).await;
        let (rev, mut metadata) = self.load_collection(ns)?;
        let current = metadata.version();
        if current != expected {
            return Err(MetaError::VersionConflict {
                key: collection_key(ns),
                expected: expected.to_string(),
                found: current.to_string(),
                current: Some(current),
            });
        }

        let new_chunks = match mutation {
            CollectionMutation::ReplaceChunks(chunks) => chunks,
            CollectionMutation::CommitMigration {
                min,
                donor,
                recipient,
                critical_section_deadline,
            } => {
                let chunk_id = ChunkId {
                    ns: ns.clone(),
                    min: min.clone(),
                };
                if Timestamp::now() > critical_section_deadline {
                    return Err(MetaError::MigrationAborted {
                        chunk: chunk_id,
                        reason: "critical section deadline passed before commit".to_string(),
                        current: None,
                    });
                }
                let chunk = metadata.chunks.get(&min).ok_or_else(|| {
                    MetaError::InvalidRequest(format!("no chunk of {} starts at {}", ns, min))
                })?;
                if chunk.shard != donor {
                    return Err(MetaError::MigrationAborted {
                        chunk: chunk_id,
                        reason: format!("chunk is owned by {}, not donor {}", chunk.shard, donor),
                        current: Some(current),
                    });
                }
                let mut moved = chunk.clone();
                moved.shard = recipient;
                moved.version = current.version.next_major();
                vec![moved]
            }
        };

        let new_version = metadata.chunks.apply_delta(expected, new_chunks)?;
        self.persist(&collection_key(ns), rev, Some(&metadata)).await?;
        tracing::info!(
            ns = %ns,
            from = %expected.version,
            to = %new_version.version,
            "chunk map committed"
        );
        Ok(new_version)
    }

    /// Replaces a collection's zone ranges.
    pub async fn set_zone_ranges(
        &self,
        ns: &Namespace,
        zones: Vec<ZoneRange>,
    ) -> Result<(), MetaError> {
        self.update_zone_ranges(ns, |current| *current = zones)
            .await
            .map(|_| ())
    }

    /// Edits a collection's zone ranges in place and returns the result.
    ///
    /// Ranges must not overlap and every zone must be served by at least one
    /// shard. Chunks that straddle a zone boundary are split there in the same
    /// write, so every chunk lies either wholly inside one zone or outside all.
    pub async fn update_zone_ranges<F>(
        &self,
        ns: &Namespace,
        f: F,
    ) -> Result<Vec<ZoneRange>, MetaError>
    where
        F: FnOnce(&mut Vec<ZoneRange>),
    {
        let _gate = self.lock_key(&collection_key(ns)).await;
        let (rev, mut metadata) = self.load_collection(ns)?;
        let shards = self.shards()?;
        f(&mut metadata.zones);
        let zones = &metadata.zones;
        for (i, z) in zones.iter().enumerate() {
            if z.range.min >= z.range.max {
                return Err(MetaError::InvalidRequest(format!(
                    "empty zone range {}",
                    z.range
                )));
            }
            if !shards.iter().any(|s| s.serves(&z.zone)) {
                return Err(MetaError::InvalidRequest(format!(
                    "zone {} is not assigned to any shard",
                    z.zone
                )));
            }
            if zones[..i].iter().any(|o| o.range.overlaps(&z.range)) {
                return Err(MetaError::InvalidRequest(format!(
                    "zone range {} overlaps an existing range",
                    z.range
                )));
            }
        }
        metadata.zones.sort_by(|a, b| a.range.min.cmp(&b.range.min));
        let splits = metadata.align_chunks_to_zones()?;
        self.persist(&collection_key(ns), rev, Some(&metadata)).await?;
        if splits > 0 {
            tracing::info!(
                ns = %ns,
                splits,
                version = %metadata.version().version,
                "chunks split at zone boundaries"
            );
        }
        Ok(metadata.zones)
    }

    /// Removes a sharded collection and all of its chunks.
    pub async fn drop_collection(&self, ns: &Namespace) -> Result<(), MetaError> {
        let _gate = self.lock_key(&collection_key(ns)).await;
        let (rev, metadata) = self.load_collection(ns)?;
        self.persist::<CollectionMetadata>(&collection_key(ns), rev, None)
            .await?;
        tracing::info!(ns = %ns, epoch = %metadata.epoch(), "collection dropped");
        Ok(())
    }

    /// Chunk count per shard across all collections. Shards without chunks appear with 0.
    pub fn chunk_counts_by_shard(&self) -> Result<BTreeMap<ShardId, usize>, MetaError> {
        let mut counts: BTreeMap<ShardId, usize> =
            self.shards()?.into_iter().map(|s| (s.id, 0)).collect();
        for coll in self.collections()? {
            for (shard, n) in coll.chunks.counts_by_shard() {
                *counts.entry(shard).or_insert(0) += n;
            }
        }
        Ok(counts)
    }

    // ---- settings ----

    /// Current balancer settings (defaults if never written).
    pub fn balancer_settings(&self) -> Result<BalancerSettings, MetaError> {
        Ok(self
            .get_record(BALANCER_SETTINGS_KEY)?
            .map(|(_, s)| s)
            .unwrap_or_default())
    }

    /// Updates the balancer settings in place.
    pub async fn update_balancer_settings<F>(&self, f: F) -> Result<BalancerSettings, MetaError>
    where
        F: FnOnce(&mut BalancerSettings),
    {
        let _gate = self.lock_key(BALANCER_SETTINGS_KEY).await;
        let (rev, mut settings) = self
            .get_record::<BalancerSettings>(BALANCER_SETTINGS_KEY)?
            .unwrap_or((0, BalancerSettings::default()));
        f(&mut settings);
        self.persist(BALANCER_SETTINGS_KEY, rev, Some(&settings))
            .await?;
        Ok(settings)
    }

    // ---- generic records (leases) ----

    /// Reads a record with its revision.
    pub(crate) fn get_record<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<(Revision, T)>, MetaError> {
        match self.kv.get_versioned(key.as_bytes())? {
            Some((rev, bytes)) => Ok(Some((rev, bincode::deserialize(&bytes)?))),
            None => Ok(None),
        }
    }

    /// Writes (or deletes, with `None`) a record if it is still at `expected`.
    pub(crate) async fn compare_and_put<T: Serialize>(
        &self,
        key: &str,
        expected: Revision,
        value: Option<&T>,
    ) -> Result<Revision, MetaError> {
        let _gate = self.lock_key(key).await;
        self.persist(key, expected, value).await
    }

    // ---- internals ----

    async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let gate = Arc::clone(&*self.gates.entry(key.to_string()).or_default());
        gate.lock_owned().await
    }

    fn load_collection(
        &self,
        ns: &Namespace,
    ) -> Result<(Revision, CollectionMetadata), MetaError> {
        self.get_record(&collection_key(ns))?
            .ok_or_else(|| MetaError::NamespaceNotFound(ns.clone()))
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, MetaError> {
        self.kv
            .scan_prefix(prefix.as_bytes())?
            .into_iter()
            .map(|(_, v)| bincode::deserialize(&v).map_err(MetaError::from))
            .collect()
    }

    /// Replicates then applies a write. Caller must hold the gate of `key`.
    async fn persist<T: Serialize>(
        &self,
        key: &str,
        expected: Revision,
        value: Option<&T>,
    ) -> Result<Revision, MetaError> {
        let found = self
            .kv
            .get_versioned(key.as_bytes())?
            .map(|(rev, _)| rev)
            .unwrap_or(0);
        if found != expected {
            return Err(MetaError::VersionConflict {
                key: key.to_string(),
                expected: expected.to_string(),
                found: found.to_string(),
                current: None,
            });
        }
        let bytes = value.map(bincode::serialize).transpose()?;
        self.replicator
            .commit_with_majority(ReplicationPayload {
                key: key.to_string(),
                value: bytes.clone(),
            })
            .await?;

        let rev = match bytes {
            Some(bytes) => self
                .kv
                .put_if_revision(key.as_bytes().to_vec(), expected, bytes)?,
            None => {
                self.kv.delete_if_revision(key.as_bytes(), expected)?;
                0
            }
        };
        self.version_tx.send_modify(|v| *v += 1);
        Ok(rev)
    }
}

fn collection_key(ns: &Namespace) -> String {
    format!("{}{}", COLLECTION_PREFIX, ns)
}
