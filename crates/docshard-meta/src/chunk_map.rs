//! Ordered chunk map for one sharded collection.
//!
//! Chunks partition the whole key space `[MinKey, MaxKey)` with no gaps and
//! no overlaps. The map is keyed by each chunk's lower bound, so lookup is a
//! single ordered range lookup. Maps held outside the config store are
//! read-only snapshots tagged with a [`CollectionVersion`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::*;

/// A contiguous key range owned by one shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Owning collection
    pub ns: Namespace,
    /// Key range `[min, max)`
    pub range: ChunkRange,
    /// Shard that owns the range
    pub shard: ShardId,
    /// Version, bumped on every split or move of this chunk
    pub version: ChunkVersion,
}

impl Chunk {
    /// Creates a new chunk
    pub fn new(ns: Namespace, range: ChunkRange, shard: ShardId, version: ChunkVersion) -> Self {
        Self {
            ns,
            range,
            shard,
            version,
        }
    }

    /// Identifier of this chunk
    pub fn id(&self) -> ChunkId {
        ChunkId {
            ns: self.ns.clone(),
            min: self.range.min.clone(),
        }
    }
}

/// Chunk map of a collection, keyed by chunk lower bound.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMap {
    ns: Namespace,
    epoch: Epoch,
    chunks: BTreeMap<ShardKeyValue, Chunk>,
}

impl ChunkMap {
    /// A map with one chunk spanning the full key space on `shard`, version 1|0.
    pub fn new_full(ns: Namespace, epoch: Epoch, shard: ShardId) -> Self {
        let chunk = Chunk::new(ns.clone(), ChunkRange::full(), shard, ChunkVersion::INITIAL);
        let mut chunks = BTreeMap::new();
        chunks.insert(ShardKeyValue::MinKey, chunk);
        Self { ns, epoch, chunks }
    }

    /// Builds a map from an arbitrary chunk list, enforcing the partition invariant.
    pub fn from_chunks(ns: Namespace, epoch: Epoch, chunks: Vec<Chunk>) -> Result<Self, MetaError> {
        let given = chunks.len();
        let chunks: BTreeMap<ShardKeyValue, Chunk> = chunks
            .into_iter()
            .map(|c| (c.range.min.clone(), c))
            .collect();
        if chunks.len() != given {
            return Err(MetaError::InvalidChunkMap(format!(
                "{} chunks share a lower bound with another chunk",
                given - chunks.len()
            )));
        }
        let map = Self { ns, epoch, chunks };
        map.validate()?;
        Ok(map)
    }

    /// Collection this map belongs to
    pub fn ns(&self) -> &Namespace {
        &self.ns
    }

    /// Collection epoch
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Collection version: epoch plus the highest chunk version.
    pub fn version(&self) -> CollectionVersion {
        let version = self
            .chunks
            .values()
            .map(|c| c.version)
            .max()
            .unwrap_or(ChunkVersion::INITIAL);
        CollectionVersion::new(self.epoch, version)
    }

    /// Number of chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns true if the map has no chunks (never true for a valid map)
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks in key order
    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// The chunk starting exactly at `min`, if any
    pub fn get(&self, min: &ShardKeyValue) -> Option<&Chunk> {
        self.chunks.get(min)
    }

    /// The chunk whose range contains `key`.
    ///
    /// Every key except MaxKey resolves to exactly one chunk.
    pub fn lookup(&self, key: &ShardKeyValue) -> Result<&Chunk, MetaError> {
        self.chunks
            .range(..=key.clone())
            .next_back()
            .map(|(_, c)| c)
            .filter(|c| c.range.contains(key))
            .ok_or_else(|| {
                MetaError::InvalidRequest(format!("key {} is outside every chunk of {}", key, self.ns))
            })
    }

    /// Chunks owned by `shard`, in key order
    pub fn chunks_for_shard(&self, shard: &ShardId) -> Vec<&Chunk> {
        self.chunks.values().filter(|c| &c.shard == shard).collect()
    }

    /// Chunk count per owning shard
    pub fn counts_by_shard(&self) -> BTreeMap<ShardId, usize> {
        let mut counts = BTreeMap::new();
        for chunk in self.chunks.values() {
            *counts.entry(chunk.shard.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Replaces the chunks covered by `new_chunks` in one step.
    ///
    /// `expected` must equal the current version or the call fails with
    /// `StaleVersion`. The new chunks must be contiguous, start and end on
    /// existing boundaries, and all carry versions above the current one.
    /// On any failure the map is left untouched.
    pub fn apply_delta(
        &mut self,
        expected: CollectionVersion,
        mut new_chunks: Vec<Chunk>,
    ) -> Result<CollectionVersion, MetaError> {
        let current = self.version();
        if expected != current {
            return Err(MetaError::StaleVersion {
                ns: self.ns.clone(),
                expected,
                current,
            });
        }
        if new_chunks.is_empty() {
            return Err(MetaError::InvalidChunkMap("empty delta".to_string()));
        }
        new_chunks.sort_by(|a, b| a.range.min.cmp(&b.range.min));

        for pair in new_chunks.windows(2) {
            if pair[0].range.max != pair[1].range.min {
                return Err(MetaError::InvalidChunkMap(format!(
                    "delta chunks {} and {} are not contiguous",
                    pair[0].range, pair[1].range
                )));
            }
        }
        for chunk in &new_chunks {
            if chunk.ns != self.ns {
                return Err(MetaError::InvalidChunkMap(format!(
                    "chunk of {} in delta for {}",
                    chunk.ns, self.ns
                )));
            }
            if chunk.range.min >= chunk.range.max {
                return Err(MetaError::InvalidChunkMap(format!(
                    "empty chunk {} in delta",
                    chunk.range
                )));
            }
            if chunk.version <= current.version {
                return Err(MetaError::InvalidChunkMap(format!(
                    "chunk {} version {} does not advance past {}",
                    chunk.range, chunk.version, current.version
                )));
            }
        }

        let span = ChunkRange::new(
            new_chunks[0].range.min.clone(),
            new_chunks[new_chunks.len() - 1].range.max.clone(),
        );
        let replaced: Vec<ShardKeyValue> = self
            .chunks
            .range(span.min.clone()..span.max.clone())
            .map(|(k, _)| k.clone())
            .collect();
        let last_replaced = replaced
            .last()
            .and_then(|k| self.chunks.get(k))
            .map(|c| c.range.max.clone());
        if replaced.first() != Some(&span.min) || last_replaced.as_ref() != Some(&span.max) {
            return Err(MetaError::InvalidChunkMap(format!(
                "delta span {} does not align with existing chunk boundaries",
                span
            )));
        }

        let mut next = self.chunks.clone();
        for key in &replaced {
            next.remove(key);
        }
        for chunk in new_chunks {
            next.insert(chunk.range.min.clone(), chunk);
        }
        self.chunks = next;
        let version = self.version();
        tracing::debug!(
            ns = %self.ns,
            replaced = replaced.len(),
            version = %version.version,
            "applied chunk map delta"
        );
        Ok(version)
    }

    /// Checks the partition invariant: contiguous, non-empty ranges from MinKey to MaxKey.
    pub fn validate(&self) -> Result<(), MetaError> {
        let mut expected_min = ShardKeyValue::MinKey;
        for (key, chunk) in &self.chunks {
            if *key != chunk.range.min {
                return Err(MetaError::InvalidChunkMap(format!(
                    "chunk {} stored under key {}",
                    chunk.range, key
                )));
            }
            if chunk.range.min != expected_min {
                return Err(MetaError::InvalidChunkMap(format!(
                    "gap or overlap before chunk {}",
                    chunk.range
                )));
            }
            if chunk.range.min >= chunk.range.max {
                return Err(MetaError::InvalidChunkMap(format!(
                    "empty chunk {}",
                    chunk.range
                )));
            }
            expected_min = chunk.range.max.clone();
        }
        if expected_min != ShardKeyValue::MaxKey {
            return Err(MetaError::InvalidChunkMap(format!(
                "chunks of {} end at {} instead of MaxKey",
                self.ns, expected_min
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("testDB", "foo")
    }

    fn key(v: i64) -> ShardKeyValue {
        ShardKeyValue::Int(v)
    }

    fn split_at_100(map: &ChunkMap) -> Vec<Chunk> {
        let v = map.version().version;
        let shard = ShardId::new("shard0000");
        vec![
            Chunk::new(
                ns(),
                ChunkRange::new(ShardKeyValue::MinKey, key(100)),
                shard.clone(),
                v.next_minor(),
            ),
            Chunk::new(
                ns(),
                ChunkRange::new(key(100), ShardKeyValue::MaxKey),
                shard,
                v.next_minor().next_minor(),
            ),
        ]
    }

    #[test]
    fn test_new_full_covers_key_space() {
        let map = ChunkMap::new_full(ns(), Epoch::generate(), ShardId::new("shard0000"));
        map.validate().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.version().version, ChunkVersion::INITIAL);
        assert_eq!(
            map.lookup(&ShardKeyValue::MinKey).unwrap().range,
            ChunkRange::full()
        );
        assert!(map.lookup(&ShardKeyValue::MaxKey).is_err());
    }

    #[test]
    fn test_split_then_lookup() {
        let mut map = ChunkMap::new_full(ns(), Epoch::generate(), ShardId::new("shard0000"));
        let before = map.version();
        let delta = split_at_100(&map);
        let after = map.apply_delta(before, delta).unwrap();

        assert_eq!(after.version, ChunkVersion::new(1, 2));
        assert_eq!(map.len(), 2);
        assert_eq!(map.lookup(&key(50)).unwrap().range.max, key(100));
        assert_eq!(map.lookup(&key(150)).unwrap().range.min, key(100));
        assert_eq!(map.lookup(&key(100)).unwrap().range.min, key(100));
        map.validate().unwrap();
    }

    #[test]
    fn test_apply_delta_stale_version() {
        let mut map = ChunkMap::new_full(ns(), Epoch::generate(), ShardId::new("shard0000"));
        let before = map.version();
        map.apply_delta(before, split_at_100(&map)).unwrap();

        let err = map.apply_delta(before, split_at_100(&map)).unwrap_err();
        match err {
            MetaError::StaleVersion {
                expected, current, ..
            } => {
                assert_eq!(expected, before);
                assert_eq!(current.version, ChunkVersion::new(1, 2));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_apply_delta_epoch_mismatch_is_stale() {
        let mut map = ChunkMap::new_full(ns(), Epoch::generate(), ShardId::new("shard0000"));
        let foreign = CollectionVersion::new(Epoch::generate(), map.version().version);
        let delta = split_at_100(&map);
        assert!(matches!(
            map.apply_delta(foreign, delta),
            Err(MetaError::StaleVersion { .. })
        ));
    }

    #[test]
    fn test_apply_delta_rejects_gap_and_leaves_map_untouched() {
        let mut map = ChunkMap::new_full(ns(), Epoch::generate(), ShardId::new("shard0000"));
        let before_map = map.clone();
        let v = map.version();
        let shard = ShardId::new("shard0000");
        let delta = vec![
            Chunk::new(
                ns(),
                ChunkRange::new(ShardKeyValue::MinKey, key(10)),
                shard.clone(),
                v.version.next_minor(),
            ),
            Chunk::new(
                ns(),
                ChunkRange::new(key(20), ShardKeyValue::MaxKey),
                shard,
                v.version.next_minor().next_minor(),
            ),
        ];
        assert!(map.apply_delta(v, delta).is_err());
        assert_eq!(map, before_map);
    }

    #[test]
    fn test_apply_delta_rejects_misaligned_span() {
        let mut map = ChunkMap::new_full(ns(), Epoch::generate(), ShardId::new("shard0000"));
        let v = map.version();
        map.apply_delta(v, split_at_100(&map)).unwrap();
        let v = map.version();
        let delta = vec![Chunk::new(
            ns(),
            ChunkRange::new(key(50), key(150)),
            ShardId::new("shard0001"),
            v.version.next_major(),
        )];
        assert!(matches!(
            map.apply_delta(v, delta),
            Err(MetaError::InvalidChunkMap(_))
        ));
    }

    #[test]
    fn test_apply_delta_requires_version_advance() {
        let mut map = ChunkMap::new_full(ns(), Epoch::generate(), ShardId::new("shard0000"));
        let v = map.version();
        let delta = vec![Chunk::new(
            ns(),
            ChunkRange::full(),
            ShardId::new("shard0001"),
            v.version,
        )];
        assert!(map.apply_delta(v, delta).is_err());
    }

    #[test]
    fn test_move_changes_owner_and_bumps_major() {
        let mut map = ChunkMap::new_full(ns(), Epoch::generate(), ShardId::new("shard0000"));
        let v = map.version();
        map.apply_delta(v, split_at_100(&map)).unwrap();
        let v = map.version();
        let mut moved = map.lookup(&key(150)).unwrap().clone();
        moved.shard = ShardId::new("shard0001");
        moved.version = v.version.next_major();
        let after = map.apply_delta(v, vec![moved]).unwrap();
        assert_eq!(after.version, ChunkVersion::new(2, 0));
        assert_eq!(map.chunks_for_shard(&ShardId::new("shard0001")).len(), 1);
        let counts = map.counts_by_shard();
        assert_eq!(counts[&ShardId::new("shard0000")], 1);
        assert_eq!(counts[&ShardId::new("shard0001")], 1);
    }

    #[test]
    fn test_from_chunks_rejects_overlap() {
        let shard = ShardId::new("s");
        let chunks = vec![
            Chunk::new(
                ns(),
                ChunkRange::new(ShardKeyValue::MinKey, key(10)),
                shard.clone(),
                ChunkVersion::INITIAL,
            ),
            Chunk::new(
                ns(),
                ChunkRange::new(key(5), ShardKeyValue::MaxKey),
                shard,
                ChunkVersion::INITIAL,
            ),
        ];
        assert!(ChunkMap::from_chunks(ns(), Epoch::generate(), chunks).is_err());
    }

    #[test]
    fn test_from_chunks_rejects_duplicate_lower_bound() {
        let shard = ShardId::new("s");
        let full = Chunk::new(
            ns(),
            ChunkRange::full(),
            shard.clone(),
            ChunkVersion::INITIAL,
        );
        let shadowed = Chunk::new(
            ns(),
            ChunkRange::new(ShardKeyValue::MinKey, key(10)),
            shard,
            ChunkVersion::new(1, 1),
        );
        let err = ChunkMap::from_chunks(ns(), Epoch::generate(), vec![shadowed, full]).unwrap_err();
        assert!(matches!(err, MetaError::InvalidChunkMap(_)));
    }

    #[test]
    fn test_chunk_map_bincode_roundtrip() {
        let map = ChunkMap::new_full(ns(), Epoch::generate(), ShardId::new("shard0000"));
        let encoded = bincode::serialize(&map).unwrap();
        let decoded: ChunkMap = bincode::deserialize(&encoded).unwrap();
        assert_eq!(map, decoded);
    }
}
