//! Chunk splitting.
//!
//! A split replaces one chunk with N+1 contiguous children on the same shard.
//! Children take successive minor versions above the collection's current
//! version, so the version stays strictly increasing. Plans are built
//! against a metadata snapshot and committed with CAS; on conflict the plan
//! is thrown away and rebuilt from fresh metadata.

use std::sync::Arc;

use crate::chunk_map::Chunk;
use crate::config::{RetryConfig, SplitConfig};
use crate::config_store::{CollectionMutation, ConfigStore};
use crate::retry::RetryExecutor;
use crate::types::*;

/// Size estimate for one chunk, as reported by the owning shard.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkSizeEstimate {
    /// Estimated data size in bytes
    pub bytes: u64,
    /// Shard key values sampled from the chunk's documents
    pub sampled_keys: Vec<ShardKeyValue>,
}

/// A split the planner wants to perform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitRequest {
    /// Collection
    pub ns: Namespace,
    /// Lower bound of the chunk to split
    pub chunk_min: ShardKeyValue,
    /// Split points, strictly increasing
    pub points: Vec<ShardKeyValue>,
}

/// Plans and commits chunk splits.
pub struct SplitPlanner {
    store: Arc<ConfigStore>,
    retry: RetryExecutor,
}

impl SplitPlanner {
    /// Creates a planner committing to `store`.
    pub fn new(store: Arc<ConfigStore>, retry: RetryConfig) -> Self {
        Self {
            store,
            retry: RetryExecutor::new(retry),
        }
    }

    /// Computes the children of `chunk` split at `points`.
    ///
    /// Points must lie strictly inside the chunk and be strictly increasing.
    /// `base` is the collection's current version; children are numbered
    /// upward from it.
    pub fn plan_split(
        chunk: &Chunk,
        points: &[ShardKeyValue],
        base: ChunkVersion,
    ) -> Result<Vec<Chunk>, MetaError> {
        if points.is_empty() {
            return Err(MetaError::InvalidRequest(
                "split requires at least one split point".to_string(),
            ));
        }
        let invalid = |point: &ShardKeyValue, reason: &str| MetaError::InvalidSplitPoint {
            point: point.clone(),
            range: chunk.range.clone(),
            reason: reason.to_string(),
        };

        let mut prev: Option<&ShardKeyValue> = None;
        for point in points {
            if *point == chunk.range.min || *point == chunk.range.max {
                return Err(invalid(point, "point is an existing chunk boundary"));
            }
            if !chunk.range.strictly_inside(point) {
                return Err(invalid(point, "point is outside the chunk range"));
            }
            if prev.map_or(false, |p| p >= point) {
                return Err(invalid(point, "split points must be strictly increasing"));
            }
            prev = Some(point);
        }

        let mut bounds = Vec::with_capacity(points.len() + 2);
        bounds.push(chunk.range.min.clone());
        bounds.extend(points.iter().cloned());
        bounds.push(chunk.range.max.clone());

        let mut version = base;
        Ok(bounds
            .windows(2)
            .map(|w| {
                version = version.next_minor();
                Chunk::new(
                    chunk.ns.clone(),
                    ChunkRange::new(w[0].clone(), w[1].clone()),
                    chunk.shard.clone(),
                    version,
                )
            })
            .collect())
    }

    /// Decides whether an oversized chunk should split, and where.
    ///
    /// Uses the median of the sampled keys that fall strictly inside the
    /// chunk. With an even sample count the median is ambiguous and the
    /// midpoint of the two middle samples is used instead.
    pub fn auto_split(
        chunk: &Chunk,
        estimate: &ChunkSizeEstimate,
        policy: &SplitConfig,
    ) -> Option<SplitRequest> {
        if estimate.bytes <= policy.max_chunk_size_bytes {
            return None;
        }
        let mut samples: Vec<&ShardKeyValue> = estimate
            .sampled_keys
            .iter()
            .filter(|k| chunk.range.strictly_inside(k))
            .collect();
        samples.sort();
        samples.dedup();
        if samples.is_empty() || samples.len() < policy.min_samples {
            tracing::debug!(
                chunk = %chunk.id(),
                samples = samples.len(),
                "chunk oversized but too few samples to split"
            );
            return None;
        }

        let n = samples.len();
        let median = if n % 2 == 1 {
            samples[n / 2].clone()
        } else {
            ShardKeyValue::midpoint(samples[n / 2 - 1], samples[n / 2])
        };
        if !chunk.range.strictly_inside(&median) {
            return None;
        }
        Some(SplitRequest {
            ns: chunk.ns.clone(),
            chunk_min: chunk.range.min.clone(),
            points: vec![median],
        })
    }

    /// Splits the chunk containing `middle` at `middle`.
    pub async fn split_at(
        &self,
        ns: &Namespace,
        middle: ShardKeyValue,
    ) -> Result<CollectionVersion, MetaError> {
        self.split_points(ns, vec![middle]).await
    }

    /// Splits the chunk containing the first point at every point given.
    ///
    /// All points must fall inside that one chunk.
    pub async fn split_points(
        &self,
        ns: &Namespace,
        points: Vec<ShardKeyValue>,
    ) -> Result<CollectionVersion, MetaError> {
        let first = points
            .first()
            .cloned()
            .ok_or_else(|| MetaError::InvalidRequest("no split points given".to_string()))?;
        let store = &self.store;
        let points = &points;
        let first = &first;
        self.retry
            .execute("split", move || async move {
                let (metadata, version) = store.read_metadata(ns)?;
                let chunk = metadata.chunks.lookup(first)?;
                let children = Self::plan_split(chunk, points, version.version)?;
                let new_version = store
                    .commit(ns, version, CollectionMutation::ReplaceChunks(children))
                    .await?;
                tracing::info!(
                    ns = %ns,
                    chunk = %chunk.range,
                    points = points.len(),
                    version = %new_version.version,
                    "chunk split"
                );
                Ok(new_version)
            })
            .await
    }

    /// Runs the auto-split policy for the chunk starting at `chunk_min` and
    /// commits the split if one is warranted.
    ///
    /// Returns `None` without touching metadata when auto-split is disabled
    /// or the chunk does not need splitting.
    pub async fn maybe_auto_split(
        &self,
        ns: &Namespace,
        chunk_min: &ShardKeyValue,
        estimate: &ChunkSizeEstimate,
        policy: &SplitConfig,
    ) -> Result<Option<CollectionVersion>, MetaError> {
        if !self.store.balancer_settings()?.auto_split {
            return Ok(None);
        }
        let (metadata, _) = self.store.read_metadata(ns)?;
        let chunk = metadata.chunks.get(chunk_min).ok_or_else(|| {
            MetaError::InvalidRequest(format!("no chunk of {} starts at {}", ns, chunk_min))
        })?;
        match Self::auto_split(chunk, estimate, policy) {
            Some(request) => Ok(Some(self.split_points(ns, request.points).await?)),
            None => Ok(None),
        }
    }
}
