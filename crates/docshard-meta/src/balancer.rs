//! Chunk balancer.
//!
//! A round walks `Idle -> Scanning -> Planning -> Migrating -> ... -> Idle`.
//! It scans every sharded collection, plans one migration at a time against
//! fresh metadata and hands it to the [`MigrationCoordinator`], waiting for
//! the result before planning the next. Rounds only run while this instance
//! holds the cluster-wide balancer lease, which is renewed on a heartbeat
//! while a migration runs. Losing the lease aborts the running migration and
//! ends the round.
//!
//! Planning is zone-aware. Chunks sitting on a shard outside their zone are
//! moved first. After that each zone (and the unzoned remainder) is balanced
//! on its own, over the shards allowed to hold its chunks. A chunk is never
//! planned onto a shard that misses any zone touching its range.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::BalancerConfig;
use crate::config_store::{CollectionMetadata, ConfigStore, ShardRecord};
use crate::lease::BalancerLease;
use crate::migration::{MigrationCoordinator, MigrationOutcome};
use crate::types::*;

/// Balancer round state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BalancerState {
    /// Between rounds
    Idle,
    /// Reading chunk distribution
    Scanning,
    /// Choosing the next migration
    Planning,
    /// Waiting on a migration
    Migrating,
}

impl fmt::Display for BalancerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a migration was planned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanReason {
    /// The chunk is on a shard that does not serve its zone
    ZoneViolation,
    /// Chunk counts differ by more than the threshold
    Imbalance,
}

/// One planned chunk move.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationPlan {
    /// Collection
    pub ns: Namespace,
    /// Chunk to move
    pub range: ChunkRange,
    /// Donor
    pub from: ShardId,
    /// Recipient
    pub to: ShardId,
    /// Why
    pub reason: PlanReason,
}

/// Summary of one balancer round.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundReport {
    /// Collections scanned
    pub collections: usize,
    /// Migrations committed
    pub migrations: usize,
    /// Migrations that failed
    pub failures: usize,
}

type ShardPair = (ShardId, ShardId);

/// Picks the next migration for a collection, or `None` if it is balanced.
///
/// A chunk is never planned onto a shard outside its zone. Donor/recipient
/// pairs in `skip` are not considered.
pub fn plan_migration(
    metadata: &CollectionMetadata,
    shards: &[ShardRecord],
    threshold: usize,
    skip: &HashSet<ShardPair>,
) -> Option<MigrationPlan> {
    let eligible = |zone: Option<&str>| -> Vec<&ShardRecord> {
        shards
            .iter()
            .filter(|s| zone.map_or(true, |z| s.serves(z)))
            .collect()
    };

    // count of chunks per (zone group, shard)
    let mut groups: BTreeMap<Option<&str>, BTreeMap<&ShardId, usize>> = BTreeMap::new();
    for chunk in metadata.chunks.iter() {
        let zone = metadata.zone_for(&chunk.range);
        *groups
            .entry(zone)
            .or_default()
            .entry(&chunk.shard)
            .or_insert(0) += 1;
    }

    for chunk in metadata.chunks.iter() {
        let Some(zone) = metadata.zone_for(&chunk.range) else {
            continue;
        };
        let allowed = eligible(Some(zone));
        if allowed.iter().any(|s| s.id == chunk.shard) {
            continue;
        }
        let counts = groups.get(&Some(zone));
        let target = allowed
            .iter()
            .filter(|s| metadata.may_hold(&chunk.range, s))
            .filter(|s| !skip.contains(&(chunk.shard.clone(), s.id.clone())))
            .min_by_key(|s| {
                (
                    counts.and_then(|c| c.get(&s.id)).copied().unwrap_or(0),
                    s.id.clone(),
                )
            });
        if let Some(target) = target {
            return Some(MigrationPlan {
                ns: metadata.ns.clone(),
                range: chunk.range.clone(),
                from: chunk.shard.clone(),
                to: target.id.clone(),
                reason: PlanReason::ZoneViolation,
            });
        }
    }

    for (zone, counts) in &groups {
        let allowed = eligible(*zone);
        let count_of = |id: &ShardId| counts.get(id).copied().unwrap_or(0);
        // donor's lowest chunk in this group that the recipient may hold
        let movable = |donor: &ShardId, recipient: &ShardRecord| {
            metadata.chunks.iter().find(|c| {
                c.shard == *donor
                    && metadata.zone_for(&c.range) == *zone
                    && metadata.may_hold(&c.range, recipient)
            })
        };

        let mut best: Option<(usize, &ShardId, &ShardId, &ChunkRange)> = None;
        for donor in &allowed {
            for recipient in &allowed {
                let (d, r) = (count_of(&donor.id), count_of(&recipient.id));
                if d <= r || d - r <= threshold {
                    continue;
                }
                if skip.contains(&(donor.id.clone(), recipient.id.clone())) {
                    continue;
                }
                let delta = d - r;
                let better = match best {
                    None => true,
                    Some((bd, bdonor, brecipient, _)) => {
                        delta > bd
                            || (delta == bd
                                && (&donor.id, &recipient.id) < (bdonor, brecipient))
                    }
                };
                if !better {
                    continue;
                }
                if let Some(chunk) = movable(&donor.id, *recipient) {
                    best = Some((delta, &donor.id, &recipient.id, &chunk.range));
                }
            }
        }

        if let Some((_, donor, recipient, range)) = best {
            return Some(MigrationPlan {
                ns: metadata.ns.clone(),
                range: range.clone(),
                from: donor.clone(),
                to: recipient.clone(),
                reason: PlanReason::Imbalance,
            });
        }
    }
    None
}

/// Background chunk balancer for one coordinator instance.
pub struct Balancer {
    store: Arc<ConfigStore>,
    migrations: Arc<MigrationCoordinator>,
    lease: BalancerLease,
    config: BalancerConfig,
    state_tx: watch::Sender<BalancerState>,
}

impl Balancer {
    /// Creates a balancer for `instance`.
    pub fn new(
        store: Arc<ConfigStore>,
        migrations: Arc<MigrationCoordinator>,
        instance: impl Into<String>,
        config: BalancerConfig,
    ) -> Self {
        let lease = BalancerLease::new(store.clone(), instance, config.lease_ttl());
        let (state_tx, _) = watch::channel(BalancerState::Idle);
        Self {
            store,
            migrations,
            lease,
            config,
            state_tx,
        }
    }

    /// Current round state.
    pub fn state(&self) -> BalancerState {
        *self.state_tx.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<BalancerState> {
        self.state_tx.subscribe()
    }

    /// Instance name used as lease holder.
    pub fn instance(&self) -> &str {
        self.lease.instance()
    }

    /// Runs one balancing round.
    ///
    /// Does nothing while the balancer is stopped. Fails with `LeaseHeld`
    /// when another instance is balancing.
    pub async fn run_round(&self) -> Result<RoundReport, MetaError> {
        if !self.store.balancer_settings()?.enabled {
            tracing::debug!(instance = self.instance(), "balancer stopped, skipping round");
            return Ok(RoundReport::default());
        }
        self.lease.try_acquire().await?;

        let result = self.balance().await;

        self.set_state(BalancerState::Idle);
        if let Err(e) = self.lease.release().await {
            tracing::warn!(instance = self.instance(), error = %e, "failed to release balancer lease");
        }
        result
    }

    async fn balance(&self) -> Result<RoundReport, MetaError> {
        self.set_state(BalancerState::Scanning);
        let collections = self.store.collections()?;
        let shards = self.store.shards()?;
        let mut report = RoundReport {
            collections: collections.len(),
            ..RoundReport::default()
        };
        let mut skip: HashSet<ShardPair> = HashSet::new();

        for collection in collections {
            let ns = collection.ns;
            loop {
                if report.migrations + report.failures >= self.config.max_migrations_per_round {
                    tracing::debug!(instance = self.instance(), "migration limit for round reached");
                    return Ok(report);
                }
                self.set_state(BalancerState::Planning);
                let metadata = match self.store.read_metadata(&ns) {
                    Ok((metadata, _)) => metadata,
                    Err(MetaError::NamespaceNotFound(_)) => break,
                    Err(e) => return Err(e),
                };
                let Some(plan) =
                    plan_migration(&metadata, &shards, self.config.imbalance_threshold, &skip)
                else {
                    break;
                };

                self.lease.renew().await?;
                self.set_state(BalancerState::Migrating);
                tracing::debug!(
                    ns = %ns,
                    range = %plan.range,
                    from = %plan.from,
                    to = %plan.to,
                    reason = ?plan.reason,
                    "balancer planned migration"
                );
                match self.migrate_under_lease(&ns, &plan).await {
                    Ok(_) => report.migrations += 1,
                    Err(e @ MetaError::LeaseHeld { .. }) => {
                        tracing::warn!(
                            instance = self.instance(),
                            ns = %ns,
                            error = %e,
                            "balancer lease lost during migration, ending round"
                        );
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!(
                            ns = %ns,
                            from = %plan.from,
                            to = %plan.to,
                            error = %e,
                            "balancer migration failed, skipping pair for this round"
                        );
                        report.failures += 1;
                        skip.insert((plan.from, plan.to));
                    }
                }
            }
        }
        Ok(report)
    }

    /// Runs one migration, renewing the lease every third of its lifetime.
    ///
    /// If a renewal fails the migration is aborted and the renewal error returned.
    async fn migrate_under_lease(
        &self,
        ns: &Namespace,
        plan: &MigrationPlan,
    ) -> Result<MigrationOutcome, MetaError> {
        let period = (self.config.lease_ttl() / 3).max(Duration::from_millis(1));
        let heartbeat = async {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.lease.renew().await {
                    Ok(lease) => tracing::trace!(
                        instance = self.instance(),
                        expires_at_ms = lease.expires_at.as_millis(),
                        "balancer lease renewed"
                    ),
                    Err(e) => return e,
                }
            }
        };
        self.migrations
            .move_chunk_until(ns, &plan.range.min, &plan.to, heartbeat)
            .await
    }

    /// Runs rounds every `interval_ms` until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_round().await {
                            Ok(report) if report.migrations + report.failures > 0 => {
                                tracing::info!(
                                    instance = self.instance(),
                                    migrations = report.migrations,
                                    failures = report.failures,
                                    "balancer round finished"
                                );
                            }
                            Ok(_) => {}
                            Err(MetaError::LeaseHeld { holder, .. }) => {
                                tracing::debug!(instance = self.instance(), %holder, "balancer lease held elsewhere");
                            }
                            Err(e) => {
                                tracing::warn!(instance = self.instance(), error = %e, "balancer round failed");
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!(instance = self.instance(), "balancer stopped");
        })
    }

    fn set_state(&self, state: BalancerState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!(from = %current, to = %state, "balancer state");
                *current = state;
                true
            }
        });
    }
}

/// Shards ordered by chunk count for one collection, zero-count shards included.
pub fn distribution(
    metadata: &CollectionMetadata,
    shards: &[ShardRecord],
) -> BTreeMap<ShardId, usize> {
    let mut counts: BTreeMap<ShardId, usize> = shards.iter().map(|s| (s.id.clone(), 0)).collect();
    for (shard, n) in metadata.chunks.counts_by_shard() {
        counts.insert(shard, n);
    }
    counts
}
