//! Chunk migration between shards.
//!
//! A migration moves one chunk from a donor shard to a recipient as an
//! explicit state machine:
//!
//! ```text
//! Cloning -> CatchingUp -> SteadyState -> Committing -> Committed
//!    \___________\______________\____________\______-> Aborted
//! ```
//!
//! The recipient copies the chunk's documents in checkpointed batches while
//! the donor queues concurrent writes to the range. Once the queue is short,
//! the donor enters a critical section that blocks writes, the remainder is
//! flushed, and ownership moves with a CAS commit in the config store. Any
//! failure before the commit lands leaves the donor as sole owner and makes
//! the recipient discard what it cloned.
//!
//! Tickets live in memory only and are dropped on commit or abort.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::config_store::{CollectionMutation, ConfigStore};
use crate::types::*;

/// Position of a document in a chunk: its shard key, then its id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    /// Shard key value of the document
    pub key: ShardKeyValue,
    /// Document id, unique within the collection
    pub id: u64,
}

impl DocumentKey {
    /// Creates a document key
    pub fn new(key: impl Into<ShardKeyValue>, id: u64) -> Self {
        Self {
            key: key.into(),
            id,
        }
    }
}

/// Result of one clone batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloneBatch {
    /// Documents copied in this batch
    pub copied: usize,
    /// Last document copied; resume point for the next batch
    pub cursor: Option<DocumentKey>,
    /// True once every document in the range has been copied
    pub done: bool,
}

/// Data-plane operations the coordinator needs from shards.
///
/// Implementations talk to the donor and recipient; the coordinator never
/// touches documents itself.
#[async_trait]
pub trait ShardTransport: Send + Sync {
    /// Checks that a shard is reachable.
    async fn ping(&self, shard: &ShardId) -> Result<(), MetaError>;

    /// Starts capturing writes to `range` on the donor for later transfer.
    async fn start_clone(
        &self,
        donor: &ShardId,
        recipient: &ShardId,
        ns: &Namespace,
        range: &ChunkRange,
    ) -> Result<(), MetaError>;

    /// Copies up to `limit` documents after `resume_after` from donor to recipient.
    async fn clone_batch(
        &self,
        donor: &ShardId,
        recipient: &ShardId,
        ns: &Namespace,
        range: &ChunkRange,
        resume_after: Option<&DocumentKey>,
        limit: usize,
    ) -> Result<CloneBatch, MetaError>;

    /// Applies up to `limit` queued changes to the recipient. Returns how many remain queued.
    async fn transfer_changes(
        &self,
        donor: &ShardId,
        recipient: &ShardId,
        ns: &Namespace,
        range: &ChunkRange,
        limit: usize,
    ) -> Result<usize, MetaError>;

    /// Blocks writes to `range` on the donor.
    async fn enter_critical_section(
        &self,
        donor: &ShardId,
        ns: &Namespace,
        range: &ChunkRange,
    ) -> Result<(), MetaError>;

    /// Unblocks writes and stops change capture on the donor. Idempotent.
    async fn exit_critical_section(
        &self,
        donor: &ShardId,
        ns: &Namespace,
        range: &ChunkRange,
    ) -> Result<(), MetaError>;

    /// Drops cloned documents from the recipient after an abort.
    async fn discard_range(
        &self,
        recipient: &ShardId,
        ns: &Namespace,
        range: &ChunkRange,
    ) -> Result<(), MetaError>;

    /// Deletes migrated documents from the donor after commit. Returns the count removed.
    async fn delete_range(
        &self,
        donor: &ShardId,
        ns: &Namespace,
        range: &ChunkRange,
    ) -> Result<usize, MetaError>;
}

/// State of an in-flight migration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationState {
    /// Recipient is copying documents
    Cloning,
    /// Donor is forwarding queued writes
    CatchingUp,
    /// Recipient is within the lag bound
    SteadyState,
    /// Donor is in its critical section, commit in flight
    Committing,
    /// Ownership moved to the recipient
    Committed,
    /// Migration stopped, donor still owns the chunk
    Aborted,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// In-memory record of one chunk move.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationTicket {
    /// Ticket id
    pub id: Uuid,
    /// Chunk being moved
    pub chunk: ChunkId,
    /// Range of the chunk
    pub range: ChunkRange,
    /// Current owner
    pub donor: ShardId,
    /// Destination shard
    pub recipient: ShardId,
    /// Protocol state
    pub state: MigrationState,
    /// Collection version the commit is conditioned on
    pub expected: CollectionVersion,
    /// Clone checkpoint
    pub checkpoint: Option<DocumentKey>,
    /// Documents cloned so far
    pub docs_cloned: usize,
    /// Deadline of the donor's critical section, once entered
    pub critical_section_deadline: Option<Timestamp>,
}

/// Summary of a committed migration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Ticket id
    pub ticket_id: Uuid,
    /// Chunk that moved
    pub chunk: ChunkId,
    /// Previous owner
    pub from: ShardId,
    /// New owner
    pub to: ShardId,
    /// Documents cloned
    pub docs_cloned: usize,
    /// Collection version after the commit
    pub version: CollectionVersion,
}

/// Runs chunk migrations, at most one per chunk and per donor/recipient pair.
pub struct MigrationCoordinator {
    store: Arc<ConfigStore>,
    transport: Arc<dyn ShardTransport>,
    config: MigrationConfig,
    active: Mutex<HashMap<ChunkId, MigrationTicket>>,
}

impl MigrationCoordinator {
    /// Creates a coordinator.
    pub fn new(
        store: Arc<ConfigStore>,
        transport: Arc<dyn ShardTransport>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the migrations currently in flight.
    pub fn active_migrations(&self) -> Vec<MigrationTicket> {
        self.active
            .lock()
            .map(|a| a.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns true if `chunk` is being migrated.
    pub fn is_migrating(&self, chunk: &ChunkId) -> bool {
        self.active
            .lock()
            .map(|a| a.contains_key(chunk))
            .unwrap_or(false)
    }

    /// Moves the chunk containing `find` to shard `to`.
    ///
    /// Fails with `MigrationInProgress` if the chunk or the donor/recipient
    /// pair is already migrating, and with `MigrationAborted` if the
    /// protocol fails at any step before the commit.
    pub async fn move_chunk(
        &self,
        ns: &Namespace,
        find: &ShardKeyValue,
        to: &ShardId,
    ) -> Result<MigrationOutcome, MetaError> {
        self.move_chunk_until(ns, find, to, std::future::pending())
            .await
    }

    /// Like [`move_chunk`](Self::move_chunk), but gives up when `cancel` resolves.
    ///
    /// A cancelled migration is aborted and cleaned up like any other failure
    /// before the commit, and the error `cancel` produced is returned as is.
    pub async fn move_chunk_until<C>(
        &self,
        ns: &Namespace,
        find: &ShardKeyValue,
        to: &ShardId,
        cancel: C,
    ) -> Result<MigrationOutcome, MetaError>
    where
        C: Future<Output = MetaError>,
    {
        let (metadata, expected) = self.store.read_metadata(ns)?;
        let chunk = metadata.chunks.lookup(find)?.clone();
        let recipient = self.store.shard(to)?;
        if chunk.shard == *to {
            return Err(MetaError::InvalidRequest(format!(
                "chunk {} is already on {}",
                chunk.range, to
            )));
        }
        if let Some(zone) = metadata
            .zones_overlapping(&chunk.range)
            .find(|z| !recipient.serves(z))
        {
            return Err(MetaError::InvalidRequest(format!(
                "chunk {} is in zone {} which {} does not serve",
                chunk.range, zone, to
            )));
        }

        let mut ticket = MigrationTicket {
            id: Uuid::new_v4(),
            chunk: chunk.id(),
            range: chunk.range.clone(),
            donor: chunk.shard.clone(),
            recipient: to.clone(),
            state: MigrationState::Cloning,
            expected,
            checkpoint: None,
            docs_cloned: 0,
            critical_section_deadline: None,
        };
        self.register(&ticket)?;
        tracing::info!(
            ticket = %ticket.id,
            ns = %ns,
            range = %ticket.range,
            from = %ticket.donor,
            to = %ticket.recipient,
            "migration started"
        );

        let (result, cancelled) = tokio::select! {
            result = self.drive(&mut ticket) => (result, false),
            reason = cancel => (Err(reason), true),
        };
        let outcome = match result {
            Ok(version) => {
                self.finish_committed(&mut ticket).await;
                Ok(MigrationOutcome {
                    ticket_id: ticket.id,
                    chunk: ticket.chunk.clone(),
                    from: ticket.donor.clone(),
                    to: ticket.recipient.clone(),
                    docs_cloned: ticket.docs_cloned,
                    version,
                })
            }
            Err(e) if cancelled => {
                self.abort(&mut ticket, &e.to_string()).await;
                Err(e)
            }
            Err(e) => {
                let (reason, current) = match &e {
                    MetaError::MigrationAborted {
                        reason, current, ..
                    } => (reason.clone(), *current),
                    other => (other.to_string(), other.conflicting_version()),
                };
                self.abort(&mut ticket, &reason).await;
                Err(MetaError::MigrationAborted {
                    chunk: ticket.chunk.clone(),
                    reason,
                    current,
                })
            }
        };
        self.unregister(&ticket.chunk);
        outcome
    }

    async fn drive(&self, ticket: &mut MigrationTicket) -> Result<CollectionVersion, MetaError> {
        let ns = ticket.chunk.ns.clone();
        let range = ticket.range.clone();
        let (donor, recipient) = (ticket.donor.clone(), ticket.recipient.clone());

        self.transport.ping(&donor).await?;
        self.transport.ping(&recipient).await?;
        self.transport
            .start_clone(&donor, &recipient, &ns, &range)
            .await?;

        loop {
            let batch = self
                .transport
                .clone_batch(
                    &donor,
                    &recipient,
                    &ns,
                    &range,
                    ticket.checkpoint.as_ref(),
                    self.config.clone_batch_size,
                )
                .await?;
            ticket.docs_cloned += batch.copied;
            if batch.cursor.is_some() {
                ticket.checkpoint = batch.cursor;
            }
            self.publish(ticket);
            if batch.done {
                break;
            }
        }
        self.transition(ticket, MigrationState::CatchingUp);

        let mut rounds = 0;
        loop {
            let remaining = self
                .transport
                .transfer_changes(
                    &donor,
                    &recipient,
                    &ns,
                    &range,
                    self.config.transfer_batch_size,
                )
                .await?;
            if remaining <= self.config.max_catch_up_lag {
                break;
            }
            rounds += 1;
            if rounds >= self.config.max_catch_up_rounds {
                return Err(MetaError::MigrationAborted {
                    chunk: ticket.chunk.clone(),
                    reason: format!("catch-up did not converge, {} changes queued", remaining),
                    current: None,
                });
            }
        }
        self.transition(ticket, MigrationState::SteadyState);

        self.transport
            .enter_critical_section(&donor, &ns, &range)
            .await?;
        let timeout = self.config.critical_section_timeout();
        let deadline = Timestamp::now().plus(timeout);
        ticket.critical_section_deadline = Some(deadline);
        self.transition(ticket, MigrationState::Committing);

        let expected = ticket.expected;
        let min = range.min.clone();
        let commit = async move {
            loop {
                let remaining = self
                    .transport
                    .transfer_changes(
                        &donor,
                        &recipient,
                        &ns,
                        &range,
                        self.config.transfer_batch_size,
                    )
                    .await?;
                if remaining == 0 {
                    break;
                }
            }
            self.store
                .commit(
                    &ns,
                    expected,
                    CollectionMutation::CommitMigration {
                        min,
                        donor: donor.clone(),
                        recipient: recipient.clone(),
                        critical_section_deadline: deadline,
                    },
                )
                .await
        };
        match tokio::time::timeout(timeout, commit).await {
            Ok(result) => result,
            Err(_) => Err(MetaError::MigrationAborted {
                chunk: ticket.chunk.clone(),
                reason: format!(
                    "critical section exceeded {}ms",
                    timeout.as_millis()
                ),
                current: None,
            }),
        }
    }

    async fn finish_committed(&self, ticket: &mut MigrationTicket) {
        self.transition(ticket, MigrationState::Committed);
        let ns = &ticket.chunk.ns;
        if let Err(e) = self
            .transport
            .exit_critical_section(&ticket.donor, ns, &ticket.range)
            .await
        {
            tracing::warn!(ticket = %ticket.id, error = %e, "failed to exit critical section after commit");
        }
        match self
            .transport
            .delete_range(&ticket.donor, ns, &ticket.range)
            .await
        {
            Ok(deleted) => tracing::debug!(ticket = %ticket.id, deleted, "donor range cleaned up"),
            Err(e) => tracing::warn!(ticket = %ticket.id, error = %e, "donor range cleanup failed"),
        }
        tracing::info!(
            ticket = %ticket.id,
            ns = %ns,
            range = %ticket.range,
            from = %ticket.donor,
            to = %ticket.recipient,
            docs = ticket.docs_cloned,
            "migration committed"
        );
    }

    async fn abort(&self, ticket: &mut MigrationTicket, reason: &str) {
        let previous = ticket.state;
        self.transition(ticket, MigrationState::Aborted);
        let ns = &ticket.chunk.ns;
        if let Err(e) = self
            .transport
            .exit_critical_section(&ticket.donor, ns, &ticket.range)
            .await
        {
            tracing::debug!(ticket = %ticket.id, error = %e, "donor cleanup after abort failed");
        }
        if let Err(e) = self
            .transport
            .discard_range(&ticket.recipient, ns, &ticket.range)
            .await
        {
            tracing::debug!(ticket = %ticket.id, error = %e, "recipient cleanup after abort failed");
        }
        tracing::warn!(
            ticket = %ticket.id,
            ns = %ns,
            range = %ticket.range,
            from = %ticket.donor,
            to = %ticket.recipient,
            state = %previous,
            reason,
            "migration aborted"
        );
    }

    fn register(&self, ticket: &MigrationTicket) -> Result<(), MetaError> {
        let mut active = self
            .active
            .lock()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        let busy = active.contains_key(&ticket.chunk)
            || active
                .values()
                .any(|t| t.donor == ticket.donor && t.recipient == ticket.recipient);
        if busy {
            return Err(MetaError::MigrationInProgress {
                chunk: ticket.chunk.clone(),
            });
        }
        active.insert(ticket.chunk.clone(), ticket.clone());
        Ok(())
    }

    fn unregister(&self, chunk: &ChunkId) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(chunk);
        }
    }

    fn transition(&self, ticket: &mut MigrationTicket, state: MigrationState) {
        tracing::debug!(ticket = %ticket.id, from = %ticket.state, to = %state, "migration state");
        ticket.state = state;
        self.publish(ticket);
    }

    fn publish(&self, ticket: &MigrationTicket) {
        if let Ok(mut active) = self.active.lock() {
            if let Some(slot) = active.get_mut(&ticket.chunk) {
                *slot = ticket.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::{ShardRecord, ZoneRange};
    use crate::memory_shard::MemoryShardCluster;
    use std::time::Duration;

    fn ns() -> Namespace {
        Namespace::new("testDB", "foo")
    }

    fn shard(i: usize) -> ShardId {
        ShardId::new(format!("shard{:04}", i))
    }

    struct Fixture {
        store: Arc<ConfigStore>,
        shards: Arc<MemoryShardCluster>,
        coordinator: Arc<MigrationCoordinator>,
    }

    async fn fixture(config: MigrationConfig) -> Fixture {
        let store = Arc::new(ConfigStore::in_memory(3));
        let shards = Arc::new(MemoryShardCluster::new());
        for i in 0..2 {
            store
                .add_shard(ShardRecord::new(shard(i), format!("h{}", i)))
                .await
                .unwrap();
            shards.add_shard(shard(i));
        }
        store.enable_database("testDB").await.unwrap();
        store
            .create_collection(&ns(), ShardKeyPattern::new("a"))
            .await
            .unwrap();
        for k in 0..20 {
            shards
                .insert(&shard(0), &ns(), DocumentKey::new(k, k as u64), serde_json::json!({ "a": k }))
                .unwrap();
        }
        let coordinator = Arc::new(MigrationCoordinator::new(
            store.clone(),
            shards.clone(),
            config,
        ));
        Fixture {
            store,
            shards,
            coordinator,
        }
    }

    fn small_batches() -> MigrationConfig {
        MigrationConfig {
            clone_batch_size: 3,
            ..MigrationConfig::default()
        }
    }

    #[tokio::test]
    async fn test_move_chunk_commits() {
        let f = fixture(small_batches()).await;
        let outcome = f
            .coordinator
            .move_chunk(&ns(), &ShardKeyValue::Int(5), &shard(1))
            .await
            .unwrap();
        assert_eq!(outcome.from, shard(0));
        assert_eq!(outcome.to, shard(1));
        assert_eq!(outcome.docs_cloned, 20);
        assert_eq!(outcome.version.version, ChunkVersion::new(2, 0));

        let (meta, _) = f.store.read_metadata(&ns()).unwrap();
        assert_eq!(meta.chunks.lookup(&ShardKeyValue::Int(5)).unwrap().shard, shard(1));
        assert_eq!(f.shards.count(&shard(1), &ns()), 20);
        assert_eq!(f.shards.count(&shard(0), &ns()), 0);
        assert!(f.coordinator.active_migrations().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_recipient_aborts_at_start() {
        let f = fixture(small_batches()).await;
        f.shards.set_reachable(&shard(1), false);
        let err = f
            .coordinator
            .move_chunk(&ns(), &ShardKeyValue::Int(5), &shard(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::MigrationAborted { .. }));
        let (meta, version) = f.store.read_metadata(&ns()).unwrap();
        assert_eq!(version.version, ChunkVersion::INITIAL);
        assert_eq!(meta.chunks.iter().next().unwrap().shard, shard(0));
        assert!(f.coordinator.active_migrations().is_empty());
    }

    #[tokio::test]
    async fn test_partition_during_clone_leaves_donor_owner() {
        let f = fixture(small_batches()).await;
        f.shards.partition_after_clone_batches(&shard(1), 2);
        let err = f
            .coordinator
            .move_chunk(&ns(), &ShardKeyValue::Int(5), &shard(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::MigrationAborted { .. }));

        let (meta, _) = f.store.read_metadata(&ns()).unwrap();
        assert_eq!(meta.chunks.iter().next().unwrap().shard, shard(0));
        assert_eq!(f.shards.count(&shard(0), &ns()), 20);
        f.shards.set_reachable(&shard(1), true);
        assert_eq!(f.shards.count(&shard(1), &ns()), 0);
        assert!(f.shards.insert(&shard(0), &ns(), DocumentKey::new(99, 99), serde_json::json!({})).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_section_timeout_aborts() {
        let f = fixture(MigrationConfig {
            critical_section_timeout_ms: 100,
            ..small_batches()
        })
        .await;
        f.shards.set_transfer_delay(Duration::from_secs(1));
        let err = f
            .coordinator
            .move_chunk(&ns(), &ShardKeyValue::Int(5), &shard(1))
            .await
            .unwrap_err();
        match err {
            MetaError::MigrationAborted { reason, .. } => assert!(reason.contains("critical section")),
            other => panic!("unexpected error {:?}", other),
        }
        let (meta, version) = f.store.read_metadata(&ns()).unwrap();
        assert_eq!(version.version, ChunkVersion::INITIAL);
        assert_eq!(meta.chunks.iter().next().unwrap().shard, shard(0));
        assert!(f.coordinator.active_migrations().is_empty());
        // writes flow again once the critical section is released
        assert!(f.shards.insert(&shard(0), &ns(), DocumentKey::new(7, 700), serde_json::json!({})).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_split_aborts_migration_commit() {
        let f = fixture(small_batches()).await;
        f.shards.set_transfer_delay(Duration::from_millis(10));
        let coordinator = f.coordinator.clone();
        let migration = tokio::spawn(async move {
            coordinator
                .move_chunk(&ns(), &ShardKeyValue::Int(5), &shard(1))
                .await
        });

        // lands while the migration is catching up
        tokio::time::sleep(Duration::from_millis(1)).await;
        let (meta, version) = f.store.read_metadata(&ns()).unwrap();
        let chunk = meta.chunks.iter().next().unwrap().clone();
        let children = crate::split::SplitPlanner::plan_split(
            &chunk,
            &[ShardKeyValue::Int(1000)],
            version.version,
        )
        .unwrap();
        f.store
            .commit(&ns(), version, CollectionMutation::ReplaceChunks(children))
            .await
            .unwrap();

        let err = migration.await.unwrap().unwrap_err();
        assert!(matches!(err, MetaError::MigrationAborted { .. }));
        assert_eq!(
            err.conflicting_version().map(|v| v.version),
            Some(ChunkVersion::new(1, 2))
        );
        let (meta, version) = f.store.read_metadata(&ns()).unwrap();
        assert_eq!(version.version, ChunkVersion::new(1, 2));
        assert!(meta.chunks.iter().all(|c| c.shard == shard(0)));
        assert_eq!(f.shards.count(&shard(1), &ns()), 0);
    }

    #[tokio::test]
    async fn test_chunk_already_migrating_is_rejected() {
        let f = fixture(small_batches()).await;
        let (meta, version) = f.store.read_metadata(&ns()).unwrap();
        let chunk = meta.chunks.iter().next().unwrap();
        f.coordinator
            .register(&MigrationTicket {
                id: Uuid::new_v4(),
                chunk: chunk.id(),
                range: chunk.range.clone(),
                donor: shard(0),
                recipient: shard(1),
                state: MigrationState::Cloning,
                expected: version,
                checkpoint: None,
                docs_cloned: 0,
                critical_section_deadline: None,
            })
            .unwrap();
        assert!(f.coordinator.is_migrating(&chunk.id()));
        let err = f
            .coordinator
            .move_chunk(&ns(), &ShardKeyValue::Int(5), &shard(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::MigrationInProgress { .. }));
    }

    #[tokio::test]
    async fn test_move_to_shard_outside_zone_rejected() {
        let f = fixture(small_batches()).await;
        f.store
            .update_shard_zone(&shard(0), "EU", true)
            .await
            .unwrap();
        f.store
            .set_zone_ranges(
                &ns(),
                vec![ZoneRange {
                    range: ChunkRange::full(),
                    zone: "EU".to_string(),
                }],
            )
            .await
            .unwrap();
        let err = f
            .coordinator
            .move_chunk(&ns(), &ShardKeyValue::Int(5), &shard(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_move_to_owner_rejected() {
        let f = fixture(small_batches()).await;
        assert!(matches!(
            f.coordinator
                .move_chunk(&ns(), &ShardKeyValue::Int(5), &shard(0))
                .await,
            Err(MetaError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_writes_during_clone_reach_recipient() {
        let f = fixture(small_batches()).await;
        let shards = f.shards.clone();
        f.shards.on_first_clone_batch(Box::new(move || {
            shards
                .insert(&shard(0), &ns(), DocumentKey::new(500, 500), serde_json::json!({ "a": 500 }))
                .unwrap();
            shards
                .delete(&shard(0), &ns(), &DocumentKey::new(0, 0))
                .unwrap();
        }));
        f.coordinator
            .move_chunk(&ns(), &ShardKeyValue::Int(5), &shard(1))
            .await
            .unwrap();
        assert_eq!(f.shards.count(&shard(1), &ns()), 20);
        assert!(f.shards.contains(&shard(1), &ns(), &DocumentKey::new(500, 500)));
        assert!(!f.shards.contains(&shard(1), &ns(), &DocumentKey::new(0, 0)));
    }
}
