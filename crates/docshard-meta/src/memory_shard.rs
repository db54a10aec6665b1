//! In-process shard nodes implementing [`ShardTransport`].
//!
//! Each node keeps its documents per collection, ordered by [`DocumentKey`].
//! A clone session on the donor records every write that lands in the
//! migrating range so catch-up can replay it on the recipient. Critical
//! sections reject writes to the range with `WriteBlocked`.
//!
//! Fault injection covers the cases migrations must survive: unreachable
//! nodes, a node that drops off the network partway through cloning, and slow
//! change transfer.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::migration::{CloneBatch, DocumentKey, ShardTransport};
use crate::types::*;

/// Hook run once, just before the first clone batch is copied.
pub type CloneHook = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone)]
enum Change {
    Upsert(DocumentKey, serde_json::Value),
    Delete(DocumentKey),
}

struct CloneSession {
    ns: Namespace,
    range: ChunkRange,
    recipient: ShardId,
    queue: VecDeque<Change>,
}

#[derive(Default)]
struct ShardNode {
    reachable: bool,
    collections: HashMap<Namespace, BTreeMap<DocumentKey, serde_json::Value>>,
    sessions: Vec<CloneSession>,
    blocked: Vec<(Namespace, ChunkRange)>,
    partition_after_batches: Option<usize>,
}

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<ShardId, ShardNode>,
    transfer_delay: Duration,
    on_first_clone_batch: Option<CloneHook>,
}

/// A set of in-memory shards.
#[derive(Default)]
pub struct MemoryShardCluster {
    state: Mutex<ClusterState>,
}

impl MemoryShardCluster {
    /// Creates an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reachable, empty shard.
    pub fn add_shard(&self, id: ShardId) {
        if let Ok(mut state) = self.state.lock() {
            state.nodes.entry(id).or_insert_with(|| ShardNode {
                reachable: true,
                ..ShardNode::default()
            });
        }
    }

    /// Marks a shard reachable or unreachable.
    pub fn set_reachable(&self, id: &ShardId, reachable: bool) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(node) = state.nodes.get_mut(id) {
                node.reachable = reachable;
                node.partition_after_batches = None;
            }
        }
    }

    /// Makes the shard unreachable once it has received `batches` clone batches.
    pub fn partition_after_clone_batches(&self, id: &ShardId, batches: usize) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(node) = state.nodes.get_mut(id) {
                node.partition_after_batches = Some(batches);
            }
        }
    }

    /// Delay applied to every change transfer.
    pub fn set_transfer_delay(&self, delay: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.transfer_delay = delay;
        }
    }

    /// Registers a hook run once before the first clone batch.
    pub fn on_first_clone_batch(&self, hook: CloneHook) {
        if let Ok(mut state) = self.state.lock() {
            state.on_first_clone_batch = Some(hook);
        }
    }

    /// Writes a document to a shard.
    ///
    /// Fails with `WriteBlocked` inside a critical section covering the key.
    pub fn insert(
        &self,
        shard: &ShardId,
        ns: &Namespace,
        key: DocumentKey,
        doc: serde_json::Value,
    ) -> Result<(), MetaError> {
        self.write(shard, ns, Change::Upsert(key, doc))
    }

    /// Deletes a document from a shard.
    pub fn delete(&self, shard: &ShardId, ns: &Namespace, key: &DocumentKey) -> Result<(), MetaError> {
        self.write(shard, ns, Change::Delete(key.clone()))
    }

    /// Number of documents of `ns` on a shard.
    pub fn count(&self, shard: &ShardId, ns: &Namespace) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|s| {
                s.nodes
                    .get(shard)
                    .and_then(|n| n.collections.get(ns).map(|c| c.len()))
            })
            .unwrap_or(0)
    }

    /// Returns true if the shard holds the document.
    pub fn contains(&self, shard: &ShardId, ns: &Namespace, key: &DocumentKey) -> bool {
        self.state
            .lock()
            .ok()
            .and_then(|s| {
                s.nodes
                    .get(shard)
                    .and_then(|n| n.collections.get(ns).map(|c| c.contains_key(key)))
            })
            .unwrap_or(false)
    }

    fn write(&self, shard: &ShardId, ns: &Namespace, change: Change) -> Result<(), MetaError> {
        let mut state = self.lock()?;
        let node = reachable_node(&mut state, shard)?;
        let key = match &change {
            Change::Upsert(k, _) | Change::Delete(k) => k.clone(),
        };
        if let Some((_, range)) = node
            .blocked
            .iter()
            .find(|(n, r)| n == ns && r.contains(&key.key))
        {
            return Err(MetaError::WriteBlocked {
                ns: ns.clone(),
                range: range.clone(),
            });
        }
        for session in node
            .sessions
            .iter_mut()
            .filter(|s| s.ns == *ns && s.range.contains(&key.key))
        {
            session.queue.push_back(change.clone());
        }
        apply(node.collections.entry(ns.clone()).or_default(), change);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ClusterState>, MetaError> {
        self.state
            .lock()
            .map_err(|e| MetaError::KvError(e.to_string()))
    }
}

fn apply(docs: &mut BTreeMap<DocumentKey, serde_json::Value>, change: Change) {
    match change {
        Change::Upsert(key, doc) => {
            docs.insert(key, doc);
        }
        Change::Delete(key) => {
            docs.remove(&key);
        }
    }
}

fn node_mut<'a>(state: &'a mut ClusterState, shard: &ShardId) -> Result<&'a mut ShardNode, MetaError> {
    state
        .nodes
        .get_mut(shard)
        .ok_or_else(|| MetaError::ShardNotFound(shard.clone()))
}

fn reachable_node<'a>(
    state: &'a mut ClusterState,
    shard: &ShardId,
) -> Result<&'a mut ShardNode, MetaError> {
    let node = node_mut(state, shard)?;
    if !node.reachable {
        return Err(MetaError::Unreachable {
            target: shard.to_string(),
        });
    }
    Ok(node)
}

fn in_range(range: &ChunkRange, key: &DocumentKey) -> bool {
    range.contains(&key.key)
}

#[async_trait]
impl ShardTransport for MemoryShardCluster {
    async fn ping(&self, shard: &ShardId) -> Result<(), MetaError> {
        let mut state = self.lock()?;
        reachable_node(&mut state, shard).map(|_| ())
    }

    async fn start_clone(
        &self,
        donor: &ShardId,
        recipient: &ShardId,
        ns: &Namespace,
        range: &ChunkRange,
    ) -> Result<(), MetaError> {
        let mut state = self.lock()?;
        let node = reachable_node(&mut state, donor)?;
        node.sessions
            .retain(|s| !(s.ns == *ns && s.range == *range));
        node.sessions.push(CloneSession {
            ns: ns.clone(),
            range: range.clone(),
            recipient: recipient.clone(),
            queue: VecDeque::new(),
        });
        Ok(())
    }

    async fn clone_batch(
        &self,
        donor: &ShardId,
        recipient: &ShardId,
        ns: &Namespace,
        range: &ChunkRange,
        resume_after: Option<&DocumentKey>,
        limit: usize,
    ) -> Result<CloneBatch, MetaError> {
        let hook = self.lock()?.on_first_clone_batch.take();
        if let Some(hook) = hook {
            hook();
        }

        let mut state = self.lock()?;
        let batch: Vec<(DocumentKey, serde_json::Value)> = {
            let node = reachable_node(&mut state, donor)?;
            let docs = node.collections.get(ns);
            docs.map(|docs| {
                docs.iter()
                    .filter(|(k, _)| in_range(range, k))
                    .filter(|(k, _)| resume_after.map_or(true, |after| *k > after))
                    .take(limit.saturating_add(1))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
        };

        let target = reachable_node(&mut state, recipient)?;
        let pending = target.partition_after_batches;
        match pending {
            Some(0) => {
                target.reachable = false;
                target.partition_after_batches = None;
                return Err(MetaError::Unreachable {
                    target: recipient.to_string(),
                });
            }
            Some(n) => target.partition_after_batches = Some(n - 1),
            None => {}
        }

        let done = batch.len() <= limit;
        let docs = target.collections.entry(ns.clone()).or_default();
        let mut cursor = None;
        let mut copied = 0;
        for (key, doc) in batch.into_iter().take(limit) {
            cursor = Some(key.clone());
            docs.insert(key, doc);
            copied += 1;
        }
        Ok(CloneBatch {
            copied,
            cursor,
            done,
        })
    }

    async fn transfer_changes(
        &self,
        donor: &ShardId,
        recipient: &ShardId,
        ns: &Namespace,
        range: &ChunkRange,
        limit: usize,
    ) -> Result<usize, MetaError> {
        let delay = self.lock()?.transfer_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock()?;
        let (changes, remaining) = {
            let node = reachable_node(&mut state, donor)?;
            let session = node
                .sessions
                .iter_mut()
                .find(|s| s.ns == *ns && s.range == *range && s.recipient == *recipient)
                .ok_or_else(|| {
                    MetaError::InvalidRequest(format!("no clone session for {} {}", ns, range))
                })?;
            let n = limit.min(session.queue.len());
            let changes: Vec<Change> = session.queue.drain(..n).collect();
            (changes, session.queue.len())
        };

        let target = reachable_node(&mut state, recipient)?;
        let docs = target.collections.entry(ns.clone()).or_default();
        for change in changes {
            apply(docs, change);
        }
        Ok(remaining)
    }

    async fn enter_critical_section(
        &self,
        donor: &ShardId,
        ns: &Namespace,
        range: &ChunkRange,
    ) -> Result<(), MetaError> {
        let mut state = self.lock()?;
        let node = reachable_node(&mut state, donor)?;
        node.blocked.push((ns.clone(), range.clone()));
        Ok(())
    }

    async fn exit_critical_section(
        &self,
        donor: &ShardId,
        ns: &Namespace,
        range: &ChunkRange,
    ) -> Result<(), MetaError> {
        let mut state = self.lock()?;
        let node = node_mut(&mut state, donor)?;
        node.blocked.retain(|(n, r)| !(n == ns && r == range));
        node.sessions.retain(|s| !(s.ns == *ns && s.range == *range));
        Ok(())
    }

    /// Orphaned ranges are dropped even while the recipient is unreachable;
    /// a real recipient cleans them up once it learns of the abort.
    async fn discard_range(
        &self,
        recipient: &ShardId,
        ns: &Namespace,
        range: &ChunkRange,
    ) -> Result<(), MetaError> {
        let mut state = self.lock()?;
        let node = node_mut(&mut state, recipient)?;
        if let Some(docs) = node.collections.get_mut(ns) {
            docs.retain(|k, _| !in_range(range, k));
        }
        Ok(())
    }

    async fn delete_range(
        &self,
        donor: &ShardId,
        ns: &Namespace,
        range: &ChunkRange,
    ) -> Result<usize, MetaError> {
        let mut state = self.lock()?;
        let node = reachable_node(&mut state, donor)?;
        let Some(docs) = node.collections.get_mut(ns) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|k, _| !in_range(range, k));
        Ok(before - docs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::new("testDB", "foo")
    }

    fn cluster() -> (MemoryShardCluster, ShardId, ShardId) {
        let c = MemoryShardCluster::new();
        let (a, b) = (ShardId::new("a"), ShardId::new("b"));
        c.add_shard(a.clone());
        c.add_shard(b.clone());
        (c, a, b)
    }

    #[tokio::test]
    async fn test_clone_batches_resume() {
        let (c, a, b) = cluster();
        for k in 0..5 {
            c.insert(&a, &ns(), DocumentKey::new(k, k as u64), json!({ "a": k })).unwrap();
        }
        let range = ChunkRange::full();
        c.start_clone(&a, &b, &ns(), &range).await.unwrap();
        let first = c.clone_batch(&a, &b, &ns(), &range, None, 2).await.unwrap();
        assert_eq!(first.copied, 2);
        assert!(!first.done);
        let second = c
            .clone_batch(&a, &b, &ns(), &range, first.cursor.as_ref(), 10)
            .await
            .unwrap();
        assert_eq!(second.copied, 3);
        assert!(second.done);
        assert_eq!(c.count(&b, &ns()), 5);
    }

    #[tokio::test]
    async fn test_clone_only_copies_range() {
        let (c, a, b) = cluster();
        for k in 0..10 {
            c.insert(&a, &ns(), DocumentKey::new(k, k as u64), json!({})).unwrap();
        }
        let range = ChunkRange::new(ShardKeyValue::Int(3), ShardKeyValue::Int(6));
        c.start_clone(&a, &b, &ns(), &range).await.unwrap();
        let batch = c.clone_batch(&a, &b, &ns(), &range, None, 100).await.unwrap();
        assert_eq!(batch.copied, 3);
        assert_eq!(c.delete_range(&a, &ns(), &range).await.unwrap(), 3);
        assert_eq!(c.count(&a, &ns()), 7);
    }

    #[tokio::test]
    async fn test_changes_captured_and_transferred() {
        let (c, a, b) = cluster();
        let range = ChunkRange::new(ShardKeyValue::Int(0), ShardKeyValue::Int(100));
        c.start_clone(&a, &b, &ns(), &range).await.unwrap();
        c.insert(&a, &ns(), DocumentKey::new(5, 1), json!({})).unwrap();
        c.insert(&a, &ns(), DocumentKey::new(500, 2), json!({})).unwrap();
        c.delete(&a, &ns(), &DocumentKey::new(5, 1)).unwrap();

        let remaining = c.transfer_changes(&a, &b, &ns(), &range, 1).await.unwrap();
        assert_eq!(remaining, 1);
        assert!(c.contains(&b, &ns(), &DocumentKey::new(5, 1)));
        let remaining = c.transfer_changes(&a, &b, &ns(), &range, 10).await.unwrap();
        assert_eq!(remaining, 0);
        assert!(!c.contains(&b, &ns(), &DocumentKey::new(5, 1)));
        assert!(!c.contains(&b, &ns(), &DocumentKey::new(500, 2)));
    }

    #[tokio::test]
    async fn test_critical_section_blocks_writes_in_range() {
        let (c, a, _) = cluster();
        let range = ChunkRange::new(ShardKeyValue::Int(0), ShardKeyValue::Int(100));
        c.enter_critical_section(&a, &ns(), &range).await.unwrap();
        let err = c
            .insert(&a, &ns(), DocumentKey::new(10, 1), json!({}))
            .unwrap_err();
        assert!(matches!(err, MetaError::WriteBlocked { .. }));
        c.insert(&a, &ns(), DocumentKey::new(100, 2), json!({})).unwrap();

        c.exit_critical_section(&a, &ns(), &range).await.unwrap();
        c.insert(&a, &ns(), DocumentKey::new(10, 1), json!({})).unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_shard() {
        let (c, a, _) = cluster();
        c.set_reachable(&a, false);
        assert!(matches!(c.ping(&a).await, Err(MetaError::Unreachable { .. })));
        assert!(c.insert(&a, &ns(), DocumentKey::new(1, 1), json!({})).is_err());
        assert!(matches!(
            c.ping(&ShardId::new("zzz")).await,
            Err(MetaError::ShardNotFound(_))
        ));
    }
}
