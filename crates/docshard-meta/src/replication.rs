//! Majority-acknowledged replication of config store writes.
//!
//! The config store never applies a write locally until the replica set has
//! acknowledged it with a majority. Election and log shipping internals live
//! behind the [`Replicator`] trait; [`LocalReplicaSet`] is an in-process
//! replica set used by tests and the management CLI.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::MetaError;

/// A single config write shipped to the replica set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPayload {
    /// Config record key
    pub key: String,
    /// Encoded record, or None for a delete
    pub value: Option<Vec<u8>>,
}

/// Acknowledgment returned once a majority has the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicaAck {
    /// Position of the write in the replicated log
    pub op_index: u64,
    /// Members that acknowledged
    pub acked: usize,
    /// Replica set size
    pub members: usize,
}

/// Durable write path of the config replica set.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Ship `payload` and wait for majority acknowledgment.
    ///
    /// Returns `MajorityUnavailable` when the acknowledgment does not arrive
    /// within the replica set's timeout.
    async fn commit_with_majority(&self, payload: ReplicationPayload)
        -> Result<ReplicaAck, MetaError>;
}

#[derive(Debug, Default)]
struct Member {
    reachable: bool,
    log: Vec<ReplicationPayload>,
}

/// In-process replica set with per-member reachability.
pub struct LocalReplicaSet {
    members: RwLock<Vec<Member>>,
    op_index: RwLock<u64>,
    ack_timeout: Duration,
}

impl LocalReplicaSet {
    /// Creates a replica set of `size` reachable members.
    pub fn new(size: usize, ack_timeout: Duration) -> Self {
        let members = (0..size.max(1))
            .map(|_| Member {
                reachable: true,
                log: Vec::new(),
            })
            .collect();
        Self {
            members: RwLock::new(members),
            op_index: RwLock::new(0),
            ack_timeout,
        }
    }

    /// Number of members required to acknowledge a write.
    pub fn majority(&self) -> usize {
        self.size() / 2 + 1
    }

    /// Replica set size.
    pub fn size(&self) -> usize {
        self.members.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Marks a member reachable or partitioned.
    pub fn set_reachable(&self, member: usize, reachable: bool) -> Result<(), MetaError> {
        let mut members = self
            .members
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        let m = members
            .get_mut(member)
            .ok_or_else(|| MetaError::InvalidRequest(format!("no replica member {}", member)))?;
        m.reachable = reachable;
        Ok(())
    }

    /// Number of writes a member has applied.
    pub fn applied_len(&self, member: usize) -> usize {
        self.members
            .read()
            .ok()
            .and_then(|m| m.get(member).map(|m| m.log.len()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl Replicator for LocalReplicaSet {
    async fn commit_with_majority(
        &self,
        payload: ReplicationPayload,
    ) -> Result<ReplicaAck, MetaError> {
        let (acked, members) = {
            let mut members = self
                .members
                .write()
                .map_err(|e| MetaError::KvError(e.to_string()))?;
            let total = members.len();
            let acked = members.iter().filter(|m| m.reachable).count();
            if acked >= total / 2 + 1 {
                for m in members.iter_mut().filter(|m| m.reachable) {
                    m.log.push(payload.clone());
                }
            }
            (acked, total)
        };

        let required = members / 2 + 1;
        if acked < required {
            // No majority: the write would stall until the timeout fires.
            tokio::time::sleep(self.ack_timeout).await;
            tracing::warn!(
                key = %payload.key,
                acked,
                required,
                "config write timed out waiting for majority"
            );
            return Err(MetaError::MajorityUnavailable { acked, required });
        }

        let op_index = {
            let mut idx = self
                .op_index
                .write()
                .map_err(|e| MetaError::KvError(e.to_string()))?;
            *idx += 1;
            *idx
        };
        tracing::debug!(key = %payload.key, op_index, acked, "config write majority-committed");
        Ok(ReplicaAck {
            op_index,
            acked,
            members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(key: &str) -> ReplicationPayload {
        ReplicationPayload {
            key: key.to_string(),
            value: Some(vec![1, 2, 3]),
        }
    }

    #[tokio::test]
    async fn test_majority_ack() {
        let rs = LocalReplicaSet::new(3, Duration::from_millis(10));
        let ack = rs.commit_with_majority(payload("a")).await.unwrap();
        assert_eq!(ack.acked, 3);
        assert_eq!(ack.op_index, 1);
        assert_eq!(rs.applied_len(2), 1);
    }

    #[tokio::test]
    async fn test_minority_partition_still_commits() {
        let rs = LocalReplicaSet::new(3, Duration::from_millis(10));
        rs.set_reachable(2, false).unwrap();
        let ack = rs.commit_with_majority(payload("a")).await.unwrap();
        assert_eq!(ack.acked, 2);
        assert_eq!(rs.applied_len(2), 0);
        assert_eq!(rs.applied_len(0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_majority_times_out() {
        let rs = LocalReplicaSet::new(3, Duration::from_secs(5));
        rs.set_reachable(0, false).unwrap();
        rs.set_reachable(1, false).unwrap();
        let err = rs.commit_with_majority(payload("a")).await.unwrap_err();
        assert!(matches!(
            err,
            MetaError::MajorityUnavailable {
                acked: 1,
                required: 2
            }
        ));
        assert_eq!(rs.applied_len(2), 0);
    }

    #[test]
    fn test_majority_sizes() {
        assert_eq!(LocalReplicaSet::new(1, Duration::ZERO).majority(), 1);
        assert_eq!(LocalReplicaSet::new(3, Duration::ZERO).majority(), 2);
        assert_eq!(LocalReplicaSet::new(4, Duration::ZERO).majority(), 3);
        assert_eq!(LocalReplicaSet::new(5, Duration::ZERO).majority(), 3);
    }

    #[test]
    fn test_set_reachable_unknown_member() {
        let rs = LocalReplicaSet::new(3, Duration::ZERO);
        assert!(rs.set_reachable(7, false).is_err());
    }
}
