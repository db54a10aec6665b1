//! Cluster-wide balancer lease.
//!
//! At most one balancer instance may run a round at a time. The lease is a
//! record in the config store holding the current holder and an expiry; it is
//! taken and renewed with compare-and-swap writes. A holder that stops
//! renewing is presumed dead once the expiry passes, and any other instance
//! may then take the lease over. Instances without a valid lease stay inert.

use std::sync::Arc;
use std::time::Duration;

use crate::config_store::{ConfigStore, LeaseRecord, BALANCER_LOCK_KEY};
use crate::types::*;

/// One instance's handle on the balancer lease.
pub struct BalancerLease {
    store: Arc<ConfigStore>,
    instance: String,
    ttl: Duration,
}

impl BalancerLease {
    /// Creates a handle for `instance` with the given lease lifetime.
    pub fn new(store: Arc<ConfigStore>, instance: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            instance: instance.into(),
            ttl,
        }
    }

    /// Name of this instance.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Acquires the lease, or extends it if this instance already holds it.
    pub async fn try_acquire(&self) -> Result<LeaseRecord, MetaError> {
        self.try_acquire_at(Timestamp::now()).await
    }

    /// Acquires the lease as of `now`.
    ///
    /// Fails with `LeaseHeld` while another instance holds an unexpired lease.
    pub async fn try_acquire_at(&self, now: Timestamp) -> Result<LeaseRecord, MetaError> {
        let current = self.store.get_record::<LeaseRecord>(BALANCER_LOCK_KEY)?;
        let (rev, next) = match current {
            None => (
                0,
                LeaseRecord {
                    holder: self.instance.clone(),
                    expires_at: now.plus(self.ttl),
                    generation: 1,
                },
            ),
            Some((rev, record)) if record.holder == self.instance => (
                rev,
                LeaseRecord {
                    expires_at: now.plus(self.ttl),
                    ..record
                },
            ),
            Some((rev, record)) if record.expires_at <= now => {
                tracing::info!(
                    instance = %self.instance,
                    previous = %record.holder,
                    generation = record.generation + 1,
                    "taking over expired balancer lease"
                );
                (
                    rev,
                    LeaseRecord {
                        holder: self.instance.clone(),
                        expires_at: now.plus(self.ttl),
                        generation: record.generation + 1,
                    },
                )
            }
            Some((_, record)) => return Err(held(record)),
        };

        match self
            .store
            .compare_and_put(BALANCER_LOCK_KEY, rev, Some(&next))
            .await
        {
            Ok(_) => {
                if rev == 0 {
                    tracing::info!(instance = %self.instance, "balancer lease acquired");
                }
                Ok(next)
            }
            Err(MetaError::VersionConflict { .. }) => Err(self.current_holder_error()?),
            Err(e) => Err(e),
        }
    }

    /// Extends a lease this instance holds.
    ///
    /// Fails with `LeaseHeld` if another instance has taken it over.
    pub async fn renew(&self) -> Result<LeaseRecord, MetaError> {
        self.renew_at(Timestamp::now()).await
    }

    /// Extends the lease as of `now`.
    pub async fn renew_at(&self, now: Timestamp) -> Result<LeaseRecord, MetaError> {
        match self.store.get_record::<LeaseRecord>(BALANCER_LOCK_KEY)? {
            Some((_, record)) if record.holder == self.instance => self.try_acquire_at(now).await,
            Some((_, record)) => {
                tracing::warn!(instance = %self.instance, holder = %record.holder, "balancer lease lost");
                Err(held(record))
            }
            None => Err(MetaError::InvalidRequest(format!(
                "{} does not hold the balancer lease",
                self.instance
            ))),
        }
    }

    /// Gives up the lease if this instance holds it. A no-op otherwise.
    pub async fn release(&self) -> Result<(), MetaError> {
        if let Some((rev, record)) = self.store.get_record::<LeaseRecord>(BALANCER_LOCK_KEY)? {
            if record.holder == self.instance {
                self.store
                    .compare_and_put::<LeaseRecord>(BALANCER_LOCK_KEY, rev, None)
                    .await?;
                tracing::info!(instance = %self.instance, "balancer lease released");
            }
        }
        Ok(())
    }

    /// The unexpired lease record, if any instance holds one.
    pub fn holder(&self) -> Result<Option<LeaseRecord>, MetaError> {
        current_holder(&self.store, Timestamp::now())
    }

    fn current_holder_error(&self) -> Result<MetaError, MetaError> {
        Ok(match self.store.get_record::<LeaseRecord>(BALANCER_LOCK_KEY)? {
            Some((_, record)) => held(record),
            None => MetaError::InvalidRequest("balancer lease changed concurrently".to_string()),
        })
    }
}

/// The unexpired balancer lease as of `now`.
pub fn current_holder(
    store: &ConfigStore,
    now: Timestamp,
) -> Result<Option<LeaseRecord>, MetaError> {
    Ok(store
        .get_record::<LeaseRecord>(BALANCER_LOCK_KEY)?
        .map(|(_, r)| r)
        .filter(|r| r.expires_at > now))
}

fn held(record: LeaseRecord) -> MetaError {
    MetaError::LeaseHeld {
        holder: record.holder,
        expires_at_ms: record.expires_at.as_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    fn pair() -> (BalancerLease, BalancerLease) {
        let store = Arc::new(ConfigStore::in_memory(3));
        (
            BalancerLease::new(store.clone(), "config-a", TTL),
            BalancerLease::new(store, "config-b", TTL),
        )
    }

    #[tokio::test]
    async fn test_acquire_and_exclude() {
        let (a, b) = pair();
        let t0 = Timestamp::from_millis(1_000);
        let lease = a.try_acquire_at(t0).await.unwrap();
        assert_eq!(lease.holder, "config-a");
        assert_eq!(lease.generation, 1);

        let err = b.try_acquire_at(t0.plus(Duration::from_secs(1))).await.unwrap_err();
        assert!(matches!(err, MetaError::LeaseHeld { ref holder, .. } if holder == "config-a"));
    }

    #[tokio::test]
    async fn test_reacquire_by_holder_extends() {
        let (a, _) = pair();
        let t0 = Timestamp::from_millis(1_000);
        a.try_acquire_at(t0).await.unwrap();
        let later = t0.plus(Duration::from_secs(10));
        let lease = a.try_acquire_at(later).await.unwrap();
        assert_eq!(lease.expires_at, later.plus(TTL));
        assert_eq!(lease.generation, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_taken_over() {
        let (a, b) = pair();
        let t0 = Timestamp::from_millis(1_000);
        a.try_acquire_at(t0).await.unwrap();

        let after_expiry = t0.plus(TTL).plus(Duration::from_millis(1));
        let lease = b.try_acquire_at(after_expiry).await.unwrap();
        assert_eq!(lease.holder, "config-b");
        assert_eq!(lease.generation, 2);

        let err = a.renew_at(after_expiry).await.unwrap_err();
        assert!(matches!(err, MetaError::LeaseHeld { .. }));
    }

    #[tokio::test]
    async fn test_release_lets_other_acquire() {
        let (a, b) = pair();
        a.try_acquire().await.unwrap();
        b.release().await.unwrap();
        assert!(b.try_acquire().await.is_err());

        a.release().await.unwrap();
        assert!(a.holder().unwrap().is_none());
        let lease = b.try_acquire().await.unwrap();
        assert_eq!(lease.holder, "config-b");
        assert_eq!(b.holder().unwrap().unwrap().holder, "config-b");
    }

    #[tokio::test]
    async fn test_stale_read_cannot_overwrite_reacquired_lease() {
        let store = Arc::new(ConfigStore::in_memory(3));
        let a = BalancerLease::new(store.clone(), "config-a", TTL);
        let b = BalancerLease::new(store.clone(), "config-b", TTL);
        a.try_acquire().await.unwrap();
        let (stale_rev, _) = store
            .get_record::<LeaseRecord>(BALANCER_LOCK_KEY)
            .unwrap()
            .unwrap();

        a.release().await.unwrap();
        b.try_acquire().await.unwrap();
        let (live_rev, _) = store
            .get_record::<LeaseRecord>(BALANCER_LOCK_KEY)
            .unwrap()
            .unwrap();
        assert_ne!(stale_rev, live_rev);

        let takeover = LeaseRecord {
            holder: "config-c".to_string(),
            expires_at: Timestamp::now().plus(TTL),
            generation: 1,
        };
        let err = store
            .compare_and_put(BALANCER_LOCK_KEY, stale_rev, Some(&takeover))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::VersionConflict { .. }));
        assert_eq!(b.holder().unwrap().unwrap().holder, "config-b");
    }

    #[tokio::test]
    async fn test_renew_without_lease_fails() {
        let (a, _) = pair();
        assert!(matches!(
            a.renew().await,
            Err(MetaError::InvalidRequest(_))
        ));
    }
}
