//! Exclusive lock per session.

use super::{Lease, LockingStrategy, ReadOutcome};
use crate::config::PessimisticOptions;
use crate::error::{SessionError, SessionResult, StoreError};
use crate::traits::{Condition, LockToken, SessionRecord, SessionStore};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reads take an exclusive lock on the record; the write (or destroy) that
/// closes the cycle releases it.
///
/// The lock lives on the record itself and is taken with a version
/// compare-and-swap, so acquiring never overwrites data committed by the
/// previous holder. Acquisition retries with jittered waits until
/// `lock_timeout`. A lock older than `lock_max_age` is treated as abandoned
/// and taken over.
pub struct PessimisticLocking {
    store: Arc<dyn SessionStore>,
    session_lifetime: Duration,
    options: PessimisticOptions,
}

impl PessimisticLocking {
    /// Create the strategy.
    pub fn new(
        store: Arc<dyn SessionStore>,
        session_lifetime: Duration,
        options: PessimisticOptions,
    ) -> Self {
        Self {
            store,
            session_lifetime,
            options,
        }
    }

    /// Locking options in effect.
    pub fn options(&self) -> &PessimisticOptions {
        &self.options
    }

    fn retry_delay(&self) -> Duration {
        let min = self.options.min_retry_interval;
        let max = self.options.max_retry_interval;
        if max <= min {
            return min;
        }
        let micros = rand::rng().random_range(min.as_micros() as u64..=max.as_micros() as u64);
        Duration::from_micros(micros)
    }

    /// One acquire attempt. `Ok(None)` means someone else holds the lock or
    /// won the race for it.
    async fn try_acquire(&self, id: &str) -> SessionResult<Option<ReadOutcome>> {
        let now = Utc::now();
        let current = self.store.get(id).await.map_err(|e| e.for_key(id))?;

        if let Some(record) = &current {
            if record.has_fresh_lock(self.options.lock_max_age, now) {
                return Ok(None);
            }
            if let Some(stale) = &record.lock {
                warn!(
                    "Reclaiming stale lock on session {} acquired at {}",
                    id, stale.acquired_at
                );
            }
        }

        let (locked, condition) = match &current {
            Some(record) => (
                SessionRecord {
                    lock: Some(LockToken::new()),
                    version: record.version + 1,
                    ..record.clone()
                },
                Condition::VersionEquals(record.version),
            ),
            // Placeholder so the lock has somewhere to live; it expires on its
            // own if the holder never writes.
            None => (
                SessionRecord::new(id, Vec::<u8>::new(), self.options.lock_max_age)
                    .with_lock(LockToken::new())
                    .with_version(1),
                Condition::NotExists,
            ),
        };

        match self.store.put(&locked, Some(&condition)).await {
            Ok(()) => {
                debug!("Acquired lock on session {}", id);
                let created = current.is_none();
                let record = current.map(|mut record| {
                    record.lock = None;
                    record
                });
                Ok(Some(ReadOutcome {
                    record,
                    lease: Lease::Locked {
                        record: locked,
                        created,
                    },
                }))
            }
            Err(StoreError::ConditionFailed) => Ok(None),
            Err(e) => Err(e.for_key(id)),
        }
    }

    async fn release(
        &self,
        id: &str,
        locked: &SessionRecord,
        created: bool,
        token: &str,
        payload: &[u8],
        is_changed: bool,
    ) -> SessionResult<Lease> {
        let condition = Condition::LockHeldBy(token.to_string());
        let next_version = locked.version + 1;

        let (result, remaining) = if is_changed {
            let next = SessionRecord::new(id, payload, self.session_lifetime)
                .with_version(next_version);
            (self.store.put(&next, Some(&condition)).await, Some(next_version))
        } else if created {
            (self.store.delete(id, Some(&condition)).await, None)
        } else {
            let released = SessionRecord {
                lock: None,
                version: next_version,
                ..locked.clone()
            };
            (self.store.put(&released, Some(&condition)).await, Some(next_version))
        };

        match result {
            Ok(()) => {
                debug!("Released lock on session {}", id);
                Ok(Lease::Observed(remaining))
            }
            Err(StoreError::ConditionFailed) => {
                warn!("Lock on session {} was taken over before release", id);
                Err(SessionError::LockLost(id.to_string()))
            }
            Err(e) => Err(e.for_key(id)),
        }
    }

    /// Write without having read the record first, e.g. under a freshly
    /// regenerated id.
    async fn write_unleased(&self, id: &str, payload: &[u8]) -> SessionResult<Lease> {
        let now = Utc::now();
        let current = self.store.get(id).await.map_err(|e| e.for_key(id))?;

        let (condition, version) = match &current {
            Some(record) if record.has_fresh_lock(self.options.lock_max_age, now) => {
                return Err(SessionError::LockLost(id.to_string()));
            }
            Some(record) => (Condition::VersionEquals(record.version), record.version + 1),
            None => (Condition::NotExists, 1),
        };

        let record = SessionRecord::new(id, payload, self.session_lifetime).with_version(version);
        match self.store.put(&record, Some(&condition)).await {
            Ok(()) => Ok(Lease::Observed(Some(version))),
            Err(StoreError::ConditionFailed) => Err(SessionError::LockLost(id.to_string())),
            Err(e) => Err(e.for_key(id)),
        }
    }
}

#[async_trait]
impl LockingStrategy for PessimisticLocking {
    async fn do_read(&self, id: &str) -> SessionResult<ReadOutcome> {
        let start = tokio::time::Instant::now();

        loop {
            if let Some(outcome) = self.try_acquire(id).await? {
                return Ok(outcome);
            }

            let waited = start.elapsed();
            if waited >= self.options.lock_timeout {
                info!("Gave up waiting for lock on session {} after {:?}", id, waited);
                return Err(SessionError::LockTimeout {
                    id: id.to_string(),
                    waited,
                });
            }

            let delay = self.retry_delay().min(self.options.lock_timeout - waited);
            tokio::time::sleep(delay).await;
        }
    }

    async fn do_write(
        &self,
        id: &str,
        payload: &[u8],
        is_changed: bool,
        lease: &Lease,
    ) -> SessionResult<Lease> {
        match (lease, lease.token()) {
            (Lease::Locked { record, created }, Some(token)) if record.id == id => {
                self.release(id, record, *created, token, payload, is_changed)
                    .await
            }
            _ if is_changed => self.write_unleased(id, payload).await,
            _ => Ok(lease.clone()),
        }
    }

    async fn do_destroy(&self, id: &str, _lease: &Lease) -> SessionResult<()> {
        self.store.delete(id, None).await.map_err(|e| e.for_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_session::MemorySessionStore;

    fn options() -> PessimisticOptions {
        PessimisticOptions::new(Duration::from_secs(60))
            .with_lock_timeout(Duration::from_millis(60))
            .with_retry_interval(Duration::from_millis(5), Duration::from_millis(10))
    }

    fn strategy(store: &MemorySessionStore) -> PessimisticLocking {
        PessimisticLocking::new(Arc::new(store.clone()), Duration::from_secs(300), options())
    }

    #[tokio::test]
    async fn test_read_acquires_lock() {
        let store = MemorySessionStore::new();
        store.insert(SessionRecord::new("s", b"data".to_vec(), Duration::from_secs(60)));
        let strategy = strategy(&store);

        let outcome = strategy.do_read("s").await.unwrap();
        assert_eq!(outcome.record.unwrap().payload, b"data");
        assert!(outcome.lease.token().is_some());
        assert!(store.peek("s").unwrap().lock.is_some());
    }

    #[tokio::test]
    async fn test_second_reader_times_out() {
        let store = MemorySessionStore::new();
        let strategy = strategy(&store);

        let _held = strategy.do_read("s").await.unwrap();
        let err = strategy.do_read("s").await.unwrap_err();

        assert!(matches!(err, SessionError::LockTimeout { ref id, .. } if id == "s"));
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let store = MemorySessionStore::new();
        let stale = LockToken {
            token: "crashed-holder".to_string(),
            acquired_at: Utc::now() - chrono::Duration::minutes(5),
        };
        store.insert(
            SessionRecord::new("s", b"data".to_vec(), Duration::from_secs(600)).with_lock(stale),
        );
        let strategy = strategy(&store);

        let outcome = strategy.do_read("s").await.unwrap();
        assert_ne!(outcome.lease.token(), Some("crashed-holder"));
        assert_eq!(outcome.record.unwrap().payload, b"data");
    }

    #[tokio::test]
    async fn test_unchanged_release_keeps_expiry() {
        let store = MemorySessionStore::new();
        let original = SessionRecord::new("s", b"data".to_vec(), Duration::from_secs(60));
        store.insert(original.clone());
        let strategy = strategy(&store);

        let outcome = strategy.do_read("s").await.unwrap();
        strategy
            .do_write("s", b"data", false, &outcome.lease)
            .await
            .unwrap();

        let stored = store.peek("s").unwrap();
        assert!(stored.lock.is_none());
        assert_eq!(stored.expires_at, original.expires_at);
        assert_eq!(stored.payload, original.payload);
    }

    #[tokio::test]
    async fn test_second_write_after_release() {
        let store = MemorySessionStore::new();
        store.insert(SessionRecord::new("s", b"data".to_vec(), Duration::from_secs(60)));
        let strategy = strategy(&store);

        let outcome = strategy.do_read("s").await.unwrap();
        let lease = strategy
            .do_write("s", b"first", true, &outcome.lease)
            .await
            .unwrap();
        assert!(lease.token().is_none());

        strategy.do_write("s", b"second", true, &lease).await.unwrap();
        let stored = store.peek("s").unwrap();
        assert_eq!(stored.payload, b"second");
        assert!(stored.lock.is_none());
    }

    #[tokio::test]
    async fn test_placeholder_removed_on_unchanged_release() {
        let store = MemorySessionStore::new();
        let strategy = strategy(&store);

        let outcome = strategy.do_read("fresh").await.unwrap();
        assert!(outcome.record.is_none());
        assert_eq!(store.len(), 1);

        strategy
            .do_write("fresh", b"", false, &outcome.lease)
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_write_after_takeover_reports_lock_lost() {
        let store = MemorySessionStore::new();
        let strategy = strategy(&store);

        let outcome = strategy.do_read("s").await.unwrap();

        // Another request reclaims the lock after it went stale.
        let mut stolen = store.peek("s").unwrap();
        stolen.lock = Some(LockToken::new());
        store.insert(stolen);

        let err = strategy
            .do_write("s", b"late", true, &outcome.lease)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::LockLost(_)));
        assert!(store.peek("s").unwrap().payload.is_empty());
    }

    #[tokio::test]
    async fn test_unleased_write_refuses_locked_record() {
        let store = MemorySessionStore::new();
        let strategy = strategy(&store);

        let _held = strategy.do_read("s").await.unwrap();
        let err = strategy
            .do_write("s", b"intruder", true, &Lease::None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::LockLost(_)));
    }
}
