//! No coordination.

use super::{Lease, LockingStrategy, ReadOutcome};
use crate::error::SessionResult;
use crate::traits::{SessionRecord, SessionStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Plain get/put/delete. Concurrent writers overwrite each other.
///
/// Use only when a single writer per session is guaranteed externally.
pub struct NullLocking {
    store: Arc<dyn SessionStore>,
    session_lifetime: Duration,
}

impl NullLocking {
    /// Create the strategy.
    pub fn new(store: Arc<dyn SessionStore>, session_lifetime: Duration) -> Self {
        Self {
            store,
            session_lifetime,
        }
    }
}

#[async_trait]
impl LockingStrategy for NullLocking {
    async fn do_read(&self, id: &str) -> SessionResult<ReadOutcome> {
        let record = self.store.get(id).await.map_err(|e| e.for_key(id))?;
        let lease = Lease::Observed(record.as_ref().map(|r| r.version));
        Ok(ReadOutcome { record, lease })
    }

    async fn do_write(
        &self,
        id: &str,
        payload: &[u8],
        is_changed: bool,
        lease: &Lease,
    ) -> SessionResult<Lease> {
        if !is_changed {
            debug!("Session {} unchanged, skipping write", id);
            return Ok(lease.clone());
        }

        let version = match lease {
            Lease::Observed(Some(v)) => v + 1,
            Lease::Locked { record, .. } => record.version + 1,
            _ => 1,
        };
        let record = SessionRecord::new(id, payload, self.session_lifetime).with_version(version);

        self.store
            .put(&record, None)
            .await
            .map_err(|e| e.for_key(id))?;
        Ok(Lease::Observed(Some(version)))
    }

    async fn do_destroy(&self, id: &str, _lease: &Lease) -> SessionResult<()> {
        self.store.delete(id, None).await.map_err(|e| e.for_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_session::MemorySessionStore;

    #[tokio::test]
    async fn test_last_write_wins() {
        let store = MemorySessionStore::new();
        let strategy = NullLocking::new(Arc::new(store.clone()), Duration::from_secs(60));

        let first = strategy.do_read("s").await.unwrap();
        let second = strategy.do_read("s").await.unwrap();
        assert!(first.record.is_none());

        strategy.do_write("s", b"one", true, &first.lease).await.unwrap();
        let lease = strategy.do_write("s", b"two", true, &second.lease).await.unwrap();

        assert_eq!(store.peek("s").unwrap().payload, b"two");
        assert_eq!(lease, Lease::Observed(Some(1)));
    }

    #[tokio::test]
    async fn test_unchanged_write_is_skipped() {
        let store = MemorySessionStore::new();
        let strategy = NullLocking::new(Arc::new(store.clone()), Duration::from_secs(60));

        strategy
            .do_write("s", b"data", false, &Lease::None)
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_missing() {
        let strategy = NullLocking::new(
            Arc::new(MemorySessionStore::new()),
            Duration::from_secs(60),
        );
        assert!(strategy.do_destroy("missing", &Lease::None).await.is_ok());
    }
}
