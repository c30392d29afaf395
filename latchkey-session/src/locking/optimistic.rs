//! Version compare-and-swap.

use super::{Lease, LockingStrategy, ReadOutcome};
use crate::error::{SessionError, SessionResult, StoreError};
use crate::traits::{Condition, SessionRecord, SessionStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Reads remember the record version; writes only land if the version is
/// still the one that was read.
///
/// A lost race is reported as [`SessionError::ConcurrentModification`] and is
/// not retried here.
pub struct OptimisticLocking {
    store: Arc<dyn SessionStore>,
    session_lifetime: Duration,
}

impl OptimisticLocking {
    /// Create the strategy.
    pub fn new(store: Arc<dyn SessionStore>, session_lifetime: Duration) -> Self {
        Self {
            store,
            session_lifetime,
        }
    }
}

#[async_trait]
impl LockingStrategy for OptimisticLocking {
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
            return Ok(lease.clone());
        }

        let observed = match lease {
            Lease::Observed(version) => *version,
            Lease::Locked { record, .. } => Some(record.version),
            // Blind write: compare against whatever is stored right now
            Lease::None => self
                .store
                .get(id)
                .await
                .map_err(|e| e.for_key(id))?
                .map(|record| record.version),
        };
        let (condition, version) = match observed {
            Some(v) => (Condition::VersionEquals(v), v + 1),
            None => (Condition::NotExists, 1),
        };
        let record = SessionRecord::new(id, payload, self.session_lifetime).with_version(version);

        match self.store.put(&record, Some(&condition)).await {
            Ok(()) => {
                debug!("Session {} written at version {}", id, version);
                Ok(Lease::Observed(Some(version)))
            }
            Err(StoreError::ConditionFailed) => {
                warn!("Session {} changed since version {:?} was read", id, observed);
                Err(SessionError::ConcurrentModification(id.to_string()))
            }
            Err(e) => Err(e.for_key(id)),
        }
    }

    async fn do_destroy(&self, id: &str, _lease: &Lease) -> SessionResult<()> {
        self.store.delete(id, None).await.map_err(|e| e.for_key(id))
    }
}
