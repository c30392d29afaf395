//! Locking strategies.
//!
//! A strategy decides how a read-modify-write cycle on one session is
//! coordinated with other requests touching the same session. All three
//! strategies expose the same three operations, so the handler never needs to
//! know which one is active.

mod null;
mod optimistic;
mod pessimistic;

pub use null::NullLocking;
pub use optimistic::OptimisticLocking;
pub use pessimistic::PessimisticLocking;

use crate::config::LockingStrategyKind;
use crate::error::SessionResult;
use crate::traits::{SessionRecord, SessionStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// What a read observed, handed back to the matching write or destroy.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Lease {
    /// Nothing was read for this key in the current cycle; a write has to
    /// look the record up itself
    #[default]
    None,
    /// Version seen by the read, `None` when the record was absent
    Observed(Option<u64>),
    /// Exclusive lock held on the record
    Locked {
        /// The record as stored with our lock on it
        record: SessionRecord,
        /// The record did not exist before we locked it
        created: bool,
    },
}

impl Lease {
    /// Lock token held by this lease, if any.
    pub fn token(&self) -> Option<&str> {
        match self {
            Lease::Locked { record, .. } => record.lock.as_ref().map(|l| l.token.as_str()),
            _ => None,
        }
    }
}

/// Result of a strategy read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
    /// Stored record as it was before the read, lock excluded
    pub record: Option<SessionRecord>,
    /// Proof of what was read
    pub lease: Lease,
}

/// Coordination algorithm between the handler and the store.
#[async_trait]
pub trait LockingStrategy: Send + Sync {
    /// Read a record, acquiring whatever the strategy needs to write it back.
    async fn do_read(&self, id: &str) -> SessionResult<ReadOutcome>;

    /// Write a record back. When `is_changed` is false the payload and expiry
    /// must not be written, but any held lock is released.
    ///
    /// Returns the lease describing the record as it now stands, for a later
    /// write in the same cycle.
    async fn do_write(
        &self,
        id: &str,
        payload: &[u8],
        is_changed: bool,
        lease: &Lease,
    ) -> SessionResult<Lease>;

    /// Delete a record and release any lock. Missing records are not an error.
    async fn do_destroy(&self, id: &str, lease: &Lease) -> SessionResult<()>;
}

/// Build the strategy selected by configuration.
pub fn build_strategy(
    kind: &LockingStrategyKind,
    store: Arc<dyn SessionStore>,
    session_lifetime: Duration,
) -> Arc<dyn LockingStrategy> {
    match kind {
        LockingStrategyKind::Null => Arc::new(NullLocking::new(store, session_lifetime)),
        LockingStrategyKind::Pessimistic(options) => Arc::new(PessimisticLocking::new(
            store,
            session_lifetime,
            options.clone(),
        )),
        LockingStrategyKind::Optimistic => {
            Arc::new(OptimisticLocking::new(store, session_lifetime))
        }
    }
}
