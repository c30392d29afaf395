//! Session record model and store adapter trait.

use crate::error::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Convert a std duration into a chrono delta, saturating to zero on overflow.
pub(crate) fn delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_default()
}

/// Exclusive lock marker stored on a record by pessimistic locking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    /// Random token identifying the holder
    pub token: String,
    /// When the lock was taken
    pub acquired_at: DateTime<Utc>,
}

impl LockToken {
    /// Create a fresh token acquired now.
    pub fn new() -> Self {
        Self {
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
        }
    }

    /// A lock is stale once it is older than `max_age`.
    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.acquired_at + delta(max_age) <= now
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A stored session.
///
/// The payload is an opaque blob; serialization of session state is the
/// caller's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Store key
    pub id: String,
    /// Serialized session state
    pub payload: Vec<u8>,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
    /// Present while a pessimistic holder owns the record
    pub lock: Option<LockToken>,
    /// Write counter, bumped on every strategy-issued put
    pub version: u64,
}

impl SessionRecord {
    /// Create an unlocked record expiring `lifetime` from now.
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>, lifetime: Duration) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            expires_at: Utc::now() + delta(lifetime),
            lock: None,
            version: 0,
        }
    }

    /// Set the version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Set the lock.
    pub fn with_lock(mut self, lock: LockToken) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Set an explicit expiry.
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Check if the record has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check expiry against a given instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether a lock is held that has not yet gone stale.
    pub fn has_fresh_lock(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|lock| !lock.is_stale(max_age, now))
    }
}

/// What garbage collection needs to know about an expired session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredSession {
    /// Store key
    pub id: String,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
    /// Version at scan time
    pub version: u64,
    /// Lock held at scan time
    pub lock: Option<LockToken>,
}

impl From<SessionRecord> for ExpiredSession {
    fn from(record: SessionRecord) -> Self {
        Self {
            id: record.id,
            expires_at: record.expires_at,
            version: record.version,
            lock: record.lock,
        }
    }
}

impl ExpiredSession {
    /// Whether a lock is held that has not yet gone stale.
    pub fn has_fresh_lock(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|lock| !lock.is_stale(max_age, now))
    }
}

/// One page of an expiry scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiredPage {
    /// Expired sessions on this page
    pub sessions: Vec<ExpiredSession>,
    /// Cursor to pass to the next call, `None` once the scan is complete
    pub next: Option<String>,
}

/// Server-side predicate attached to a put or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// No record exists under the key
    NotExists,
    /// The record exists and carries this version
    VersionEquals(u64),
    /// The record exists and is locked with this token
    LockHeldBy(String),
}

impl Condition {
    /// Evaluate the condition against the current stored state.
    pub fn matches(&self, current: Option<&SessionRecord>) -> bool {
        match (self, current) {
            (Condition::NotExists, current) => current.is_none(),
            (Condition::VersionEquals(v), Some(record)) => record.version == *v,
            (Condition::LockHeldBy(token), Some(record)) => record
                .lock
                .as_ref()
                .is_some_and(|lock| &lock.token == token),
            (_, None) => false,
        }
    }
}

/// Key-value store adapter.
///
/// Implementations must apply each conditional put/delete atomically per key
/// and serve strongly consistent single-key reads.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a record by key.
    async fn get(&self, id: &str) -> StoreResult<Option<SessionRecord>>;

    /// Write a record, optionally guarded by a condition.
    async fn put(&self, record: &SessionRecord, condition: Option<&Condition>) -> StoreResult<()>;

    /// Delete a record, optionally guarded by a condition.
    ///
    /// An unconditional delete of a missing key succeeds.
    async fn delete(&self, id: &str, condition: Option<&Condition>) -> StoreResult<()>;

    /// Return up to `limit` sessions whose `expires_at` is before `before`,
    /// resuming after `cursor` when one is given.
    ///
    /// A page may hold fewer than `limit` entries (even none) while
    /// `next` is still set; the scan is over once `next` is `None`.
    async fn scan_expired(
        &self,
        before: DateTime<Utc>,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<ExpiredPage>;
}

/// Generate a new unique session ID.
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
