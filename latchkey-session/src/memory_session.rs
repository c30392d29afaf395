//! In-process session store.

use crate::error::{StoreError, StoreResult};
use crate::traits::{Condition, ExpiredPage, ExpiredSession, SessionRecord, SessionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

/// `DashMap`-backed store for tests and single-process deployments.
///
/// Conditional writes run under the map's per-key entry lock, so they are
/// atomic per key just like a remote store's conditional writes.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    records: Arc<DashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record as-is, bypassing conditions.
    pub fn insert(&self, record: SessionRecord) {
        self.records.insert(record.id.clone(), record);
    }

    /// Read a record without going through the adapter.
    pub fn peek(&self, id: &str) -> Option<SessionRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    /// Number of stored records, expired ones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop all records.
    pub fn clear(&self) {
        self.records.clear();
    }
}

fn check(condition: Option<&Condition>, current: Option<&SessionRecord>) -> StoreResult<()> {
    match condition {
        Some(condition) if !condition.matches(current) => Err(StoreError::ConditionFailed),
        _ => Ok(()),
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        Ok(self.peek(id))
    }

    async fn put(&self, record: &SessionRecord, condition: Option<&Condition>) -> StoreResult<()> {
        match self.records.entry(record.id.clone()) {
            Entry::Occupied(mut entry) => {
                check(condition, Some(entry.get()))?;
                entry.insert(record.clone());
            }
            Entry::Vacant(entry) => {
                check(condition, None)?;
                entry.insert(record.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, id: &str, condition: Option<&Condition>) -> StoreResult<()> {
        match self.records.entry(id.to_string()) {
            Entry::Occupied(entry) => {
                check(condition, Some(entry.get()))?;
                entry.remove();
                Ok(())
            }
            Entry::Vacant(_) => check(condition, None),
        }
    }

    async fn scan_expired(
        &self,
        before: DateTime<Utc>,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<ExpiredPage> {
        // Key order keeps the cursor valid while records are deleted between pages
        let mut sessions: Vec<ExpiredSession> = self
            .records
            .iter()
            .filter(|entry| entry.expires_at < before)
            .filter(|entry| cursor.is_none_or(|after| entry.key().as_str() > after))
            .map(|entry| ExpiredSession {
                id: entry.id.clone(),
                expires_at: entry.expires_at,
                version: entry.version,
                lock: entry.lock.clone(),
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));

        let limit = limit.max(1);
        let next = if sessions.len() > limit {
            sessions.truncate(limit);
            sessions.last().map(|last| last.id.clone())
        } else {
            None
        };
        Ok(ExpiredPage { sessions, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(id: &str) -> SessionRecord {
        SessionRecord::new(id, b"payload".to_vec(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemorySessionStore::new();
        store.put(&record("a"), None).await.unwrap();

        let loaded = store.get("a").await.unwrap().unwrap();
        assert_eq!(loaded.payload, b"payload");

        store.delete("a", None).await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = MemorySessionStore::new();
        assert!(store.delete("missing", None).await.is_ok());
        assert_eq!(
            store
                .delete("missing", Some(&Condition::VersionEquals(1)))
                .await,
            Err(StoreError::ConditionFailed)
        );
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let store = MemorySessionStore::new();
        let first = record("a").with_version(1);

        store.put(&first, Some(&Condition::NotExists)).await.unwrap();
        assert_eq!(
            store.put(&first, Some(&Condition::NotExists)).await,
            Err(StoreError::ConditionFailed)
        );

        let second = record("a").with_version(2);
        store
            .put(&second, Some(&Condition::VersionEquals(1)))
            .await
            .unwrap();
        assert_eq!(
            store.put(&second, Some(&Condition::VersionEquals(1))).await,
            Err(StoreError::ConditionFailed)
        );
        assert_eq!(store.peek("a").unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_scan_expired() {
        let store = MemorySessionStore::new();
        let now = Utc::now();
        store.insert(record("live"));
        store.insert(record("dead").with_expires_at(now - chrono::Duration::seconds(5)));

        let page = store.scan_expired(now, None, 10).await.unwrap();
        assert_eq!(page.sessions.len(), 1);
        assert_eq!(page.sessions[0].id, "dead");
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn test_scan_expired_pages() {
        let store = MemorySessionStore::new();
        let now = Utc::now();
        for id in ["d", "a", "c", "b", "e"] {
            store.insert(record(id).with_expires_at(now - chrono::Duration::seconds(5)));
        }

        let first = store.scan_expired(now, None, 2).await.unwrap();
        let ids: Vec<_> = first.sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(first.next.as_deref(), Some("b"));

        // Deleting what was already returned does not disturb the cursor
        store.delete("a", None).await.unwrap();
        let second = store.scan_expired(now, first.next.as_deref(), 2).await.unwrap();
        let ids: Vec<_> = second.sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["c", "d"]);

        let last = store.scan_expired(now, second.next.as_deref(), 2).await.unwrap();
        assert_eq!(last.sessions.len(), 1);
        assert!(last.next.is_none());
    }
}
