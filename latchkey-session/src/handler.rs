//! Session handler.
//!
//! Drives one open/read/write/close cycle per request and delegates all
//! persistence to the configured locking strategy.

use crate::config::SessionConfig;
use crate::error::SessionResult;
use crate::gc::{GarbageCollector, GcReport};
use crate::locking::{Lease, LockingStrategy, ReadOutcome, build_strategy};
use crate::traits::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// State remembered between `read` and `write` in one request.
#[derive(Debug)]
struct OpenSession {
    key: String,
    snapshot: Vec<u8>,
    lease: Lease,
}

/// Session lifecycle over a distributed store.
///
/// A handler belongs to a single request: create one per request (they are
/// cheap, the store and strategy are shared through `Arc`) and drive it
/// through `open`, `read`, `write` and `close`.
///
/// # Examples
///
/// ```
/// use latchkey_session::{MemorySessionStore, SessionConfig, SessionHandler};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), latchkey_session::SessionError> {
/// let store = Arc::new(MemorySessionStore::new());
/// let mut handler = SessionHandler::new(store, SessionConfig::default())?;
///
/// handler.open("", "PHPSESSID");
/// let data = handler.read("abc123").await?;
/// assert!(data.is_empty());
/// assert!(handler.write("abc123", b"user=alice").await);
/// handler.close();
/// # Ok(())
/// # }
/// ```
pub struct SessionHandler {
    config: SessionConfig,
    strategy: Arc<dyn LockingStrategy>,
    collector: GarbageCollector,
    session_name: String,
    current: Option<OpenSession>,
}

impl SessionHandler {
    /// Create a handler using the strategy named by `config.locking_strategy`.
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> SessionResult<Self> {
        config.validate()?;
        let strategy = build_strategy(
            &config.locking_strategy,
            store.clone(),
            config.session_lifetime,
        );
        Ok(Self::assemble(store, strategy, config))
    }

    /// Create a handler with a caller-supplied strategy.
    pub fn with_strategy(
        store: Arc<dyn SessionStore>,
        strategy: Arc<dyn LockingStrategy>,
        config: SessionConfig,
    ) -> SessionResult<Self> {
        config.validate()?;
        Ok(Self::assemble(store, strategy, config))
    }

    fn assemble(
        store: Arc<dyn SessionStore>,
        strategy: Arc<dyn LockingStrategy>,
        config: SessionConfig,
    ) -> Self {
        let collector = GarbageCollector::new(
            store,
            config.gc_batch_size,
            config.gc_operation_delay,
            config.lock_max_age(),
        );
        Self {
            config,
            strategy,
            collector,
            session_name: String::new(),
            current: None,
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Store key for a session id. Ids are prefixed with the session name
    /// given to [`open`](Self::open), if any.
    pub fn key(&self, id: &str) -> String {
        if self.session_name.is_empty() {
            id.to_string()
        } else {
            format!("{}_{}", self.session_name, id)
        }
    }

    /// Begin a cycle. Never touches the store.
    pub fn open(&mut self, _save_path: &str, session_name: &str) -> bool {
        self.session_name = session_name.to_string();
        true
    }

    /// Read session data, taking the strategy's lock if it has one.
    ///
    /// Absent and expired sessions read as empty; expired ones are deleted on
    /// the way. A lock still held from an earlier read in this cycle is
    /// released first.
    pub async fn read(&mut self, id: &str) -> SessionResult<Vec<u8>> {
        if let Some(open) = self.current.take() {
            if open.lease.token().is_some() {
                debug!("Releasing lock on session {} before reading again", open.key);
                self.release(&open).await;
            }
        }

        let key = self.key(id);
        let ReadOutcome { record, mut lease } = self.strategy.do_read(&key).await?;

        let payload = match record {
            Some(record) if !record.is_expired() => record.payload,
            Some(_) => {
                debug!("Session {} expired, removing", key);
                match self.strategy.do_destroy(&key, &lease).await {
                    Ok(()) => lease = Lease::Observed(None),
                    Err(e) => warn!("Failed to remove expired session {}: {}", key, e),
                }
                Vec::new()
            }
            None => Vec::new(),
        };

        self.current = Some(OpenSession {
            key,
            snapshot: payload.clone(),
            lease,
        });
        Ok(payload)
    }

    /// Write session data. Returns false if the strategy could not complete
    /// the write.
    pub async fn write(&mut self, id: &str, payload: &[u8]) -> bool {
        match self.try_write(id, payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write session {}: {}", id, e);
                false
            }
        }
    }

    /// Write session data, reporting why a write failed.
    ///
    /// Nothing is written to the store when neither the id nor the payload
    /// changed since `read`; a held lock is still released. A changed id
    /// writes the new record first and then deletes the old one. If the new
    /// record cannot be written, the old one is left intact and unlocked.
    pub async fn try_write(&mut self, id: &str, payload: &[u8]) -> SessionResult<()> {
        let key = self.key(id);

        let lease = match self.current.take() {
            None => {
                self.strategy
                    .do_write(&key, payload, true, &Lease::None)
                    .await?
            }
            Some(open) if open.key == key => {
                let is_changed = open.snapshot != payload;
                match self
                    .strategy
                    .do_write(&key, payload, is_changed, &open.lease)
                    .await
                {
                    Ok(lease) => lease,
                    Err(e) => {
                        self.current = Some(open);
                        return Err(e);
                    }
                }
            }
            Some(open) => {
                match self
                    .strategy
                    .do_write(&key, payload, true, &Lease::None)
                    .await
                {
                    Ok(lease) => {
                        debug!("Session id regenerated, removing {}", open.key);
                        self.strategy.do_destroy(&open.key, &open.lease).await?;
                        lease
                    }
                    Err(e) => {
                        let lease = self.release(&open).await;
                        self.current = Some(OpenSession { lease, ..open });
                        return Err(e);
                    }
                }
            }
        };

        self.current = Some(OpenSession {
            key,
            snapshot: payload.to_vec(),
            lease,
        });
        Ok(())
    }

    /// Give up a held lock without changing the record.
    async fn release(&self, open: &OpenSession) -> Lease {
        if open.lease.token().is_none() {
            return open.lease.clone();
        }
        match self
            .strategy
            .do_write(&open.key, &open.snapshot, false, &open.lease)
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Failed to release lock on session {}: {}", open.key, e);
                Lease::None
            }
        }
    }

    /// End the cycle.
    pub fn close(&mut self) -> bool {
        if let Some(open) = self.current.take() {
            if open.lease.token().is_some() {
                debug!("Closing session {} without a write, lock left to expire", open.key);
            }
        }
        true
    }

    /// Delete a session. Missing sessions count as destroyed.
    pub async fn destroy(&mut self, id: &str) -> bool {
        match self.try_destroy(id).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to destroy session {}: {}", id, e);
                false
            }
        }
    }

    /// Delete a session, reporting failures.
    pub async fn try_destroy(&mut self, id: &str) -> SessionResult<()> {
        let key = self.key(id);
        let lease = match self.current.take() {
            Some(open) if open.key == key => open.lease,
            _ => Lease::None,
        };
        self.strategy.do_destroy(&key, &lease).await
    }

    /// Collect expired sessions. Failures are logged and reported as `false`.
    pub async fn gc(&self, max_lifetime: Duration) -> bool {
        match self.try_gc(max_lifetime).await {
            Ok(report) => {
                debug!("Garbage collection finished: {:?}", report);
                true
            }
            Err(e) => {
                warn!("Garbage collection failed: {}", e);
                false
            }
        }
    }

    /// Collect expired sessions, reporting what happened.
    pub async fn try_gc(&self, max_lifetime: Duration) -> SessionResult<GcReport> {
        self.collector.collect(max_lifetime).await
    }

    /// Whether a request that rolled `roll` (uniform in `[0, 1)`) should run
    /// garbage collection.
    pub fn gc_due(&self, roll: f64) -> bool {
        self.config.automatic_gc && roll < self.config.gc_probability
    }

    /// Run garbage collection if `roll` says it is due. Returns true when no
    /// collection was due.
    pub async fn collect_garbage_if_due(&self, roll: f64, max_lifetime: Duration) -> bool {
        if !self.gc_due(roll) {
            return true;
        }
        self.gc(max_lifetime).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::memory_session::MemorySessionStore;
    use crate::traits::SessionRecord;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    /// Strategy double that records calls, keyed on the handler's view.
    #[derive(Default)]
    struct ScriptedStrategy {
        stored: Mutex<Option<SessionRecord>>,
        writes: Mutex<Vec<(String, Vec<u8>, bool)>>,
        destroys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LockingStrategy for ScriptedStrategy {
        async fn do_read(&self, _id: &str) -> SessionResult<ReadOutcome> {
            Ok(ReadOutcome {
                record: self.stored.lock().unwrap().clone(),
                lease: Lease::None,
            })
        }

        async fn do_write(
            &self,
            id: &str,
            payload: &[u8],
            is_changed: bool,
            lease: &Lease,
        ) -> SessionResult<Lease> {
            self.writes
                .lock()
                .unwrap()
                .push((id.to_string(), payload.to_vec(), is_changed));
            Ok(lease.clone())
        }

        async fn do_destroy(&self, id: &str, _lease: &Lease) -> SessionResult<()> {
            self.destroys.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    fn handler_with(strategy: Arc<ScriptedStrategy>) -> SessionHandler {
        SessionHandler::with_strategy(
            Arc::new(MemorySessionStore::new()),
            strategy,
            SessionConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_open_and_close_always_succeed() {
        let mut handler = handler_with(Arc::new(ScriptedStrategy::default()));
        assert!(handler.open("test", "example"));
        assert!(handler.close());
    }

    #[tokio::test]
    async fn test_read_expired_record_destroys_it() {
        let strategy = Arc::new(ScriptedStrategy::default());
        *strategy.stored.lock().unwrap() = Some(
            SessionRecord::new("test", b"ANYTHING".to_vec(), Duration::from_secs(1))
                .with_expires_at(Utc::now() - chrono::Duration::seconds(5)),
        );
        let mut handler = handler_with(strategy.clone());

        assert!(handler.open("test", "example"));
        assert!(handler.read("test").await.unwrap().is_empty());
        assert_eq!(*strategy.destroys.lock().unwrap(), vec!["example_test"]);
    }

    #[tokio::test]
    async fn test_write_without_read_is_a_change() {
        let strategy = Arc::new(ScriptedStrategy::default());
        let mut handler = handler_with(strategy.clone());

        assert!(handler.write("test", b"ANYTHING").await);
        let writes = strategy.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert!(writes[0].2);
    }

    #[tokio::test]
    async fn test_new_id_with_same_data_is_written() {
        let strategy = Arc::new(ScriptedStrategy::default());
        *strategy.stored.lock().unwrap() = Some(SessionRecord::new(
            "oldId",
            b"serializedData".to_vec(),
            Duration::from_secs(600),
        ));
        let mut handler = handler_with(strategy.clone());

        assert_eq!(handler.read("oldId").await.unwrap(), b"serializedData");
        assert!(handler.write("newId", b"serializedData").await);

        assert_eq!(
            *strategy.writes.lock().unwrap(),
            vec![("newId".to_string(), b"serializedData".to_vec(), true)]
        );
        assert_eq!(*strategy.destroys.lock().unwrap(), vec!["oldId"]);
    }

    #[tokio::test]
    async fn test_unchanged_write_is_flagged_unchanged() {
        let strategy = Arc::new(ScriptedStrategy::default());
        *strategy.stored.lock().unwrap() = Some(SessionRecord::new(
            "s",
            b"same".to_vec(),
            Duration::from_secs(600),
        ));
        let mut handler = handler_with(strategy.clone());

        handler.read("s").await.unwrap();
        assert!(handler.write("s", b"same").await);
        assert!(!strategy.writes.lock().unwrap()[0].2);
    }

    #[tokio::test]
    async fn test_optimistic_writes_twice_in_one_cycle() {
        let store = Arc::new(MemorySessionStore::new());
        store.insert(SessionRecord::new("s", b"base".to_vec(), Duration::from_secs(600)));
        let mut handler =
            SessionHandler::new(store.clone(), SessionConfig::new().with_optimistic_locking())
                .unwrap();

        handler.read("s").await.unwrap();
        handler.try_write("s", b"A").await.unwrap();
        handler.try_write("s", b"B").await.unwrap();

        assert_eq!(store.peek("s").unwrap().payload, b"B");
    }

    #[tokio::test]
    async fn test_optimistic_write_without_read_on_existing_record() {
        let store = Arc::new(MemorySessionStore::new());
        store.insert(SessionRecord::new("s", b"base".to_vec(), Duration::from_secs(600)));
        let mut handler =
            SessionHandler::new(store.clone(), SessionConfig::new().with_optimistic_locking())
                .unwrap();

        handler.try_write("s", b"blind").await.unwrap();
        assert_eq!(store.peek("s").unwrap().payload, b"blind");
    }

    #[tokio::test]
    async fn test_gc_due_uses_injected_roll() {
        let store = Arc::new(MemorySessionStore::new());
        let handler =
            SessionHandler::new(store.clone(), SessionConfig::new().with_automatic_gc(0.25))
                .unwrap();

        assert!(handler.gc_due(0.1));
        assert!(!handler.gc_due(0.25));
        assert!(!handler.gc_due(0.9));

        let disabled = SessionHandler::new(store, SessionConfig::default()).unwrap();
        assert!(!disabled.gc_due(0.0));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = SessionHandler::new(
            Arc::new(MemorySessionStore::new()),
            SessionConfig::new().with_gc_batch_size(0),
        );
        assert!(matches!(result, Err(SessionError::Config(_))));
    }
}
