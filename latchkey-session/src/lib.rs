//! Distributed session storage with pluggable locking.
//!
//! Sessions live in a remote key-value store that offers conditional writes
//! but no record locks and no TTL expiry. This crate layers conventional
//! session handler semantics (open, read, write, close, destroy, gc) on top
//! of such a store while keeping concurrent requests that share a session id
//! from losing or corrupting each other's data.
//!
//! # Locking Strategies
//!
//! - **Null** - plain reads and writes, last write wins
//! - **Pessimistic** - `read` takes an exclusive lock that `write` releases;
//!   other readers wait up to `lock_timeout`, and locks older than
//!   `lock_max_age` are reclaimed
//! - **Optimistic** - `write` is a version compare-and-swap; the loser gets
//!   [`SessionError::ConcurrentModification`]
//!
//! # Features
//!
//! - `dynamodb` - DynamoDB store adapter
//!
//! # Examples
//!
//! ```
//! use latchkey_session::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), SessionError> {
//! let store = Arc::new(MemorySessionStore::new());
//! let config = SessionConfig::new()
//!     .with_session_lifetime(Duration::from_secs(3600))
//!     .with_pessimistic_locking(PessimisticOptions::new(Duration::from_secs(30)));
//!
//! // One handler per request
//! let mut handler = SessionHandler::new(store.clone(), config.clone())?;
//! handler.open("", "app");
//! let _data = handler.read("abc").await?; // lock held from here...
//! handler.write("abc", b"cart=3").await; // ...to here
//! handler.close();
//!
//! // Occasional cleanup, decided by the caller
//! if handler.gc_due(gc::roll()) {
//!     handler.gc(Duration::ZERO).await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod gc;
pub mod handler;
pub mod locking;
pub mod memory_session;
pub mod traits;

#[cfg(feature = "dynamodb")]
pub mod dynamodb_session;

pub use config::{LockingStrategyKind, PessimisticOptions, SessionConfig};
pub use error::{SessionError, SessionResult, StoreError, StoreResult};
pub use gc::{GarbageCollector, GcReport};
pub use handler::SessionHandler;
pub use locking::{
    Lease, LockingStrategy, NullLocking, OptimisticLocking, PessimisticLocking, ReadOutcome,
    build_strategy,
};
pub use memory_session::MemorySessionStore;
pub use traits::{
    Condition, ExpiredPage, ExpiredSession, LockToken, SessionRecord, SessionStore,
    generate_session_id,
};

#[cfg(feature = "dynamodb")]
pub use dynamodb_session::DynamoDbSessionStore;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{LockingStrategyKind, PessimisticOptions, SessionConfig};
    pub use crate::error::{SessionError, SessionResult};
    pub use crate::handler::SessionHandler;
    pub use crate::locking::LockingStrategy;
    pub use crate::memory_session::MemorySessionStore;
    pub use crate::traits::{SessionRecord, SessionStore, generate_session_id};

    #[cfg(feature = "dynamodb")]
    pub use crate::dynamodb_session::DynamoDbSessionStore;
}
