//! Session configuration.

use crate::error::{SessionError, SessionResult};
use std::time::Duration;

/// Options for pessimistic locking.
///
/// `lock_max_age` has no default: a lock older than this is considered
/// abandoned and may be taken over by another request. Pick a value well
/// above the longest request that holds a session open.
#[derive(Debug, Clone, PartialEq)]
pub struct PessimisticOptions {
    /// Maximum time to wait for a lock before failing with `LockTimeout`
    pub lock_timeout: Duration,
    /// Age after which a held lock is forcibly reclaimed
    pub lock_max_age: Duration,
    /// Lower bound of the jittered wait between acquire attempts
    pub min_retry_interval: Duration,
    /// Upper bound of the jittered wait between acquire attempts
    pub max_retry_interval: Duration,
}

impl PessimisticOptions {
    /// Create options with the required stale-lock threshold.
    pub fn new(lock_max_age: Duration) -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            lock_max_age,
            min_retry_interval: Duration::from_millis(10),
            max_retry_interval: Duration::from_millis(50),
        }
    }

    /// Set the acquire timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the jitter bounds between acquire attempts.
    pub fn with_retry_interval(mut self, min: Duration, max: Duration) -> Self {
        self.min_retry_interval = min;
        self.max_retry_interval = max;
        self
    }
}

/// Which locking strategy the handler uses.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LockingStrategyKind {
    /// No coordination, last write wins
    #[default]
    Null,
    /// Exclusive lock per session, acquired on read
    Pessimistic(PessimisticOptions),
    /// Version compare-and-swap on write
    Optimistic,
}

impl std::fmt::Display for LockingStrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockingStrategyKind::Null => write!(f, "null"),
            LockingStrategyKind::Pessimistic(_) => write!(f, "pessimistic"),
            LockingStrategyKind::Optimistic => write!(f, "optimistic"),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Locking strategy
    pub locking_strategy: LockingStrategyKind,
    /// Expiry window applied on every payload write
    pub session_lifetime: Duration,
    /// Whether callers should opportunistically run garbage collection
    pub automatic_gc: bool,
    /// Fraction of requests that trigger garbage collection
    pub gc_probability: f64,
    /// Number of deletes issued per garbage collection batch
    pub gc_batch_size: usize,
    /// Pause between garbage collection batches
    pub gc_operation_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            locking_strategy: LockingStrategyKind::Null,
            session_lifetime: Duration::from_secs(1440), // 24 minutes
            automatic_gc: false,
            gc_probability: 0.01,
            gc_batch_size: 25,
            gc_operation_delay: Duration::ZERO,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use pessimistic locking.
    ///
    /// # Examples
    ///
    /// ```
    /// use latchkey_session::{PessimisticOptions, SessionConfig};
    /// use std::time::Duration;
    ///
    /// let config = SessionConfig::new().with_pessimistic_locking(
    ///     PessimisticOptions::new(Duration::from_secs(60))
    ///         .with_lock_timeout(Duration::from_secs(5)),
    /// );
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn with_pessimistic_locking(mut self, options: PessimisticOptions) -> Self {
        self.locking_strategy = LockingStrategyKind::Pessimistic(options);
        self
    }

    /// Use optimistic locking.
    pub fn with_optimistic_locking(mut self) -> Self {
        self.locking_strategy = LockingStrategyKind::Optimistic;
        self
    }

    /// Set the locking strategy.
    pub fn with_locking_strategy(mut self, kind: LockingStrategyKind) -> Self {
        self.locking_strategy = kind;
        self
    }

    /// Set the session lifetime.
    pub fn with_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.session_lifetime = lifetime;
        self
    }

    /// Enable opportunistic garbage collection with the given probability.
    pub fn with_automatic_gc(mut self, probability: f64) -> Self {
        self.automatic_gc = true;
        self.gc_probability = probability;
        self
    }

    /// Set the garbage collection batch size.
    pub fn with_gc_batch_size(mut self, size: usize) -> Self {
        self.gc_batch_size = size;
        self
    }

    /// Set the pause between garbage collection batches.
    pub fn with_gc_operation_delay(mut self, delay: Duration) -> Self {
        self.gc_operation_delay = delay;
        self
    }

    /// Stale-lock threshold, if the strategy uses locks.
    pub fn lock_max_age(&self) -> Option<Duration> {
        match &self.locking_strategy {
            LockingStrategyKind::Pessimistic(options) => Some(options.lock_max_age),
            _ => None,
        }
    }

    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> SessionResult<()> {
        if self.session_lifetime.is_zero() {
            return Err(SessionError::Config(
                "session_lifetime must be greater than zero".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.gc_probability) {
            return Err(SessionError::Config(format!(
                "gc_probability must be within [0, 1], got {}",
                self.gc_probability
            )));
        }

        if self.gc_batch_size == 0 {
            return Err(SessionError::Config(
                "gc_batch_size must be greater than zero".to_string(),
            ));
        }

        if let LockingStrategyKind::Pessimistic(options) = &self.locking_strategy {
            if options.lock_max_age.is_zero() {
                return Err(SessionError::Config(
                    "lock_max_age must be greater than zero".to_string(),
                ));
            }
            if options.min_retry_interval > options.max_retry_interval {
                return Err(SessionError::Config(
                    "min_retry_interval must not exceed max_retry_interval".to_string(),
                ));
            }
        }

        Ok(())
    }
}
