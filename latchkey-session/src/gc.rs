//! Garbage collection of expired sessions.
//!
//! The backing store has no native TTL, so expired records stay on disk until
//! something deletes them. Reads already treat them as absent; this module
//! physically removes them.

use crate::error::{SessionResult, StoreError};
use crate::traits::{Condition, ExpiredSession, SessionStore, delta};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Expired records returned by the scan
    pub scanned: usize,
    /// Records deleted
    pub deleted: usize,
    /// Records left alone because a live lock is held on them
    pub skipped_locked: usize,
    /// Records rewritten between the scan and the delete
    pub conflicts: usize,
}

/// Scans for expired records and deletes them one page at a time.
pub struct GarbageCollector {
    store: Arc<dyn SessionStore>,
    batch_size: usize,
    operation_delay: Duration,
    lock_max_age: Option<Duration>,
}

impl GarbageCollector {
    /// Create a collector.
    ///
    /// `lock_max_age` is the stale-lock threshold of the active strategy;
    /// without one, any locked record is skipped.
    pub fn new(
        store: Arc<dyn SessionStore>,
        batch_size: usize,
        operation_delay: Duration,
        lock_max_age: Option<Duration>,
    ) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            operation_delay,
            lock_max_age,
        }
    }

    fn is_locked(&self, record: &ExpiredSession, now: chrono::DateTime<Utc>) -> bool {
        match self.lock_max_age {
            Some(max_age) => record.has_fresh_lock(max_age, now),
            None => record.lock.is_some(),
        }
    }

    /// Delete every record that expired more than `max_lifetime` ago.
    ///
    /// The scan is paged by `batch_size`; each page is deleted before the
    /// next one is fetched. Each delete is conditioned on the version seen by
    /// the scan, so a session rewritten in the meantime survives.
    pub async fn collect(&self, max_lifetime: Duration) -> SessionResult<GcReport> {
        let now = Utc::now();
        let cutoff = now - delta(max_lifetime);
        let mut report = GcReport::default();
        let mut cursor: Option<String> = None;
        let mut batches = 0usize;

        loop {
            let page = self
                .store
                .scan_expired(cutoff, cursor.as_deref(), self.batch_size)
                .await?;

            if !page.sessions.is_empty() {
                if batches > 0 && !self.operation_delay.is_zero() {
                    tokio::time::sleep(self.operation_delay).await;
                }
                self.delete_batch(&page.sessions, now, &mut report).await?;
                batches += 1;
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if report.scanned == 0 {
            debug!("Garbage collection found no expired sessions");
        } else {
            info!(
                "Garbage collection deleted {} of {} expired sessions ({} locked, {} conflicts)",
                report.deleted, report.scanned, report.skipped_locked, report.conflicts
            );
        }
        Ok(report)
    }

    async fn delete_batch(
        &self,
        batch: &[ExpiredSession],
        now: chrono::DateTime<Utc>,
        report: &mut GcReport,
    ) -> SessionResult<()> {
        report.scanned += batch.len();

        let deletes = batch.iter().filter_map(|session| {
            if self.is_locked(session, now) {
                return None;
            }
            let condition = Condition::VersionEquals(session.version);
            Some(async move { self.store.delete(&session.id, Some(&condition)).await })
        });
        let results = join_all(deletes).await;
        report.skipped_locked += batch.len() - results.len();

        for result in results {
            match result {
                Ok(()) => report.deleted += 1,
                Err(StoreError::ConditionFailed) => report.conflicts += 1,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Uniform roll in `[0, 1)` for callers deciding whether to run collection.
pub fn roll() -> f64 {
    rand::random::<f64>()
}
