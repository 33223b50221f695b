//! Idempotency records for received events.
//!
//! `claim` is the only admission gate for handler execution: for a given
//! event id at most one record is Pending at any time. Failed records may be
//! claimed again until they reach `max_attempts`, at which point they are
//! dead-lettered and never admitted again.

mod memory;
mod sqlite;

pub use memory::MemoryIdempotencyStore;
pub use sqlite::SqliteIdempotencyStore;

use crate::error::Result;
use crate::types::IdempotencyRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller holds the Pending record and may run the handler.
    /// `attempt` starts at 1.
    Claimed { attempt: u32 },
    AlreadyClaimed,
    AlreadyCompleted,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The record can be claimed again on redelivery.
    Retry,
    /// The attempt ceiling was reached; the record is closed for good.
    DeadLettered,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    /// Handler admissions allowed per event before it is dead-lettered.
    pub max_attempts: u32,
    /// A Pending record older than this is treated as abandoned and may be
    /// claimed again.
    pub claim_timeout: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            claim_timeout: Duration::from_secs(300),
        }
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically admit `event_id` for processing.
    async fn claim(&self, event_id: &str, event_type: &str) -> Result<ClaimOutcome>;

    /// Pending → Completed. `attempt` is the value returned by the claim
    /// that admitted the caller; a transition from an owner whose claim was
    /// since taken over (or that never held one) is a logged no-op.
    async fn complete(&self, event_id: &str, attempt: u32) -> Result<()>;

    /// Pending → Failed. Returns `Retry` as well when nothing was closed.
    async fn fail(&self, event_id: &str, attempt: u32, reason: &str) -> Result<FailureDisposition>;

    /// Pending → Failed and never claimable again. Returns whether the
    /// record was closed by this call.
    async fn dead_letter(&self, event_id: &str, attempt: u32, reason: &str) -> Result<bool>;

    async fn get(&self, event_id: &str) -> Result<Option<IdempotencyRecord>>;

    /// Delete non-Pending records first seen before `cutoff`.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Periodically purge records that fell out of the retention window.
pub fn spawn_retention_task(
    store: Arc<dyn IdempotencyStore>,
    retention: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(30));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - retention;
            match store.purge_older_than(cutoff).await {
                Ok(0) => tracing::debug!(%cutoff, "Retention purge found nothing to delete"),
                Ok(purged) => tracing::info!(purged, %cutoff, "Purged expired idempotency records"),
                Err(e) => tracing::warn!(error = %e, "Retention purge failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProcessingStatus;

    #[tokio::test]
    async fn test_retention_task_purges_old_records() {
        let store = Arc::new(MemoryIdempotencyStore::new(StoreSettings::default()));
        store.claim("EVT-old", "PAYMENT.CAPTURE.COMPLETED").await.unwrap();
        store.complete("EVT-old", 1).await.unwrap();

        let handle = spawn_retention_task(store.clone(), Duration::ZERO, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert!(store.get("EVT-old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retention_task_keeps_pending_records() {
        let store = Arc::new(MemoryIdempotencyStore::new(StoreSettings::default()));
        store.claim("EVT-busy", "PAYMENT.CAPTURE.COMPLETED").await.unwrap();

        let handle = spawn_retention_task(store.clone(), Duration::ZERO, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        let record = store.get("EVT-busy").await.unwrap().unwrap();
        assert_eq!(record.processing_status, ProcessingStatus::Pending);
    }
}
