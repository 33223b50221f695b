use super::{ClaimOutcome, FailureDisposition, IdempotencyStore, StoreSettings};
use crate::error::Result;
use crate::types::{IdempotencyRecord, ProcessingStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// In-process idempotency store.
///
/// Records live as long as the process does, so a restart forgets which
/// events were applied. Use the SQLite store when that matters.
pub struct MemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
    settings: StoreSettings,
}

impl MemoryIdempotencyStore {
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            settings,
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    fn is_stale(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.settings.claim_timeout) {
            Ok(timeout) => now - record.updated_at > timeout,
            Err(_) => false,
        }
    }
}

/// The record if it is still Pending under the claim that produced `attempt`.
fn owned<'a>(
    records: &'a mut HashMap<String, IdempotencyRecord>,
    event_id: &str,
    attempt: u32,
) -> Option<&'a mut IdempotencyRecord> {
    records
        .get_mut(event_id)
        .filter(|r| r.processing_status == ProcessingStatus::Pending && r.attempts == attempt)
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(StoreSettings::default())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn claim(&self, event_id: &str, event_type: &str) -> Result<ClaimOutcome> {
        let now = Utc::now();
        let mut records = self.records.lock().await;

        let Some(record) = records.get_mut(event_id) else {
            records.insert(
                event_id.to_string(),
                IdempotencyRecord {
                    event_id: event_id.to_string(),
                    event_type: event_type.to_string(),
                    first_seen_at: now,
                    updated_at: now,
                    processing_status: ProcessingStatus::Pending,
                    attempts: 1,
                    last_error: None,
                    dead_lettered: false,
                },
            );
            return Ok(ClaimOutcome::Claimed { attempt: 1 });
        };

        let reclaimable = match record.processing_status {
            ProcessingStatus::Completed => return Ok(ClaimOutcome::AlreadyCompleted),
            ProcessingStatus::Failed if record.dead_lettered => return Ok(ClaimOutcome::DeadLettered),
            ProcessingStatus::Failed => true,
            ProcessingStatus::Pending => {
                let stale = self.is_stale(record, now);
                if stale {
                    tracing::warn!(
                        event_id,
                        attempts = record.attempts,
                        "Reclaiming abandoned pending event"
                    );
                }
                stale
            }
        };

        if !reclaimable {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        record.processing_status = ProcessingStatus::Pending;
        record.attempts += 1;
        record.updated_at = now;
        Ok(ClaimOutcome::Claimed {
            attempt: record.attempts,
        })
    }

    async fn complete(&self, event_id: &str, attempt: u32) -> Result<()> {
        let mut records = self.records.lock().await;
        let Some(record) = owned(&mut records, event_id, attempt) else {
            tracing::warn!(event_id, attempt, "complete() from a caller that no longer owns the claim");
            return Ok(());
        };

        record.processing_status = ProcessingStatus::Completed;
        record.last_error = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(&self, event_id: &str, attempt: u32, reason: &str) -> Result<FailureDisposition> {
        let mut records = self.records.lock().await;
        let Some(record) = owned(&mut records, event_id, attempt) else {
            tracing::warn!(event_id, attempt, "fail() from a caller that no longer owns the claim");
            return Ok(FailureDisposition::Retry);
        };

        record.processing_status = ProcessingStatus::Failed;
        record.last_error = Some(reason.to_string());
        record.updated_at = Utc::now();
        if record.attempts >= self.settings.max_attempts {
            record.dead_lettered = true;
            return Ok(FailureDisposition::DeadLettered);
        }
        Ok(FailureDisposition::Retry)
    }

    async fn dead_letter(&self, event_id: &str, attempt: u32, reason: &str) -> Result<bool> {
        let mut records = self.records.lock().await;
        let Some(record) = owned(&mut records, event_id, attempt) else {
            tracing::warn!(event_id, attempt, "dead_letter() from a caller that no longer owns the claim");
            return Ok(false);
        };

        record.processing_status = ProcessingStatus::Failed;
        record.dead_lettered = true;
        record.last_error = Some(reason.to_string());
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn get(&self, event_id: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self.records.lock().await.get(event_id).cloned())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| {
            r.processing_status == ProcessingStatus::Pending || r.first_seen_at >= cutoff
        });
        Ok(before - records.len())
    }
}
