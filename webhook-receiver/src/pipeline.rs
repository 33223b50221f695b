//! Per-request state machine: verify, parse, claim, dispatch, commit.

use crate::alerts::{Alert, AlertKind, AlertSink};
use crate::dispatcher::{Dispatcher, HandlerResult, Outcome};
use crate::error::{Result, WebhookError};
use crate::store::{ClaimOutcome, FailureDisposition, IdempotencyStore};
use crate::types::{SignatureHeaderMap, VerificationStatus, WebhookEvent};
use crate::verification::WebhookVerifier;
use axum::http::StatusCode;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

/// Seconds a client is asked to wait before redelivering an in-flight event.
pub const RETRY_AFTER_SECS: u64 = 5;

/// Terminal state of one delivery.
///
/// Every outcome other than a successful or ignored run carries the error
/// that explains it, and the HTTP status follows from that error.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    /// The handler ran and succeeded.
    Completed,
    /// No handler is registered for the event type.
    Ignored,
    /// Acknowledged so the provider stops: `DuplicateEvent` for a replay of
    /// an applied event, `HandlerPermanent` once the event is dead-lettered.
    Acknowledged(WebhookError),
    /// Bad signature or unusable payload.
    Rejected(WebhookError),
    /// Redelivery may succeed: handler failure, store trouble, a transient
    /// verification failure, or `ConcurrentDelivery` while another delivery
    /// holds the claim.
    RetryLater(WebhookError),
}

impl PipelineOutcome {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Completed | Self::Ignored => StatusCode::OK,
            Self::Acknowledged(err) | Self::Rejected(err) | Self::RetryLater(err) => err.status_code(),
        }
    }

    /// Short label returned to the caller. Carries no internal detail.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Ignored => "ignored",
            Self::Acknowledged(WebhookError::DuplicateEvent) => "duplicate",
            Self::Acknowledged(_) => "failed",
            Self::Rejected(_) => "rejected",
            Self::RetryLater(WebhookError::ConcurrentDelivery) => "in_progress",
            Self::RetryLater(_) => "retry",
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        matches!(self, Self::RetryLater(WebhookError::ConcurrentDelivery)).then_some(RETRY_AFTER_SECS)
    }

    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, Self::Acknowledged(WebhookError::HandlerPermanent(_)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Upper bound for each store call.
    pub store_timeout: Duration,
    /// How long a duplicate delivery waits for an in-flight one before
    /// answering 409.
    pub claim_wait: Duration,
    pub claim_poll_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(2),
            claim_wait: Duration::from_millis(500),
            claim_poll_interval: Duration::from_millis(25),
        }
    }
}

pub struct IngestionPipeline {
    verifier: Arc<dyn WebhookVerifier>,
    store: Arc<dyn IdempotencyStore>,
    dispatcher: Dispatcher,
    alerts: Arc<dyn AlertSink>,
    settings: PipelineSettings,
}

impl IngestionPipeline {
    pub fn new(
        verifier: Arc<dyn WebhookVerifier>,
        store: Arc<dyn IdempotencyStore>,
        dispatcher: Dispatcher,
        alerts: Arc<dyn AlertSink>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            verifier,
            store,
            dispatcher,
            alerts,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    /// Store reachability, bounded by the store timeout.
    pub async fn check_store(&self) -> Result<()> {
        self.bounded("ping", self.store.ping()).await
    }

    pub async fn ingest(&self, raw_body: Vec<u8>, headers: SignatureHeaderMap) -> PipelineOutcome {
        let received_at = Utc::now();

        let verification = self.verifier.verify(&raw_body, &headers).await;
        match verification.status {
            VerificationStatus::Verified => {}
            VerificationStatus::Invalid => {
                let reason = verification.reason.unwrap_or_default();
                tracing::warn!(security = true, reason = %reason, "Rejected webhook with invalid signature");
                return PipelineOutcome::Rejected(WebhookError::SignatureInvalid(reason));
            }
            VerificationStatus::TransientFailure => {
                let reason = verification.reason.unwrap_or_default();
                tracing::warn!(reason = %reason, "Signature verification could not complete");
                return PipelineOutcome::RetryLater(WebhookError::CertificateFetchFailed(reason));
            }
        }

        let event = match WebhookEvent::parse(raw_body, headers, received_at) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Verified webhook has an unusable payload");
                return PipelineOutcome::Rejected(e);
            }
        };

        let span = tracing::info_span!(
            "webhook_event",
            event_id = %event.event_id,
            event_type = %event.event_type
        );
        self.process(event).instrument(span).await
    }

    async fn process(&self, event: WebhookEvent) -> PipelineOutcome {
        let attempt = match self.claim(&event).await {
            Ok(ClaimOutcome::Claimed { attempt }) => attempt,
            Ok(ClaimOutcome::AlreadyCompleted) => {
                tracing::info!(event_id = %event.event_id, "Duplicate delivery of completed event");
                return PipelineOutcome::Acknowledged(WebhookError::DuplicateEvent);
            }
            Ok(ClaimOutcome::DeadLettered) => {
                tracing::info!(event_id = %event.event_id, "Delivery of dead-lettered event acknowledged");
                return PipelineOutcome::Acknowledged(WebhookError::HandlerPermanent(
                    "event is dead-lettered".into(),
                ));
            }
            Ok(ClaimOutcome::AlreadyClaimed) => {
                tracing::info!(event_id = %event.event_id, "Event is being processed by another delivery");
                return PipelineOutcome::RetryLater(WebhookError::ConcurrentDelivery);
            }
            Err(e) => {
                tracing::error!(event_id = %event.event_id, error = %e, "Failed to claim event");
                return PipelineOutcome::RetryLater(e);
            }
        };

        tracing::info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            attempt,
            "Processing webhook event"
        );

        match self.dispatcher.dispatch(&event).await {
            Outcome::Ignored => {
                self.commit_complete(&event, attempt).await;
                PipelineOutcome::Ignored
            }
            Outcome::Handled(HandlerResult::Success) => {
                self.commit_complete(&event, attempt).await;
                PipelineOutcome::Completed
            }
            Outcome::Handled(HandlerResult::RecoverableFailure(reason)) => {
                self.commit_recoverable(&event, attempt, reason).await
            }
            Outcome::Handled(HandlerResult::PermanentFailure(reason)) => {
                self.commit_permanent(&event, attempt, reason).await
            }
        }
    }

    /// Claim the event, waiting up to `claim_wait` for a concurrent delivery
    /// of the same event to finish.
    async fn claim(&self, event: &WebhookEvent) -> Result<ClaimOutcome> {
        let deadline = Instant::now() + self.settings.claim_wait;
        loop {
            let outcome = self
                .bounded("claim", self.store.claim(&event.event_id, &event.event_type))
                .await?;
            let now = Instant::now();
            if outcome != ClaimOutcome::AlreadyClaimed || now >= deadline {
                return Ok(outcome);
            }
            tokio::time::sleep(self.settings.claim_poll_interval.min(deadline - now)).await;
        }
    }

    async fn commit_complete(&self, event: &WebhookEvent, attempt: u32) {
        if let Err(e) = self
            .bounded("complete", self.store.complete(&event.event_id, attempt))
            .await
        {
            // The handler already ran; the record stays Pending until the
            // claim timeout reopens it.
            tracing::error!(event_id = %event.event_id, error = %e, "Failed to mark event completed");
        }
    }

    async fn commit_recoverable(&self, event: &WebhookEvent, attempt: u32, reason: String) -> PipelineOutcome {
        tracing::warn!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            attempt,
            reason = %reason,
            "Handler failed, provider will redeliver"
        );

        match self
            .bounded("fail", self.store.fail(&event.event_id, attempt, &reason))
            .await
        {
            Ok(FailureDisposition::Retry) => {}
            Ok(FailureDisposition::DeadLettered) => {
                self.escalate(event, reason.clone(), AlertKind::DeadLettered).await;
                return PipelineOutcome::Acknowledged(WebhookError::HandlerPermanent(reason));
            }
            Err(e) => {
                tracing::error!(event_id = %event.event_id, error = %e, "Failed to record handler failure");
            }
        }
        PipelineOutcome::RetryLater(WebhookError::HandlerRecoverable(reason))
    }

    /// Dead-letter the event and alert. The alert is sent only by the
    /// delivery whose transition actually closed the record.
    async fn commit_permanent(&self, event: &WebhookEvent, attempt: u32, reason: String) -> PipelineOutcome {
        match self
            .bounded("dead_letter", self.store.dead_letter(&event.event_id, attempt, &reason))
            .await
        {
            Ok(true) => {
                self.escalate(event, reason.clone(), AlertKind::PermanentFailure).await;
            }
            Ok(false) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    attempt,
                    reason = %reason,
                    "Claim was taken over before dead-lettering, alert left to the current owner"
                );
            }
            Err(e) => {
                // Still Pending: the delivery that reclaims it dead-letters and alerts.
                tracing::error!(
                    event_id = %event.event_id,
                    error = %e,
                    reason = %reason,
                    "Failed to dead-letter event, alert deferred until it is closed"
                );
                return PipelineOutcome::RetryLater(e);
            }
        }
        PipelineOutcome::Acknowledged(WebhookError::HandlerPermanent(reason))
    }

    async fn escalate(&self, event: &WebhookEvent, reason: String, kind: AlertKind) {
        tracing::error!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            kind = ?kind,
            reason = %reason,
            "Event dead-lettered"
        );
        self.alerts
            .alert(Alert {
                event_id: event.event_id.clone(),
                event_type: event.event_type.clone(),
                reason,
                kind,
            })
            .await;
    }

    async fn bounded<T>(&self, op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.settings.store_timeout, fut)
            .await
            .map_err(|_| WebhookError::Timeout(format!("store {op}")))?
    }
}
