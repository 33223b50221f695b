//! Routes verified events to the handler registered for their type.

use crate::types::WebhookEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerResult {
    Success,
    /// Redelivery may succeed; the record is reopened for another claim.
    RecoverableFailure(String),
    /// Redelivery cannot succeed; the event is dead-lettered and escalated.
    PermanentFailure(String),
}

impl HandlerResult {
    pub fn recoverable(reason: impl Into<String>) -> Self {
        Self::RecoverableFailure(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentFailure(reason.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Handled(HandlerResult),
    /// No handler is registered for the event type.
    Ignored,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &WebhookEvent) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(WebhookEvent) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, event: &WebhookEvent) -> HandlerResult {
        (self.0)(event.clone()).await
    }
}

/// Event type → handler table, built once at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for an exact event type. A later registration for
    /// the same type replaces the earlier one.
    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> &mut Self {
        let event_type = event_type.into();
        if self.handlers.insert(event_type.clone(), handler).is_some() {
            tracing::warn!(event_type = %event_type, "Replaced existing handler");
        }
        self
    }

    /// Register an async closure. The closure receives its own copy of the event.
    ///
    /// ```rust,ignore
    /// registry.register_fn("CHECKOUT.ORDER.APPROVED", |event| async move {
    ///     tracing::info!(event_id = %event.event_id, "approved");
    ///     HandlerResult::Success
    /// });
    /// ```
    pub fn register_fn<F, Fut>(&mut self, event_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(WebhookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(event_type, Arc::new(FnHandler(f)))
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub fn registered_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// Read-only view over a [`HandlerRegistry`] that bounds each invocation.
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    handler_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry, handler_timeout: Duration) -> Self {
        tracing::debug!(types = ?registry.registered_types(), "Dispatcher ready");
        Self {
            handlers: registry.handlers,
            handler_timeout,
        }
    }

    pub async fn dispatch(&self, event: &WebhookEvent) -> Outcome {
        let Some(handler) = self.handlers.get(&event.event_type) else {
            tracing::info!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "No handler registered, ignoring event"
            );
            return Outcome::Ignored;
        };

        match tokio::time::timeout(self.handler_timeout, handler.handle(event)).await {
            Ok(result) => Outcome::Handled(result),
            Err(_) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    timeout_ms = self.handler_timeout.as_millis() as u64,
                    "Handler timed out"
                );
                Outcome::Handled(HandlerResult::recoverable("handler timed out"))
            }
        }
    }
}
