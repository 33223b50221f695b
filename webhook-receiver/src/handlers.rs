//! Built-in handlers for PayPal checkout events.

use crate::dispatcher::{EventHandler, HandlerRegistry, HandlerResult};
use crate::error::Result;
use crate::types::WebhookEvent;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

pub const PAYMENT_CAPTURE_COMPLETED: &str = "PAYMENT.CAPTURE.COMPLETED";
pub const CHECKOUT_ORDER_APPROVED: &str = "CHECKOUT.ORDER.APPROVED";

/// A completed capture, as extracted from the event resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapturedOrder {
    pub capture_id: String,
    pub payer_email: Option<String>,
    /// Decimal string exactly as sent by the provider.
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub customer_id: i64,
    pub item_title: String,
    pub custom_token: Option<String>,
}

/// Where completed captures go. Errors are retried through redelivery.
#[async_trait]
pub trait OrderSink: Send + Sync {
    async fn record(&self, order: CapturedOrder) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingOrderSink;

#[async_trait]
impl OrderSink for LoggingOrderSink {
    async fn record(&self, order: CapturedOrder) -> Result<()> {
        tracing::info!(
            capture_id = %order.capture_id,
            customer_id = order.customer_id,
            item_title = %order.item_title,
            amount = order.amount.as_deref().unwrap_or(""),
            currency = order.currency.as_deref().unwrap_or(""),
            "Order captured"
        );
        Ok(())
    }
}

/// Split a `"<customer_id>:<item_title>"` custom id. Underscores in the
/// title stand for spaces.
pub fn parse_custom_id(custom_id: &str) -> Option<(i64, String)> {
    let (customer, title) = custom_id.split_once(':')?;
    let customer_id = customer.trim().parse::<i64>().ok()?;
    let title = title.replace('_', " ");
    if title.trim().is_empty() {
        return None;
    }
    Some((customer_id, title))
}

fn non_empty_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// `purchase_units[0]` first, then the resource itself; `custom_id` wins
/// over `reference_id` at each level.
fn find_custom_id(resource: &Value) -> Option<&str> {
    fn lookup(v: &Value) -> Option<&str> {
        non_empty_str(v, "custom_id").or_else(|| non_empty_str(v, "reference_id"))
    }

    resource
        .get("purchase_units")
        .and_then(Value::as_array)
        .and_then(|units| units.first())
        .and_then(lookup)
        .or_else(|| lookup(resource))
}

pub fn parse_capture(resource: &Value) -> std::result::Result<CapturedOrder, String> {
    let capture_id = non_empty_str(resource, "id").ok_or("capture resource has no id")?;
    let custom_id = find_custom_id(resource).ok_or("missing custom_id")?;
    let (customer_id, item_title) =
        parse_custom_id(custom_id).ok_or_else(|| format!("invalid custom_id {custom_id:?}"))?;

    let amount = resource.get("amount");
    let amount_field = |key: &str| amount.and_then(|a| non_empty_str(a, key)).map(str::to_string);

    Ok(CapturedOrder {
        capture_id: capture_id.to_string(),
        payer_email: resource
            .get("payer")
            .and_then(|p| non_empty_str(p, "email_address"))
            .map(str::to_string),
        amount: amount_field("value"),
        currency: amount_field("currency_code"),
        customer_id,
        item_title,
        custom_token: non_empty_str(resource, "custom_token").map(str::to_string),
    })
}

pub struct CaptureCompletedHandler {
    sink: Arc<dyn OrderSink>,
}

impl CaptureCompletedHandler {
    pub fn new(sink: Arc<dyn OrderSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl EventHandler for CaptureCompletedHandler {
    async fn handle(&self, event: &WebhookEvent) -> HandlerResult {
        let order = match parse_capture(&event.resource) {
            Ok(order) => order,
            Err(reason) => {
                tracing::warn!(event_id = %event.event_id, reason = %reason, "Unusable capture resource");
                return HandlerResult::PermanentFailure(reason);
            }
        };

        match self.sink.record(order).await {
            Ok(()) => HandlerResult::Success,
            Err(e) => HandlerResult::recoverable(format!("order sink: {e}")),
        }
    }
}

pub struct OrderApprovedHandler;

#[async_trait]
impl EventHandler for OrderApprovedHandler {
    async fn handle(&self, event: &WebhookEvent) -> HandlerResult {
        tracing::info!(
            event_id = %event.event_id,
            order_id = non_empty_str(&event.resource, "id").unwrap_or(""),
            "Order approved"
        );
        HandlerResult::Success
    }
}

pub fn register_builtin(registry: &mut HandlerRegistry, orders: Arc<dyn OrderSink>) {
    registry
        .register(PAYMENT_CAPTURE_COMPLETED, Arc::new(CaptureCompletedHandler::new(orders)))
        .register(CHECKOUT_ORDER_APPROVED, Arc::new(OrderApprovedHandler));
}
