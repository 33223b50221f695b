//! PayPal webhook ingestion: signature verification, exactly-once
//! admission through an idempotency store, and dispatch to typed handlers.

pub mod alerts;
pub mod certs;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod http_server;
pub mod pipeline;
pub mod store;
pub mod types;
pub mod verification;

pub use error::{Result, WebhookError};
pub use pipeline::{IngestionPipeline, PipelineOutcome, PipelineSettings};
