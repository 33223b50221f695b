use anyhow::Context;
use clap::Parser;
use payment_webhook_receiver::alerts::{AlertSink, HttpAlertSink, TracingAlertSink};
use payment_webhook_receiver::certs::{CertificateCache, HttpCertificateFetcher};
use payment_webhook_receiver::config::Config;
use payment_webhook_receiver::dispatcher::{Dispatcher, HandlerRegistry};
use payment_webhook_receiver::handlers::{register_builtin, LoggingOrderSink};
use payment_webhook_receiver::http_server;
use payment_webhook_receiver::store::{
    spawn_retention_task, IdempotencyStore, MemoryIdempotencyStore, SqliteIdempotencyStore,
};
use payment_webhook_receiver::verification::PayPalVerifier;
use payment_webhook_receiver::IngestionPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ALERT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "payment_webhook_receiver=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    config.validate()?;

    let store: Arc<dyn IdempotencyStore> = match &config.database_path {
        Some(path) => Arc::new(
            SqliteIdempotencyStore::open(path, config.database_pool_size, config.store_settings())
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => {
            tracing::warn!("DATABASE_PATH not set, idempotency records will not survive a restart");
            Arc::new(MemoryIdempotencyStore::new(config.store_settings()))
        }
    };

    let fetcher = Arc::new(HttpCertificateFetcher::new(config.cert_fetch_timeout())?);
    let certificates = CertificateCache::new(fetcher, config.cert_cache_ttl(), config.cert_fetch_timeout());
    let verifier = Arc::new(PayPalVerifier::new(config.verifier_settings()?, certificates));

    let mut registry = HandlerRegistry::new();
    register_builtin(&mut registry, Arc::new(LoggingOrderSink));
    let dispatcher = Dispatcher::new(registry, config.handler_timeout());

    let alerts: Arc<dyn AlertSink> = match &config.alert_url {
        Some(url) => Arc::new(HttpAlertSink::new(url.clone(), config.internal_token.clone(), ALERT_TIMEOUT)?),
        None => Arc::new(TracingAlertSink),
    };

    let pipeline = Arc::new(IngestionPipeline::new(
        verifier,
        store.clone(),
        dispatcher,
        alerts,
        config.pipeline_settings(),
    ));

    let retention = spawn_retention_task(store, config.retention(), config.purge_interval());

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(
        addr = %addr,
        paypal_env = ?config.paypal_env,
        persistent = config.database_path.is_some(),
        "Webhook receiver listening"
    );

    http_server::serve(listener, http_server::router(pipeline, config.max_body_bytes)).await?;

    retention.abort();
    Ok(())
}
