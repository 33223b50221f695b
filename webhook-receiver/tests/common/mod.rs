#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::Router;
use base64::Engine as _;
use payment_webhook_receiver::alerts::{Alert, AlertSink};
use payment_webhook_receiver::certs::{CertificateCache, CertificateFetcher};
use payment_webhook_receiver::dispatcher::{Dispatcher, EventHandler, HandlerRegistry, HandlerResult};
use payment_webhook_receiver::http_server;
use payment_webhook_receiver::store::IdempotencyStore;
use payment_webhook_receiver::types::{
    WebhookEvent, HEADER_AUTH_ALGO, HEADER_CERT_URL, HEADER_TRANSMISSION_ID, HEADER_TRANSMISSION_SIG,
    HEADER_TRANSMISSION_TIME,
};
use payment_webhook_receiver::verification::{
    signature_base, HostAllowlist, PayPalVerifier, VerifierSettings, SUPPORTED_AUTH_ALGO,
};
use payment_webhook_receiver::{IngestionPipeline, PipelineSettings, Result};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::Sha256;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

pub const CERT_PEM: &str = include_str!("../fixtures/provider_cert.pem");
pub const EXPIRED_CERT_PEM: &str = include_str!("../fixtures/expired_cert.pem");
const KEY_PEM: &str = include_str!("../fixtures/provider_key.pem");

pub const WEBHOOK_ID: &str = "1JE4291016473214C";
pub const CERT_URL: &str = "https://api.sandbox.paypal.com/v1/notifications/certs/CERT-360caa42-fca2a594-a5cafa77";
pub const CAPTURE_COMPLETED: &str = "PAYMENT.CAPTURE.COMPLETED";

fn signing_key() -> &'static SigningKey<Sha256> {
    static KEY: OnceLock<SigningKey<Sha256>> = OnceLock::new();
    KEY.get_or_init(|| SigningKey::new(RsaPrivateKey::from_pkcs8_pem(KEY_PEM).unwrap()))
}

pub fn event_body(event_id: &str, event_type: &str) -> Vec<u8> {
    serde_json::json!({
        "id": event_id,
        "event_version": "1.0",
        "create_time": "2024-05-01T10:00:00Z",
        "resource_type": "capture",
        "event_type": event_type,
        "summary": "Payment completed",
        "resource": {
            "id": "CAP-7TK25391AB9938254",
            "amount": { "currency_code": "EUR", "value": "19.90" },
            "custom_id": "123456:Night_Drive"
        }
    })
    .to_string()
    .into_bytes()
}

/// A POST carrying a valid signature over `body`.
pub fn signed_request(path: &str, body: Vec<u8>) -> Request<Body> {
    let transmission_id = uuid::Uuid::new_v4().to_string();
    let transmission_time = chrono::Utc::now().to_rfc3339();
    let base = signature_base(&transmission_id, &transmission_time, WEBHOOK_ID, &body);
    let signature = signing_key().sign(base.as_bytes()).to_vec();

    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header(HEADER_TRANSMISSION_ID, transmission_id)
        .header(HEADER_TRANSMISSION_TIME, transmission_time)
        .header(HEADER_CERT_URL, CERT_URL)
        .header(HEADER_AUTH_ALGO, SUPPORTED_AUTH_ALGO)
        .header(
            HEADER_TRANSMISSION_SIG,
            base64::engine::general_purpose::STANDARD.encode(signature),
        )
        .body(Body::from(body))
        .unwrap()
}

pub enum Served {
    Pem(&'static str),
    Hang,
}

pub struct StubFetcher {
    served: Served,
    pub calls: AtomicUsize,
}

#[async_trait]
impl CertificateFetcher for StubFetcher {
    async fn fetch(&self, _url: &Url) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.served {
            Served::Pem(pem) => Ok(pem.as_bytes().to_vec()),
            Served::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Vec::new())
            }
        }
    }
}

pub struct CountingHandler {
    pub calls: AtomicUsize,
    result: HandlerResult,
    delay: Duration,
}

impl CountingHandler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, _event: &WebhookEvent) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.result.clone()
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    pub alerts: Mutex<Vec<Alert>>,
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn alert(&self, alert: Alert) {
        self.alerts.lock().await.push(alert);
    }
}

pub struct TestApp {
    pub router: Router,
    pub handler: Arc<CountingHandler>,
    pub alerts: Arc<RecordingAlerts>,
    pub fetcher: Arc<StubFetcher>,
}

pub struct TestAppBuilder {
    store: Arc<dyn IdempotencyStore>,
    served: Served,
    result: HandlerResult,
    handler_delay: Duration,
    max_body_bytes: usize,
}

impl TestAppBuilder {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            served: Served::Pem(CERT_PEM),
            result: HandlerResult::Success,
            handler_delay: Duration::from_millis(50),
            max_body_bytes: 1024 * 1024,
        }
    }

    pub fn serving(mut self, served: Served) -> Self {
        self.served = served;
        self
    }

    pub fn handler_result(mut self, result: HandlerResult) -> Self {
        self.result = result;
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn build(self) -> TestApp {
        let fetcher = Arc::new(StubFetcher {
            served: self.served,
            calls: AtomicUsize::new(0),
        });
        let certificates = CertificateCache::new(
            fetcher.clone(),
            Duration::from_secs(3600),
            Duration::from_millis(100),
        );
        let verifier = PayPalVerifier::new(
            VerifierSettings {
                webhook_id: WEBHOOK_ID.to_string(),
                cert_hosts: HostAllowlist::parse(&["api.paypal.com", "api.sandbox.paypal.com"]).unwrap(),
                max_transmission_age: Some(Duration::from_secs(600)),
            },
            certificates,
        );

        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            result: self.result,
            delay: self.handler_delay,
        });
        let mut registry = HandlerRegistry::new();
        registry.register(CAPTURE_COMPLETED, handler.clone());

        let alerts = Arc::new(RecordingAlerts::default());
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::new(verifier),
            self.store,
            Dispatcher::new(registry, Duration::from_secs(5)),
            alerts.clone(),
            PipelineSettings {
                store_timeout: Duration::from_secs(2),
                claim_wait: Duration::from_secs(2),
                claim_poll_interval: Duration::from_millis(10),
            },
        ));

        TestApp {
            router: http_server::router(pipeline, self.max_body_bytes),
            handler,
            alerts,
            fetcher,
        }
    }
}
