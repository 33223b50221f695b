use crate::pipeline::IngestionPipeline;
use crate::types::signature_headers_from;
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Build the HTTP surface around an ingestion pipeline.
pub fn router(pipeline: Arc<IngestionPipeline>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/webhook/paypal", post(handle_webhook))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(pipeline)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            let request_id = request
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            tracing::info_span!(
                "http_request",
                request_id = %request_id,
                method = %request.method(),
                path = %request.uri().path(),
            )
        }))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Serve until the process receives Ctrl-C.
pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await
}

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
}

async fn handle_webhook(
    State(pipeline): State<Arc<IngestionPipeline>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let outcome = pipeline.ingest(body.to_vec(), signature_headers_from(&headers)).await;

    let mut response = (
        outcome.status_code(),
        Json(StatusBody {
            status: outcome.label(),
        }),
    )
        .into_response();
    if let Some(secs) = outcome.retry_after() {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Serialize)]
struct ComponentHealth {
    name: &'static str,
    status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: HealthStatus,
    checks: Vec<ComponentHealth>,
}

impl IntoResponse for HealthResponse {
    fn into_response(self) -> Response {
        let status_code = match self.status {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status_code, Json(self)).into_response()
    }
}

async fn handle_health(State(pipeline): State<Arc<IngestionPipeline>>) -> HealthResponse {
    let store = match pipeline.check_store().await {
        Ok(()) => ComponentHealth {
            name: "idempotency_store",
            status: HealthStatus::Healthy,
            message: None,
        },
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            ComponentHealth {
                name: "idempotency_store",
                status: HealthStatus::Unhealthy,
                message: Some("store unreachable".to_string()),
            }
        }
    };

    HealthResponse {
        status: store.status,
        checks: vec![store],
    }
}
