use axum::http::StatusCode;

/// Errors raised while ingesting a payment webhook.
///
/// Variants map onto the delivery semantics the provider sees: anything
/// retryable becomes a 5xx so the provider redelivers, everything else is
/// acknowledged or rejected outright.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WebhookError {
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("certificate fetch failed: {0}")]
    CertificateFetchFailed(String),

    #[error("event already processed")]
    DuplicateEvent,

    #[error("event is being processed by a concurrent delivery")]
    ConcurrentDelivery,

    #[error("handler failed (recoverable): {0}")]
    HandlerRecoverable(String),

    #[error("handler failed (permanent): {0}")]
    HandlerPermanent(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, WebhookError>;

impl WebhookError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether redelivering the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CertificateFetchFailed(_)
                | Self::ConcurrentDelivery
                | Self::HandlerRecoverable(_)
                | Self::Store(_)
                | Self::Timeout(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SignatureInvalid(_) | Self::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            Self::DuplicateEvent | Self::HandlerPermanent(_) => StatusCode::OK,
            Self::ConcurrentDelivery => StatusCode::CONFLICT,
            Self::HandlerRecoverable(_) | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::CertificateFetchFailed(_) | Self::Store(_) | Self::Timeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

impl From<rusqlite::Error> for WebhookError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<r2d2::Error> for WebhookError {
    fn from(err: r2d2::Error) -> Self {
        Self::Store(format!("connection pool: {err}"))
    }
}
