use crate::error::{Result, WebhookError};
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const HEADER_TRANSMISSION_ID: &str = "paypal-transmission-id";
pub const HEADER_TRANSMISSION_TIME: &str = "paypal-transmission-time";
pub const HEADER_CERT_URL: &str = "paypal-cert-url";
pub const HEADER_AUTH_ALGO: &str = "paypal-auth-algo";
pub const HEADER_TRANSMISSION_SIG: &str = "paypal-transmission-sig";

const SIGNATURE_HEADERS: [&str; 5] = [
    HEADER_TRANSMISSION_ID,
    HEADER_TRANSMISSION_TIME,
    HEADER_CERT_URL,
    HEADER_AUTH_ALGO,
    HEADER_TRANSMISSION_SIG,
];

/// Provider signature headers, keyed by lowercase header name.
pub type SignatureHeaderMap = BTreeMap<String, String>;

/// Collect the provider signature headers from a request.
/// Names are lowercased; values that are not visible ASCII are skipped.
pub fn signature_headers_from(headers: &HeaderMap) -> SignatureHeaderMap {
    SIGNATURE_HEADERS
        .iter()
        .filter_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|v| (name.to_string(), v.trim().to_string()))
        })
        .collect()
}

/// The five headers that make up a transmission signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    pub transmission_id: String,
    pub transmission_time: String,
    pub cert_url: String,
    pub auth_algo: String,
    pub transmission_sig: String,
}

impl SignatureHeaders {
    /// Extract the signature headers. Lookups are case-insensitive and a
    /// missing or blank header is an error.
    pub fn from_map(headers: &SignatureHeaderMap) -> Result<Self> {
        let get = |name: &str| -> Result<String> {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| WebhookError::SignatureInvalid(format!("missing header {name}")))
        };

        Ok(Self {
            transmission_id: get(HEADER_TRANSMISSION_ID)?,
            transmission_time: get(HEADER_TRANSMISSION_TIME)?,
            cert_url: get(HEADER_CERT_URL)?,
            auth_algo: get(HEADER_AUTH_ALGO)?,
            transmission_sig: get(HEADER_TRANSMISSION_SIG)?,
        })
    }
}

/// Envelope fields of a provider event. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
struct EventEnvelope {
    id: String,
    event_type: String,
    #[serde(default)]
    resource: serde_json::Value,
    #[serde(default)]
    resource_type: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    create_time: Option<String>,
}

/// A verified webhook event. Only built after the signature over
/// `raw_body` has been checked.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub resource: serde_json::Value,
    pub resource_type: Option<String>,
    pub summary: Option<String>,
    pub create_time: Option<String>,
    pub received_at: DateTime<Utc>,
    pub raw_body: Vec<u8>,
    pub signature_headers: SignatureHeaderMap,
}

impl WebhookEvent {
    pub fn parse(
        raw_body: Vec<u8>,
        signature_headers: SignatureHeaderMap,
        received_at: DateTime<Utc>,
    ) -> Result<Self> {
        let envelope: EventEnvelope = serde_json::from_slice(&raw_body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        if envelope.id.trim().is_empty() {
            return Err(WebhookError::MalformedPayload("empty event id".into()));
        }
        if envelope.event_type.trim().is_empty() {
            return Err(WebhookError::MalformedPayload("empty event_type".into()));
        }

        Ok(Self {
            event_id: envelope.id,
            event_type: envelope.event_type,
            resource: envelope.resource,
            resource_type: envelope.resource_type,
            summary: envelope.summary,
            create_time: envelope.create_time,
            received_at,
            raw_body,
            signature_headers,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Invalid,
    TransientFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    pub reason: Option<String>,
}

impl VerificationResult {
    pub fn verified() -> Self {
        Self {
            status: VerificationStatus::Verified,
            reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            status: VerificationStatus::Invalid,
            reason: Some(reason.into()),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            status: VerificationStatus::TransientFailure,
            reason: Some(reason.into()),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::Verified
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub event_id: String,
    pub event_type: String,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_status: ProcessingStatus,
    /// Number of times a handler was admitted for this event.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// A failed record that must never be claimed again.
    pub dead_lettered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    fn full_headers() -> SignatureHeaderMap {
        [
            (HEADER_TRANSMISSION_ID, "tx-1"),
            (HEADER_TRANSMISSION_TIME, "2024-01-01T00:00:00Z"),
            (HEADER_CERT_URL, "https://api.paypal.com/cert.pem"),
            (HEADER_AUTH_ALGO, "SHA256withRSA"),
            (HEADER_TRANSMISSION_SIG, "c2ln"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_signature_headers_from_request() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_bytes(b"PayPal-Transmission-Id").unwrap(),
            HeaderValue::from_static("tx-1"),
        );
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let map = signature_headers_from(&headers);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(HEADER_TRANSMISSION_ID).map(String::as_str), Some("tx-1"));
    }

    #[test]
    fn test_signature_headers_case_insensitive() {
        let map: SignatureHeaderMap = full_headers()
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        let parsed = SignatureHeaders::from_map(&map).unwrap();
        assert_eq!(parsed.transmission_id, "tx-1");
        assert_eq!(parsed.auth_algo, "SHA256withRSA");
    }

    #[test]
    fn test_signature_headers_missing_or_blank() {
        let mut map = full_headers();
        map.remove(HEADER_CERT_URL);
        assert!(matches!(
            SignatureHeaders::from_map(&map),
            Err(WebhookError::SignatureInvalid(_))
        ));

        let mut map = full_headers();
        map.insert(HEADER_TRANSMISSION_SIG.to_string(), "   ".to_string());
        assert!(SignatureHeaders::from_map(&map).is_err());
    }

    #[test]
    fn test_parse_event_keeps_raw_body() {
        let body = br#"{"id":"WH-1","event_type":"PAYMENT.CAPTURE.COMPLETED","resource":{"id":"CAP-1"},"summary":"done"}"#;
        let event = WebhookEvent::parse(body.to_vec(), full_headers(), Utc::now()).unwrap();
        assert_eq!(event.event_id, "WH-1");
        assert_eq!(event.event_type, "PAYMENT.CAPTURE.COMPLETED");
        assert_eq!(event.resource["id"], "CAP-1");
        assert_eq!(event.summary.as_deref(), Some("done"));
        assert_eq!(event.raw_body, body.to_vec());
    }

    #[test]
    fn test_parse_event_rejects_malformed() {
        for body in [
            &b"not json"[..],
            br#"{"event_type":"X"}"#,
            br#"{"id":"","event_type":"X"}"#,
            br#"{"id":"WH-1","event_type":" "}"#,
        ] {
            let result = WebhookEvent::parse(body.to_vec(), full_headers(), Utc::now());
            assert!(
                matches!(result, Err(WebhookError::MalformedPayload(_))),
                "{}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn test_processing_status_round_trip() {
        for status in [
            ProcessingStatus::Pending,
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
        ] {
            assert_eq!(ProcessingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ProcessingStatus::parse("done"), None);
    }
}
