use crate::certs::CertificateCache;
use crate::error::{Result, WebhookError};
use crate::types::{SignatureHeaderMap, SignatureHeaders, VerificationResult};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use std::time::Duration;
use url::Url;

/// The only auth algorithm the provider signs transmissions with.
pub const SUPPORTED_AUTH_ALGO: &str = "SHA256withRSA";

/// Verifies that a delivery was sent by the payment provider.
#[async_trait]
pub trait WebhookVerifier: Send + Sync {
    /// `raw_body` must be the exact bytes received.
    async fn verify(&self, raw_body: &[u8], headers: &SignatureHeaderMap) -> VerificationResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Exact(String),
    /// Stored with its leading dot, e.g. `.paypal.com`.
    Subdomain(String),
}

/// Hosts allowed to serve signing certificates.
///
/// Entries are exact hosts (`api.paypal.com`) or wildcard subdomains
/// (`*.paypal.com`, which does not match `paypal.com` itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAllowlist {
    patterns: Vec<HostPattern>,
}

impl HostAllowlist {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut patterns = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim().to_ascii_lowercase();
            if entry.is_empty() {
                continue;
            }
            let pattern = match entry.strip_prefix("*.") {
                Some(rest) if is_host_like(rest) => HostPattern::Subdomain(format!(".{rest}")),
                None if is_host_like(&entry) => HostPattern::Exact(entry),
                _ => {
                    return Err(WebhookError::config(format!(
                        "invalid certificate host pattern: {entry}"
                    )))
                }
            };
            patterns.push(pattern);
        }

        if patterns.is_empty() {
            return Err(WebhookError::config("certificate host allow-list is empty"));
        }
        Ok(Self { patterns })
    }

    pub fn allows(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.patterns.iter().any(|pattern| match pattern {
            HostPattern::Exact(exact) => host == *exact,
            HostPattern::Subdomain(suffix) => host.len() > suffix.len() && host.ends_with(suffix.as_str()),
        })
    }

    /// Parse a certificate URL and require https on an allowed host.
    pub fn check_url(&self, raw: &str) -> std::result::Result<Url, String> {
        let url = Url::parse(raw).map_err(|e| format!("unparseable certificate url: {e}"))?;
        if url.scheme() != "https" {
            return Err(format!("certificate url must use https, got {}", url.scheme()));
        }
        let host = url.host_str().ok_or("certificate url has no host")?;
        if !self.allows(host) {
            return Err(format!("certificate host {host} is not allow-listed"));
        }
        Ok(url)
    }
}

fn is_host_like(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && !s.ends_with('.')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// The string the provider signs: `id|time|webhook id|crc32(body)`.
pub fn signature_base(
    transmission_id: &str,
    transmission_time: &str,
    webhook_id: &str,
    raw_body: &[u8],
) -> String {
    format!(
        "{transmission_id}|{transmission_time}|{webhook_id}|{}",
        crc32fast::hash(raw_body)
    )
}

#[derive(Debug, Clone)]
pub struct VerifierSettings {
    /// Webhook identifier assigned by the provider; part of the signed string.
    pub webhook_id: String,
    pub cert_hosts: HostAllowlist,
    /// Reject transmissions older (or further in the future) than this.
    pub max_transmission_age: Option<Duration>,
}

/// Verifies PayPal transmission signatures against the provider certificate.
pub struct PayPalVerifier {
    settings: VerifierSettings,
    certificates: CertificateCache,
}

impl PayPalVerifier {
    pub fn new(settings: VerifierSettings, certificates: CertificateCache) -> Self {
        Self {
            settings,
            certificates,
        }
    }

    pub fn certificates(&self) -> &CertificateCache {
        &self.certificates
    }

    fn check_transmission_time(
        &self,
        transmission_time: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), String> {
        let Some(max_age) = self.settings.max_transmission_age else {
            return Ok(());
        };
        let sent = DateTime::parse_from_rfc3339(transmission_time)
            .map_err(|e| format!("unparseable transmission time: {e}"))?
            .with_timezone(&Utc);
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Ok(());
        };
        if now - sent > max_age || sent - now > max_age {
            return Err(format!("transmission time {transmission_time} outside allowed window"));
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookVerifier for PayPalVerifier {
    async fn verify(&self, raw_body: &[u8], headers: &SignatureHeaderMap) -> VerificationResult {
        let headers = match SignatureHeaders::from_map(headers) {
            Ok(h) => h,
            Err(e) => return VerificationResult::invalid(e.to_string()),
        };

        if !headers.auth_algo.eq_ignore_ascii_case(SUPPORTED_AUTH_ALGO) {
            return VerificationResult::invalid(format!(
                "unsupported auth algorithm {}",
                headers.auth_algo
            ));
        }

        if let Err(reason) = self.check_transmission_time(&headers.transmission_time, Utc::now()) {
            return VerificationResult::invalid(reason);
        }

        // Checked before any network access so an attacker-hosted
        // certificate is never fetched.
        let cert_url = match self.settings.cert_hosts.check_url(&headers.cert_url) {
            Ok(url) => url,
            Err(reason) => return VerificationResult::invalid(reason),
        };

        let signature = match base64::engine::general_purpose::STANDARD.decode(&headers.transmission_sig) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            _ => return VerificationResult::invalid("signature is not valid base64"),
        };

        let certificate = match self.certificates.get(&cert_url).await {
            Ok(cert) => cert,
            Err(e) if e.is_retryable() => return VerificationResult::transient(e.to_string()),
            Err(e) => return VerificationResult::invalid(e.to_string()),
        };

        if !certificate.is_valid_at(Utc::now()) {
            return VerificationResult::invalid(format!(
                "certificate outside validity period ({} .. {})",
                certificate.not_before, certificate.not_after
            ));
        }

        let base = signature_base(
            &headers.transmission_id,
            &headers.transmission_time,
            &self.settings.webhook_id,
            raw_body,
        );
        if certificate.verify(base.as_bytes(), &signature) {
            VerificationResult::verified()
        } else {
            VerificationResult::invalid("signature mismatch")
        }
    }
}
