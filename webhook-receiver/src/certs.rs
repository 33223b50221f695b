//! Provider signing certificates: parsing, fetching, and a TTL cache.
//!
//! The cache is backed by moka. Concurrent lookups for a URL that is not
//! cached yet share a single in-flight fetch, and failed fetches are never
//! cached.

use crate::error::{Result, WebhookError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use x509_cert::der::Encode;
use x509_cert::Certificate;

const MAX_CACHED_CERTIFICATES: u64 = 64;

/// The leaf certificate a provider signs transmissions with.
#[derive(Clone)]
pub struct ProviderCertificate {
    verifying_key: VerifyingKey<Sha256>,
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl std::fmt::Debug for ProviderCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCertificate")
            .field("subject", &self.subject)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish()
    }
}

impl ProviderCertificate {
    /// Parse a PEM bundle and keep the first (leaf) certificate.
    /// Only RSA keys are accepted.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        // load_pem_chain underflows on input with no PEM content.
        if pem.iter().all(u8::is_ascii_whitespace) {
            return Err(WebhookError::SignatureInvalid("empty certificate bundle".into()));
        }
        let chain = Certificate::load_pem_chain(pem)
            .map_err(|e| WebhookError::SignatureInvalid(format!("unparseable certificate: {e}")))?;
        let leaf = chain
            .into_iter()
            .next()
            .ok_or_else(|| WebhookError::SignatureInvalid("empty certificate bundle".into()))?;

        let tbs = &leaf.tbs_certificate;
        let not_before = unix_to_utc(tbs.validity.not_before.to_unix_duration())?;
        let not_after = unix_to_utc(tbs.validity.not_after.to_unix_duration())?;

        let spki_der = tbs
            .subject_public_key_info
            .to_der()
            .map_err(|e| WebhookError::SignatureInvalid(format!("bad public key info: {e}")))?;
        let public_key = RsaPublicKey::from_public_key_der(&spki_der)
            .map_err(|e| WebhookError::SignatureInvalid(format!("not an RSA key: {e}")))?;

        Ok(Self {
            verifying_key: VerifyingKey::<Sha256>::new(public_key),
            subject: tbs.subject.to_string(),
            not_before,
            not_after,
        })
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// RSASSA-PKCS1-v1_5 / SHA-256 check of `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        self.verifying_key.verify(message, &signature).is_ok()
    }
}

fn unix_to_utc(since_epoch: Duration) -> Result<DateTime<Utc>> {
    i64::try_from(since_epoch.as_secs())
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .ok_or_else(|| WebhookError::SignatureInvalid("certificate date out of range".into()))
}

/// Retrieves certificate PEM bytes for a trusted URL.
///
/// Errors follow the verification taxonomy: `CertificateFetchFailed` and
/// `Timeout` are transient, anything else means the certificate will never
/// be usable.
#[async_trait]
pub trait CertificateFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>>;
}

/// Fetches certificates over HTTPS with reqwest.
pub struct HttpCertificateFetcher {
    client: reqwest::Client,
}

impl HttpCertificateFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::config(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CertificateFetcher for HttpCertificateFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        let response = self.client.get(url.as_str()).send().await.map_err(|e| {
            if e.is_timeout() {
                WebhookError::Timeout(format!("certificate fetch: {e}"))
            } else {
                WebhookError::CertificateFetchFailed(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(WebhookError::CertificateFetchFailed(format!(
                "certificate host returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(WebhookError::SignatureInvalid(format!(
                "certificate host returned {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| WebhookError::CertificateFetchFailed(e.to_string()))?;
        Ok(body.to_vec())
    }
}

/// Parsed certificates keyed by URL, expiring on a fixed TTL that is
/// independent of the certificates' own validity dates.
#[derive(Clone)]
pub struct CertificateCache {
    inner: Cache<String, Arc<ProviderCertificate>>,
    fetcher: Arc<dyn CertificateFetcher>,
    fetch_timeout: Duration,
}

impl CertificateCache {
    pub fn new(fetcher: Arc<dyn CertificateFetcher>, ttl: Duration, fetch_timeout: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(MAX_CACHED_CERTIFICATES)
            .time_to_live(ttl)
            .build();
        Self {
            inner,
            fetcher,
            fetch_timeout,
        }
    }

    pub async fn get(&self, url: &Url) -> Result<Arc<ProviderCertificate>> {
        self.inner
            .try_get_with(url.to_string(), self.fetch_and_parse(url))
            .await
            .map_err(|e| (*e).clone())
    }

    async fn fetch_and_parse(&self, url: &Url) -> Result<Arc<ProviderCertificate>> {
        tracing::debug!(cert_url = %url, "Fetching provider certificate");

        let pem = tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(url))
            .await
            .map_err(|_| WebhookError::Timeout(format!("certificate fetch from {url}")))??;

        let certificate = ProviderCertificate::from_pem(&pem)?;
        tracing::info!(
            cert_url = %url,
            subject = %certificate.subject,
            not_after = %certificate.not_after,
            "Cached provider certificate"
        );
        Ok(Arc::new(certificate))
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1v15::SigningKey;
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{SignatureEncoding, Signer};
    use rsa::RsaPrivateKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CERT_PEM: &str = include_str!("../tests/fixtures/provider_cert.pem");
    const EXPIRED_CERT_PEM: &str = include_str!("../tests/fixtures/expired_cert.pem");
    const KEY_PEM: &str = include_str!("../tests/fixtures/provider_key.pem");

    fn sign(message: &[u8]) -> Vec<u8> {
        let key = RsaPrivateKey::from_pkcs8_pem(KEY_PEM).unwrap();
        SigningKey::<Sha256>::new(key).sign(message).to_vec()
    }

    struct CountingFetcher {
        calls: AtomicUsize,
        delay: Duration,
        response: Result<Vec<u8>>,
    }

    impl CountingFetcher {
        fn new(response: Result<Vec<u8>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                response,
            }
        }
    }

    #[async_trait]
    impl CertificateFetcher for CountingFetcher {
        async fn fetch(&self, _url: &Url) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.response.clone()
        }
    }

    fn cert_url() -> Url {
        Url::parse("https://api.paypal.com/v1/notifications/certs/CERT-1").unwrap()
    }

    #[test]
    fn test_parse_fixture_certificate() {
        let cert = ProviderCertificate::from_pem(CERT_PEM.as_bytes()).unwrap();
        assert!(cert.subject.contains("messageverificationcerts"));
        assert!(cert.is_valid_at(Utc::now()));
        assert!(cert.not_before < cert.not_after);
    }

    #[test]
    fn test_expired_certificate_is_not_valid() {
        let cert = ProviderCertificate::from_pem(EXPIRED_CERT_PEM.as_bytes()).unwrap();
        assert!(!cert.is_valid_at(Utc::now()));
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        let result = ProviderCertificate::from_pem(b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n");
        assert!(matches!(result, Err(WebhookError::SignatureInvalid(_))));
        for empty in [&b""[..], &b"\n"[..], &b" \r\n\t "[..]] {
            assert!(matches!(
                ProviderCertificate::from_pem(empty),
                Err(WebhookError::SignatureInvalid(msg)) if msg == "empty certificate bundle"
            ));
        }
    }

    #[test]
    fn test_verify_signature_with_certificate_key() {
        let cert = ProviderCertificate::from_pem(CERT_PEM.as_bytes()).unwrap();
        let signature = sign(b"tx|time|webhook|123");

        assert!(cert.verify(b"tx|time|webhook|123", &signature));
        assert!(!cert.verify(b"tx|time|webhook|124", &signature));
        assert!(!cert.verify(b"tx|time|webhook|123", &signature[1..]));
        assert!(!cert.verify(b"tx|time|webhook|123", b""));
    }

    #[tokio::test]
    async fn test_cache_reuses_fetched_certificate() {
        let fetcher = Arc::new(CountingFetcher::new(Ok(CERT_PEM.as_bytes().to_vec())));
        let cache = CertificateCache::new(fetcher.clone(), Duration::from_secs(60), Duration::from_secs(1));

        cache.get(&cert_url()).await.unwrap();
        cache.get(&cert_url()).await.unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_fetch() {
        let mut fetcher = CountingFetcher::new(Ok(CERT_PEM.as_bytes().to_vec()));
        fetcher.delay = Duration::from_millis(50);
        let fetcher = Arc::new(fetcher);
        let cache = CertificateCache::new(fetcher.clone(), Duration::from_secs(60), Duration::from_secs(1));

        let url = cert_url();
        let (a, b, c) = tokio::join!(cache.get(&url), cache.get(&url), cache.get(&url));
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let fetcher = Arc::new(CountingFetcher::new(Ok(CERT_PEM.as_bytes().to_vec())));
        let cache = CertificateCache::new(fetcher.clone(), Duration::from_millis(50), Duration::from_secs(1));

        cache.get(&cert_url()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        cache.get(&cert_url()).await.unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let fetcher = Arc::new(CountingFetcher::new(Err(
            WebhookError::CertificateFetchFailed("connection refused".into()),
        )));
        let cache = CertificateCache::new(fetcher.clone(), Duration::from_secs(60), Duration::from_secs(1));

        let err = cache.get(&cert_url()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(cache.get(&cert_url()).await.is_err());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_fetch_times_out_as_transient() {
        let mut fetcher = CountingFetcher::new(Ok(CERT_PEM.as_bytes().to_vec()));
        fetcher.delay = Duration::from_millis(200);
        let cache = CertificateCache::new(Arc::new(fetcher), Duration::from_secs(60), Duration::from_millis(20));

        let err = cache.get(&cert_url()).await.unwrap_err();
        assert!(matches!(err, WebhookError::Timeout(_)));
        assert!(err.is_retryable());
    }
}
