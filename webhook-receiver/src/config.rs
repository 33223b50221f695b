use crate::error::{Result, WebhookError};
use crate::pipeline::PipelineSettings;
use crate::store::StoreSettings;
use crate::verification::{HostAllowlist, VerifierSettings};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for `RETENTION_DAYS`, a century.
pub const MAX_RETENTION_DAYS: u64 = 36_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PayPalEnv {
    Sandbox,
    Live,
}

/// Runtime configuration. Every flag can also be set through the
/// environment variable named after it.
#[derive(Debug, Clone, Parser)]
#[command(name = "payment-webhook-receiver", version, about)]
pub struct Config {
    /// Webhook id assigned by PayPal; part of every signed message.
    #[arg(long, env)]
    pub paypal_webhook_id: String,

    #[arg(long, env, value_enum, default_value = "sandbox")]
    pub paypal_env: PayPalEnv,

    #[arg(long, env, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env, default_value_t = 8000)]
    pub port: u16,

    /// SQLite file for idempotency records. Records are kept in memory when unset.
    #[arg(long, env)]
    pub database_path: Option<PathBuf>,

    #[arg(long, env, default_value_t = 8)]
    pub database_pool_size: u32,

    /// Hosts allowed to serve signing certificates. `*.example.com` matches subdomains.
    #[arg(
        long,
        env,
        value_delimiter = ',',
        default_value = "api.paypal.com,api.sandbox.paypal.com"
    )]
    pub cert_host_allowlist: Vec<String>,

    #[arg(long, env, default_value_t = 3600)]
    pub cert_cache_ttl_secs: u64,

    #[arg(long, env, default_value_t = 5)]
    pub cert_fetch_timeout_secs: u64,

    #[arg(long, env, default_value_t = 2)]
    pub store_timeout_secs: u64,

    #[arg(long, env, default_value_t = 30)]
    pub handler_timeout_secs: u64,

    /// Age after which a pending claim is considered abandoned. Must exceed
    /// the longest a delivery can hold it.
    #[arg(long, env, default_value_t = 300)]
    pub claim_timeout_secs: u64,

    /// How long a duplicate delivery waits on an in-flight one before 409.
    #[arg(long, env, default_value_t = 500)]
    pub claim_wait_ms: u64,

    #[arg(long, env, default_value_t = 5)]
    pub max_attempts: u32,

    #[arg(long, env, default_value_t = 30)]
    pub retention_days: u64,

    #[arg(long, env, default_value_t = 3600)]
    pub purge_interval_secs: u64,

    /// Reject transmissions whose timestamp is further than this from now.
    #[arg(long, env)]
    pub max_transmission_age_secs: Option<u64>,

    #[arg(long, env, default_value_t = 1024 * 1024)]
    pub max_body_bytes: usize,

    /// Endpoint that receives dead-letter alerts. Alerts are only logged when unset.
    #[arg(long, env)]
    pub alert_url: Option<String>,

    /// Sent as `X-Internal-Token` with alerts.
    #[arg(long, env, hide_env_values = true)]
    pub internal_token: Option<String>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.paypal_webhook_id.trim().is_empty() {
            return Err(WebhookError::config("PAYPAL_WEBHOOK_ID must not be empty"));
        }

        let non_zero = [
            ("CERT_CACHE_TTL_SECS", self.cert_cache_ttl_secs),
            ("CERT_FETCH_TIMEOUT_SECS", self.cert_fetch_timeout_secs),
            ("STORE_TIMEOUT_SECS", self.store_timeout_secs),
            ("HANDLER_TIMEOUT_SECS", self.handler_timeout_secs),
            ("CLAIM_TIMEOUT_SECS", self.claim_timeout_secs),
            ("RETENTION_DAYS", self.retention_days),
            ("PURGE_INTERVAL_SECS", self.purge_interval_secs),
            ("MAX_ATTEMPTS", u64::from(self.max_attempts)),
            ("DATABASE_POOL_SIZE", u64::from(self.database_pool_size)),
            ("MAX_BODY_BYTES", self.max_body_bytes as u64),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(WebhookError::config(format!("{name} must be greater than zero")));
        }
        if self.max_transmission_age_secs == Some(0) {
            return Err(WebhookError::config("MAX_TRANSMISSION_AGE_SECS must be greater than zero"));
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(WebhookError::config(format!(
                "RETENTION_DAYS must be at most {MAX_RETENTION_DAYS}"
            )));
        }

        // A claim has to outlive the delivery holding it, or a redelivery
        // reclaims the event while its handler is still running.
        let held_for = self
            .handler_timeout()
            .saturating_add(self.pipeline_settings().claim_wait)
            .saturating_add(self.pipeline_settings().store_timeout.saturating_mul(3));
        if self.store_settings().claim_timeout <= held_for {
            return Err(WebhookError::config(format!(
                "CLAIM_TIMEOUT_SECS must exceed HANDLER_TIMEOUT_SECS + CLAIM_WAIT_MS + 3 x STORE_TIMEOUT_SECS ({}ms)",
                held_for.as_millis()
            )));
        }

        HostAllowlist::parse(&self.cert_host_allowlist)?;

        if let Some(url) = &self.alert_url {
            url::Url::parse(url).map_err(|e| WebhookError::config(format!("ALERT_URL: {e}")))?;
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn verifier_settings(&self) -> Result<VerifierSettings> {
        Ok(VerifierSettings {
            webhook_id: self.paypal_webhook_id.clone(),
            cert_hosts: HostAllowlist::parse(&self.cert_host_allowlist)?,
            max_transmission_age: self.max_transmission_age_secs.map(Duration::from_secs),
        })
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            max_attempts: self.max_attempts,
            claim_timeout: Duration::from_secs(self.claim_timeout_secs),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            store_timeout: Duration::from_secs(self.store_timeout_secs),
            claim_wait: Duration::from_millis(self.claim_wait_ms),
            ..PipelineSettings::default()
        }
    }

    pub fn cert_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cert_cache_ttl_secs)
    }

    pub fn cert_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.cert_fetch_timeout_secs)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 60 * 60))
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}
