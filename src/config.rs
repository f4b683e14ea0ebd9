use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::models::{Provider, ProviderCredentials};
use crate::providers::MetaChannel;
use crate::transport::RetryPolicy;

pub const DEFAULT_META_BASE_URL: &str = "https://graph.facebook.com/v20.0";
pub const DEFAULT_TIKTOK_BASE_URL: &str = "https://business-api.tiktok.com/open_api/v1.3";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub meta_base_url: String,
    pub tiktok_base_url: String,
    pub meta_channel: MetaChannel,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_secs: u64,
    pub reconcile_after_secs: u64,
    pub meta_credentials: Option<ProviderCredentials>,
    pub tiktok_credentials: Option<ProviderCredentials>,
    pub meta_test_event_code: Option<String>,
    pub tiktok_test_event_code: Option<String>,
    /// Required in the `X-Api-Key` header when set.
    pub api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .or_else(|_| std::env::var("DB_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DATABASE_URL or DB_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DATABASE_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: parse_or("PORT", 3000)?,
            meta_base_url: base_url("META_BASE_URL", DEFAULT_META_BASE_URL)?,
            tiktok_base_url: base_url("TIKTOK_BASE_URL", DEFAULT_TIKTOK_BASE_URL)?,
            meta_channel: optional("META_CHANNEL")
                .map(|c| c.parse::<MetaChannel>())
                .transpose()
                .map_err(|e| anyhow::anyhow!("META_CHANNEL: {}", e))?
                .unwrap_or_default(),
            request_timeout_secs: parse_or("REQUEST_TIMEOUT_SECS", 30)?,
            max_attempts: parse_or("DELIVERY_MAX_ATTEMPTS", 3)?,
            breaker_failure_threshold: parse_or("BREAKER_FAILURE_THRESHOLD", 5)?,
            breaker_reset_secs: parse_or("BREAKER_RESET_SECS", 60)?,
            reconcile_after_secs: parse_or("RECONCILE_AFTER_SECS", 900)?,
            meta_credentials: credentials("META_PIXEL_ID", "META_ACCESS_TOKEN")?,
            tiktok_credentials: credentials("TIKTOK_PIXEL_ID", "TIKTOK_ACCESS_TOKEN")?,
            meta_test_event_code: optional("META_TEST_EVENT_CODE"),
            tiktok_test_event_code: optional("TIKTOK_TEST_EVENT_CODE"),
            api_key: optional("API_KEY"),
        };

        if config.max_attempts == 0 {
            anyhow::bail!("DELIVERY_MAX_ATTEMPTS must be at least 1");
        }
        if config.breaker_failure_threshold == 0 {
            anyhow::bail!("BREAKER_FAILURE_THRESHOLD must be at least 1");
        }

        // Log without sensitive values
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("Meta Base URL: {} ({:?})", config.meta_base_url, config.meta_channel);
        tracing::debug!("TikTok Base URL: {}", config.tiktok_base_url);
        tracing::debug!(
            "Retry: {} attempts, {}s timeout; breaker: {} failures / {}s",
            config.max_attempts,
            config.request_timeout_secs,
            config.breaker_failure_threshold,
            config.breaker_reset_secs
        );
        if config.api_key.is_none() {
            tracing::warn!("API_KEY not set: HTTP endpoints are unauthenticated");
        }

        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            attempt_timeout: Duration::from_secs(self.request_timeout_secs),
            ..RetryPolicy::default()
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            reset_window: Duration::from_secs(self.breaker_reset_secs),
        }
    }

    pub fn reconcile_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reconcile_after_secs as i64)
    }

    pub fn default_credentials(&self) -> Vec<(Provider, ProviderCredentials)> {
        let mut defaults = Vec::new();
        if let Some(ref creds) = self.meta_credentials {
            defaults.push((Provider::Meta, creds.clone()));
        }
        if let Some(ref creds) = self.tiktok_credentials {
            defaults.push((Provider::TikTok, creds.clone()));
        }
        defaults
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match optional(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number, got '{}'", name, raw)),
        None => Ok(default),
    }
}

fn base_url(name: &str, default: &str) -> anyhow::Result<String> {
    let raw = optional(name).unwrap_or_else(|| default.to_string());
    let parsed = url::Url::parse(&raw)
        .map_err(|e| anyhow::anyhow!("{} is not a valid URL ({}): {}", name, raw, e))?;
    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(raw.trim_end_matches('/').to_string())
}

/// Both halves or neither.
fn credentials(pixel_var: &str, token_var: &str) -> anyhow::Result<Option<ProviderCredentials>> {
    match (optional(pixel_var), optional(token_var)) {
        (Some(pixel), Some(token)) => Ok(Some(ProviderCredentials::new(pixel, token))),
        (None, None) => Ok(None),
        _ => anyhow::bail!("{} and {} must be set together", pixel_var, token_var),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            database_url: "postgresql://test".to_string(),
            port: 3000,
            meta_base_url: DEFAULT_META_BASE_URL.to_string(),
            tiktok_base_url: DEFAULT_TIKTOK_BASE_URL.to_string(),
            meta_channel: MetaChannel::Crm,
            request_timeout_secs: 30,
            max_attempts: 3,
            breaker_failure_threshold: 5,
            breaker_reset_secs: 60,
            reconcile_after_secs: 900,
            meta_credentials: Some(ProviderCredentials::new("px", "tok")),
            tiktok_credentials: None,
            meta_test_event_code: None,
            tiktok_test_event_code: None,
            api_key: None,
        }
    }

    #[test]
    fn test_retry_policy_keeps_backoff_schedule() {
        let policy = config().retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.attempt_timeout, Duration::from_secs(30));
        assert_eq!(policy.backoff, RetryPolicy::default().backoff);
    }

    #[test]
    fn test_breaker_config() {
        let cfg = config().breaker_config();
        assert_eq!(cfg.failure_threshold, 5);
        assert_eq!(cfg.reset_window, Duration::from_secs(60));
    }

    #[test]
    fn test_default_credentials() {
        let defaults = config().default_credentials();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].0, Provider::Meta);
    }
}
