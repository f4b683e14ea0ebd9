//! Bounded-retry HTTP executor for provider calls.
//!
//! Retries timeouts, network errors and 5xx responses on a fixed exponential
//! schedule. Anything below 500 is handed back to the caller untouched: the
//! provider saw the request and the adapter decides what the body means.

use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use crate::errors::DeliveryError;

/// Retry behaviour of [`RetryingTransport`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Upper bound on a single attempt, body read included.
    pub attempt_timeout: Duration,
    /// Delay before attempt `n + 1` is `backoff[n - 1]`; the last entry repeats.
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(30),
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        }
    }
}

impl RetryPolicy {
    /// Wait inserted after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or_default()
    }

    /// Worst-case wall time of one `send`.
    pub fn worst_case(&self) -> Duration {
        let waits: Duration = (1..self.max_attempts).map(|a| self.delay_after(a)).sum();
        self.attempt_timeout * self.max_attempts + waits
    }
}

/// Fully built provider call, ready for the wire.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl ProviderRequest {
    pub fn new(url: String, body: Value) -> Self {
        Self {
            url,
            headers: Vec::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Body safe for the audit log: credentials carried in the body are masked.
    pub fn redacted_body(&self) -> Value {
        let mut body = self.body.clone();
        if let Some(obj) = body.as_object_mut() {
            if obj.contains_key("access_token") {
                obj.insert("access_token".to_string(), Value::from("[REDACTED]"));
            }
        }
        body
    }
}

/// A response that reached the caller without exhausting retries (status < 500).
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
    pub attempts: u32,
}

enum AttemptError {
    Retryable { message: String, status: Option<u16> },
    Fatal(String),
}

#[derive(Clone)]
pub struct RetryingTransport {
    client: Client,
    policy: RetryPolicy,
}

impl RetryingTransport {
    /// Builds the underlying reqwest client.
    ///
    /// # Arguments
    ///
    /// * `policy` - Attempt count, per-attempt timeout and backoff schedule.
    ///
    /// # Returns
    ///
    /// * `Result<Self, DeliveryError>` - `Transport` with zero attempts if the
    ///   client cannot be constructed.
    pub fn new(policy: RetryPolicy) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .connect_timeout(policy.attempt_timeout)
            .user_agent(concat!("conversion-delivery/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DeliveryError::Transport {
                message: format!("Failed to build HTTP client: {}", e),
                status: None,
                attempts: 0,
            })?;

        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Sends `request`, retrying per policy.
    ///
    /// # Errors
    ///
    /// * `DeliveryError::Transport` with the last observed error once every
    ///   attempt failed with a timeout, network error or 5xx.
    /// * `DeliveryError::Validation` when the request cannot be built, e.g. an
    ///   access token that is not a legal header value. Nothing is retried.
    pub async fn send(&self, request: &ProviderRequest) -> Result<TransportResponse, DeliveryError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_message = String::new();
        let mut last_status = None;

        for attempt in 1..=max_attempts {
            let outcome =
                tokio::time::timeout(self.policy.attempt_timeout, self.attempt(request)).await;

            let error = match outcome {
                Ok(Ok((status, body))) if status < 500 => {
                    if attempt > 1 {
                        tracing::info!(
                            "Request to {} completed with {} on attempt {}",
                            request.url,
                            status,
                            attempt
                        );
                    }
                    return Ok(TransportResponse {
                        status,
                        body,
                        attempts: attempt,
                    });
                }
                Ok(Ok((status, body))) => AttemptError::Retryable {
                    message: format!("provider returned {}: {}", status, truncate(&body, 512)),
                    status: Some(status),
                },
                Ok(Err(e)) => e,
                Err(_) => AttemptError::Retryable {
                    message: format!(
                        "attempt timed out after {:?}",
                        self.policy.attempt_timeout
                    ),
                    status: None,
                },
            };

            match error {
                AttemptError::Fatal(message) => {
                    // Malformed URL or header value: nothing reached the wire.
                    tracing::warn!("Request to {} cannot be built: {}", request.url, message);
                    return Err(DeliveryError::Validation(message));
                }
                AttemptError::Retryable { message, status } => {
                    tracing::warn!(
                        "Attempt {}/{} to {} failed: {}",
                        attempt,
                        max_attempts,
                        request.url,
                        message
                    );
                    last_message = message;
                    last_status = status;
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }

        tracing::error!(
            "❌ Giving up on {} after {} attempts: {}",
            request.url,
            max_attempts,
            last_message
        );
        Err(DeliveryError::Transport {
            message: last_message,
            status: last_status,
            attempts: max_attempts,
        })
    }

    async fn attempt(&self, request: &ProviderRequest) -> Result<(u16, String), AttemptError> {
        let mut builder = self.client.post(&request.url).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                AttemptError::Fatal(format!("invalid request: {}", e))
            } else {
                AttemptError::Retryable {
                    message: format!("request failed: {}", e),
                    status: None,
                }
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| AttemptError::Retryable {
            message: format!("failed to read response body: {}", e),
            status: Some(status),
        })?;

        Ok((status, body))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(max_chars).collect();
        cut.push('…');
        cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(9), Duration::from_secs(4));
    }

    #[test]
    fn test_worst_case_duration() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.worst_case(), Duration::from_secs(30 * 3 + 1 + 2));
    }

    #[test]
    fn test_redacted_body_masks_access_token() {
        let request = ProviderRequest::new(
            "https://example.com".to_string(),
            serde_json::json!({"data": [], "access_token": "secret"}),
        );
        let redacted = request.redacted_body();
        assert_eq!(redacted["access_token"], "[REDACTED]");
        assert_eq!(request.body["access_token"], "secret");
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("ção", 2), "çã…");
        assert_eq!(truncate("ok", 5), "ok");
    }

    #[tokio::test]
    async fn test_transport_creation() {
        assert!(RetryingTransport::new(RetryPolicy::default()).is_ok());
    }
}
