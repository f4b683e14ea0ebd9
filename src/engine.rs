//! Conversion delivery engine.
//!
//! Flow for one `(entity, level)`:
//! 1. Claim the slot with a conditional update (atomic variant only).
//! 2. Validate credentials and identity, derive the event id.
//! 3. Check the provider's breaker, build the payload, send through the
//!    retrying transport and let the adapter judge the response.
//! 4. Commit the provider event id on success, roll the claim back otherwise.
//! 5. Append exactly one audit record for the attempt.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::audit::AuditLogWriter;
use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use crate::claim_store::{ClaimOutcome, ClaimStore};
use crate::credentials::CredentialResolver;
use crate::errors::DeliveryError;
use crate::event_id::generate_event_id;
use crate::models::{
    AuditStatus, ConversionLevel, DeliveryAttempt, DeliveryResult, Provider, SendEventRequest,
};
use crate::providers::{PayloadContext, ProviderAdapter};
use crate::transport::RetryingTransport;

/// An adapter together with its endpoint and its long-lived breaker.
pub struct ProviderRegistration {
    adapter: Arc<dyn ProviderAdapter>,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
}

impl ProviderRegistration {
    /// Pairs an adapter with its endpoint and a fresh breaker.
    ///
    /// # Arguments
    ///
    /// * `adapter` - Provider-specific payload builder and response parser.
    /// * `base_url` - API root, e.g. `https://graph.facebook.com/v20.0`.
    /// * `breaker_config` - Threshold and reset window for this provider's breaker.
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        base_url: impl Into<String>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(adapter.provider(), breaker_config));
        Self {
            adapter,
            base_url: base_url.into(),
            breaker,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

/// What one pass through the delivery pipeline produced, before auditing.
struct AttemptOutcome {
    result: Result<String, DeliveryError>,
    event_id: Option<String>,
    request_payload: Option<Value>,
    response_payload: Option<Value>,
    retry_count: i32,
}

impl AttemptOutcome {
    fn skipped(error: DeliveryError, event_id: Option<String>) -> Self {
        Self {
            result: Err(error),
            event_id,
            request_payload: None,
            response_payload: None,
            retry_count: 0,
        }
    }
}

pub struct DeliveryEngine {
    transport: RetryingTransport,
    claims: Arc<dyn ClaimStore>,
    audit: AuditLogWriter,
    credentials: Option<Arc<dyn CredentialResolver>>,
    providers: HashMap<Provider, ProviderRegistration>,
}

impl DeliveryEngine {
    /// Creates an engine with no providers registered.
    ///
    /// # Arguments
    ///
    /// * `transport` - Retrying HTTP executor shared by all providers.
    /// * `claims` - Store backing the at-most-once claim.
    /// * `audit` - Writer receiving one row per attempt.
    ///
    /// Register providers with [`DeliveryEngine::with_provider`]; a request for
    /// an unregistered provider fails validation.
    pub fn new(
        transport: RetryingTransport,
        claims: Arc<dyn ClaimStore>,
        audit: AuditLogWriter,
    ) -> Self {
        Self {
            transport,
            claims,
            audit,
            credentials: None,
            providers: HashMap::new(),
        }
    }

    /// Registers (or replaces) the adapter for its provider.
    pub fn with_provider(mut self, registration: ProviderRegistration) -> Self {
        self.providers
            .insert(registration.adapter.provider(), registration);
        self
    }

    /// Used by [`DeliveryEngine::report_conversion`] to look up credentials
    /// by the entity's direction.
    pub fn with_credential_resolver(mut self, resolver: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = Some(resolver);
        self
    }

    /// Breaker of a registered provider.
    pub fn breaker(&self, provider: Provider) -> Option<&Arc<CircuitBreaker>> {
        self.providers.get(&provider).map(|r| &r.breaker)
    }

    /// One snapshot per registered provider, ordered by provider name.
    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .providers
            .values()
            .map(|r| r.breaker.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.provider.as_str());
        snapshots
    }

    /// Sends without claiming. Nothing prevents duplicates beyond the
    /// provider's own dedup on the event id.
    pub async fn send_event(&self, request: SendEventRequest) -> DeliveryResult {
        let correlation_id = Uuid::new_v4();
        self.deliver_and_audit(&request, correlation_id).await
    }

    /// Claim, send, then commit or roll back.
    ///
    /// Without an entity id there is nothing to claim, so this degrades to
    /// [`DeliveryEngine::send_event`].
    pub async fn send_event_atomic(&self, request: SendEventRequest) -> DeliveryResult {
        let Some(entity_id) = request
            .entity_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
        else {
            tracing::warn!(
                "No entity id for {} level {}, sending without a claim",
                request.provider,
                request.level
            );
            return self.send_event(request).await;
        };

        let level = request.level;
        let correlation_id = Uuid::new_v4();

        match self.claims.claim(&entity_id, level).await {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(ClaimOutcome::AlreadyClaimed) => {
                tracing::info!(
                    "({}, level {}) already sent or in flight, skipping",
                    entity_id,
                    level
                );
                return DeliveryResult::already_claimed();
            }
            Err(e) => {
                tracing::error!("Claim failed for ({}, level {}): {}", entity_id, level, e);
                return DeliveryResult::failed(e, None);
            }
        }

        let result = self.deliver_and_audit(&request, correlation_id).await;

        if let Some(ref provider_event_id) = result.provider_event_id {
            if let Err(e) = self
                .claims
                .commit(&entity_id, level, provider_event_id)
                .await
            {
                // The success audit row keeps reconciliation from releasing this slot.
                tracing::error!(
                    "Sent ({}, level {}) but failed to store event id {}: {}",
                    entity_id,
                    level,
                    provider_event_id,
                    e
                );
            }
        } else {
            if let Err(e) = self.claims.rollback(&entity_id, level).await {
                tracing::error!(
                    "❌ Rollback failed for ({}, level {}); slot stays claimed until reconciled: {}",
                    entity_id,
                    level,
                    e
                );
            } else {
                tracing::warn!(
                    "Rolled back claim ({}, level {}) after failed delivery",
                    entity_id,
                    level
                );
            }
        }

        result
    }

    /// Reports `level` for a stored entity, resolving identity and credentials
    /// from the entity's direction.
    pub async fn report_conversion(
        &self,
        entity_id: &str,
        level: ConversionLevel,
        provider: Provider,
        custom_data: Option<Value>,
    ) -> DeliveryResult {
        let entity = match self.claims.fetch_entity(entity_id).await {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                return DeliveryResult::failed(
                    DeliveryError::Validation(format!("entity {} not found", entity_id)),
                    None,
                )
            }
            Err(e) => return DeliveryResult::failed(e, None),
        };

        if entity.is_sent(level) {
            tracing::debug!("({}, level {}) already marked sent", entity_id, level);
            return DeliveryResult::already_claimed();
        }

        let credentials = match self.credentials {
            Some(ref resolver) => {
                match resolver
                    .resolve(provider, entity.direction_id.as_deref())
                    .await
                {
                    Ok(creds) => creds,
                    Err(e) => return DeliveryResult::failed(e, None),
                }
            }
            None => None,
        };

        self.send_event_atomic(SendEventRequest {
            provider,
            credentials,
            level,
            entity_id: Some(entity.id.clone()),
            identity: entity.identity(),
            custom_data,
        })
        .await
    }

    /// Releases claims older than `older_than` that have neither a stored
    /// event id nor a successful audit row.
    ///
    /// # Returns
    ///
    /// * `Result<u64, DeliveryError>` - Number of slots reset.
    pub async fn reconcile_stale_claims(
        &self,
        older_than: chrono::Duration,
    ) -> Result<u64, DeliveryError> {
        self.claims.reconcile_stale(older_than).await
    }

    async fn deliver_and_audit(
        &self,
        request: &SendEventRequest,
        correlation_id: Uuid,
    ) -> DeliveryResult {
        let started = Instant::now();
        let outcome = self.deliver(request).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let (status, error_message) = match outcome.result {
            Ok(_) => (AuditStatus::Success, None),
            Err(ref e) => (e.audit_status(), Some(e.to_string())),
        };

        let attempt = DeliveryAttempt {
            id: Uuid::new_v4(),
            provider: request.provider,
            level: request.level,
            entity_id: request.entity_id.clone(),
            event_id: outcome.event_id.clone(),
            status,
            correlation_id,
            request_payload: outcome.request_payload,
            response_payload: outcome.response_payload,
            error_message,
            duration_ms,
            retry_count: outcome.retry_count,
            created_at: Utc::now(),
        };
        self.audit.record(&attempt).await;

        match outcome.result {
            Ok(provider_event_id) => {
                tracing::info!(
                    provider = %request.provider,
                    level = %request.level,
                    event_id = ?outcome.event_id,
                    correlation_id = %correlation_id,
                    duration_ms,
                    "✅ Conversion delivered"
                );
                DeliveryResult::sent(outcome.event_id.unwrap_or_default(), provider_event_id)
            }
            Err(e) => {
                if e.is_validation() || matches!(e, DeliveryError::CircuitOpen(_)) {
                    tracing::warn!(
                        provider = %request.provider,
                        level = %request.level,
                        correlation_id = %correlation_id,
                        "Conversion skipped: {}",
                        e
                    );
                } else {
                    tracing::error!(
                        provider = %request.provider,
                        level = %request.level,
                        event_id = ?outcome.event_id,
                        correlation_id = %correlation_id,
                        "Conversion delivery failed: {}",
                        e
                    );
                }
                DeliveryResult::failed(e, outcome.event_id)
            }
        }
    }

    async fn deliver(&self, request: &SendEventRequest) -> AttemptOutcome {
        let Some(registration) = self.providers.get(&request.provider) else {
            return AttemptOutcome::skipped(
                DeliveryError::Validation(format!(
                    "provider {} is not configured",
                    request.provider
                )),
                None,
            );
        };

        let credentials = match request.credentials {
            Some(ref creds) if creds.is_complete() => creds,
            _ => {
                return AttemptOutcome::skipped(
                    DeliveryError::Validation(format!(
                        "{} pixel id or access token missing",
                        request.provider
                    )),
                    None,
                )
            }
        };

        let identity = match registration.adapter.select_identity(&request.identity) {
            Ok(identity) => identity,
            Err(e) => return AttemptOutcome::skipped(e, None),
        };

        let event_id = generate_event_id(
            request.entity_id.as_deref(),
            request.level,
            &request.identity,
        );

        if registration.breaker.is_open() {
            return AttemptOutcome::skipped(
                DeliveryError::CircuitOpen(request.provider),
                Some(event_id.value),
            );
        }

        let provider_request = match registration.adapter.build_payload(&PayloadContext {
            base_url: &registration.base_url,
            credentials,
            level: request.level,
            event_id: &event_id.value,
            identity: &identity,
            custom_data: request.custom_data.as_ref(),
            event_time: Utc::now().timestamp(),
        }) {
            Ok(r) => r,
            Err(e) => return AttemptOutcome::skipped(e, Some(event_id.value)),
        };
        let request_payload = Some(provider_request.redacted_body());

        tracing::debug!(
            "Sending {} level {} event {} ({})",
            request.provider,
            request.level,
            event_id.value,
            event_id.strategy
        );

        let response = match self.transport.send(&provider_request).await {
            Ok(response) => response,
            Err(e) => {
                let retry_count = match e {
                    DeliveryError::Transport { attempts, .. } => {
                        registration.breaker.record_failure();
                        attempts.saturating_sub(1) as i32
                    }
                    _ => 0,
                };
                return AttemptOutcome {
                    result: Err(e),
                    event_id: Some(event_id.value),
                    request_payload,
                    response_payload: None,
                    retry_count,
                };
            }
        };

        let parsed = registration
            .adapter
            .parse_response(response.status, &response.body, &event_id.value);
        let response_payload = Some(
            serde_json::from_str::<Value>(&response.body)
                .unwrap_or_else(|_| json!({ "raw": response.body })),
        );

        let trace_id = parsed.trace_id.as_deref().unwrap_or("-");
        let result = match (parsed.success, parsed.provider_event_id) {
            (true, Some(provider_event_id)) => {
                registration.breaker.record_success();
                tracing::debug!(
                    provider = %request.provider,
                    trace_id,
                    "Provider accepted event {}",
                    event_id.value
                );
                Ok(provider_event_id)
            }
            _ => {
                let message = parsed.error.unwrap_or_else(|| {
                    format!("{} returned status {}", request.provider, response.status)
                });
                tracing::warn!(
                    provider = %request.provider,
                    trace_id,
                    status = response.status,
                    "Provider rejected event {}: {}",
                    event_id.value,
                    message
                );
                Err(DeliveryError::ProviderRejected(message))
            }
        };

        AttemptOutcome {
            result,
            event_id: Some(event_id.value),
            request_payload,
            response_payload,
            retry_count: response.attempts.saturating_sub(1) as i32,
        }
    }
}
