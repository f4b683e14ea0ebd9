use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::circuit_breaker::BreakerSnapshot;
use crate::config::Config;
use crate::engine::DeliveryEngine;
use crate::errors::{AppError, DeliveryError, ResultExt};
use crate::models::{ConversionLevel, DeliveryResult, Provider, SendEventRequest};

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Long-lived engine holding one breaker per provider.
    pub engine: Arc<DeliveryEngine>,
    /// Application configuration.
    pub config: Config,
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "conversion-delivery",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// POST /api/v1/conversions
///
/// Reports one conversion. Claims the `(entity, level)` slot first when an
/// `entity_id` is supplied.
pub async fn send_conversion(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SendEventRequest>,
) -> Result<(StatusCode, Json<DeliveryResult>), AppError> {
    validate_api_key(&state.config, &headers)?;

    tracing::info!(
        "POST /conversions - provider={}, level={}, entity={:?}",
        request.provider,
        request.level,
        request.entity_id
    );

    let result = if request.entity_id.is_some() {
        state.engine.send_event_atomic(request).await
    } else {
        state.engine.send_event(request).await
    };

    Ok((status_for(&result), Json(result)))
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub provider: Provider,
}

/// POST /api/v1/entities/:entity_id/conversions/:level?provider=meta
///
/// Manual trigger: identity and credentials come from the stored entity.
pub async fn report_entity_conversion(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((entity_id, level)): Path<(String, u8)>,
    Query(query): Query<ReportQuery>,
    body: Option<Json<Value>>,
) -> Result<(StatusCode, Json<DeliveryResult>), AppError> {
    validate_api_key(&state.config, &headers)?;

    let level = ConversionLevel::try_from(level).context("Invalid conversion level")?;
    let custom_data = body.map(|Json(v)| v);

    tracing::info!(
        "POST /entities/{}/conversions/{} - provider={}",
        entity_id,
        level,
        query.provider
    );

    let result = state
        .engine
        .report_conversion(&entity_id, level, query.provider, custom_data)
        .await;

    Ok((status_for(&result), Json(result)))
}

/// GET /api/v1/circuit-breakers
pub async fn circuit_breakers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<BreakerSnapshot>>, AppError> {
    validate_api_key(&state.config, &headers)?;
    Ok(Json(state.engine.breaker_snapshots()))
}

/// POST /api/v1/claims/reconcile
///
/// Releases claims that never completed so the next pass can resend them.
pub async fn reconcile_claims(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    validate_api_key(&state.config, &headers)?;

    let older_than = state.config.reconcile_after();
    let reset = state
        .engine
        .reconcile_stale_claims(older_than)
        .await
        .context("Failed to reconcile stale claims")?;

    tracing::info!("Reconciliation reset {} stale claim(s)", reset);

    Ok(Json(json!({
        "reset": reset,
        "older_than_secs": older_than.num_seconds(),
    })))
}

/// HTTP status mirroring a delivery outcome.
pub fn status_for(result: &DeliveryResult) -> StatusCode {
    if result.is_settled() {
        return StatusCode::OK;
    }
    match result.error {
        None | Some(DeliveryError::AlreadyClaimed) => StatusCode::OK,
        Some(DeliveryError::Validation(_)) | Some(DeliveryError::InvalidIdentity(_)) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        Some(DeliveryError::CircuitOpen(_)) => StatusCode::SERVICE_UNAVAILABLE,
        Some(DeliveryError::Transport { .. }) | Some(DeliveryError::ProviderRejected(_)) => {
            StatusCode::BAD_GATEWAY
        }
        Some(DeliveryError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Validate the `X-Api-Key` header when an API key is configured.
fn validate_api_key(config: &Config, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(ref expected) = config.api_key else {
        return Ok(());
    };

    let provided = headers
        .get("X-Api-Key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Api-Key header".to_string()))?;

    if !constant_time_compare(provided, expected) {
        tracing::warn!("Invalid API key received");
        return Err(AppError::Unauthorized("Invalid API key".to_string()));
    }

    Ok(())
}

/// Constant-time string comparison.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MetaChannel;

    fn config(api_key: Option<&str>) -> Config {
        Config {
            database_url: "postgresql://test".to_string(),
            port: 3000,
            meta_base_url: "https://graph.facebook.com/v20.0".to_string(),
            tiktok_base_url: "https://business-api.tiktok.com/open_api/v1.3".to_string(),
            meta_channel: MetaChannel::Crm,
            request_timeout_secs: 30,
            max_attempts: 3,
            breaker_failure_threshold: 5,
            breaker_reset_secs: 60,
            reconcile_after_secs: 900,
            meta_credentials: None,
            tiktok_credentials: None,
            meta_test_event_code: None,
            tiktok_test_event_code: None,
            api_key: api_key.map(String::from),
        }
    }

    #[test]
    fn test_api_key_validation() {
        let mut headers = HeaderMap::new();
        assert!(validate_api_key(&config(None), &headers).is_ok());
        assert!(validate_api_key(&config(Some("k1")), &headers).is_err());

        headers.insert("X-Api-Key", "k2".parse().unwrap());
        assert!(validate_api_key(&config(Some("k1")), &headers).is_err());

        headers.insert("X-Api-Key", "k1".parse().unwrap());
        assert!(validate_api_key(&config(Some("k1")), &headers).is_ok());
    }

    #[test]
    fn test_status_for_outcomes() {
        assert_eq!(
            status_for(&DeliveryResult::sent("E1_2".into(), "E1_2".into())),
            StatusCode::OK
        );
        assert_eq!(
            status_for(&DeliveryResult::already_claimed()),
            StatusCode::OK
        );
        assert_eq!(
            status_for(&DeliveryResult::failed(
                DeliveryError::CircuitOpen(Provider::Meta),
                None
            )),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&DeliveryResult::failed(
                DeliveryError::Validation("x".into()),
                None
            )),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
