//! Append-only delivery audit log.
//!
//! Audit writes retry on their own schedule and never fail a delivery: a lost
//! audit row is logged, the caller still gets the real outcome.

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::claim_store::ATTEMPT_TABLE;
use crate::errors::DeliveryError;
use crate::models::{AuditStatus, ConversionLevel, DeliveryAttempt};

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, attempt: &DeliveryAttempt) -> Result<(), DeliveryError>;
}

/// Writes attempts into `conversion_delivery_attempts`.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn append(&self, attempt: &DeliveryAttempt) -> Result<(), DeliveryError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (
                id,
                provider,
                level,
                entity_id,
                event_id,
                status,
                correlation_id,
                request_payload,
                response_payload,
                error_message,
                duration_ms,
                retry_count,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
            ATTEMPT_TABLE
        ))
        .bind(attempt.id)
        .bind(attempt.provider.as_str())
        .bind(attempt.level.as_u8() as i16)
        .bind(attempt.entity_id.as_deref())
        .bind(attempt.event_id.as_deref())
        .bind(attempt.status.as_str())
        .bind(attempt.correlation_id)
        .bind(&attempt.request_payload)
        .bind(&attempt.response_payload)
        .bind(attempt.error_message.as_deref())
        .bind(attempt.duration_ms)
        .bind(attempt.retry_count)
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Keeps attempts in memory; used by tests and embedders without a database.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<DeliveryAttempt>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeliveryAttempt> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Whether a successful attempt was recorded for `(entity_id, level)`.
    pub fn has_success(&self, entity_id: &str, level: ConversionLevel) -> bool {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|a| {
                a.status == AuditStatus::Success
                    && a.level == level
                    && a.entity_id.as_deref() == Some(entity_id)
            })
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, attempt: &DeliveryAttempt) -> Result<(), DeliveryError> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(attempt.clone());
        Ok(())
    }
}

/// Retrying front of an [`AuditSink`].
#[derive(Clone)]
pub struct AuditLogWriter {
    sink: Arc<dyn AuditSink>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl AuditLogWriter {
    /// Three attempts, 500ms apart.
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Appends the attempt. Returns whether the row was stored; never errors.
    pub async fn record(&self, attempt: &DeliveryAttempt) -> bool {
        for n in 1..=self.max_attempts {
            match self.sink.append(attempt).await {
                Ok(()) => return true,
                Err(e) if n < self.max_attempts => {
                    tracing::warn!(
                        "Audit write {}/{} failed for {}: {}",
                        n,
                        self.max_attempts,
                        attempt.correlation_id,
                        e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        "❌ Audit record lost for {} ({} {} level {}): {}",
                        attempt.correlation_id,
                        attempt.status.as_str(),
                        attempt.provider,
                        attempt.level,
                        e
                    );
                }
            }
        }
        false
    }
}
