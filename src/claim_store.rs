//! At-most-once claims over the per-level `sent` flags.
//!
//! The only synchronization point is a conditional update:
//! `SET levelN_sent = true WHERE id = $1 AND levelN_sent = false`. Whoever gets
//! a row back owns the send; everyone else sees `AlreadyClaimed`. A read
//! followed by a write would race and must never replace it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::audit::InMemoryAuditSink;
use crate::errors::DeliveryError;
use crate::models::{AuditStatus, ConversionEntity, ConversionLevel};

pub const ENTITY_TABLE: &str = "conversion_entities";
pub const ATTEMPT_TABLE: &str = "conversion_delivery_attempts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller flipped the flag and must send, then commit or roll back.
    Claimed,
    /// Someone else holds or completed the slot.
    AlreadyClaimed,
}

/// Column names backing one level's claim slot.
#[derive(Debug, Clone, Copy)]
pub struct LevelColumns {
    pub sent: &'static str,
    pub claimed_at: &'static str,
    pub event_id: &'static str,
}

pub fn level_columns(level: ConversionLevel) -> LevelColumns {
    match level {
        ConversionLevel::Interest => LevelColumns {
            sent: "level1_sent",
            claimed_at: "level1_claimed_at",
            event_id: "level1_event_id",
        },
        ConversionLevel::Qualified => LevelColumns {
            sent: "level2_sent",
            claimed_at: "level2_claimed_at",
            event_id: "level2_event_id",
        },
        ConversionLevel::Scheduled => LevelColumns {
            sent: "level3_sent",
            claimed_at: "level3_claimed_at",
            event_id: "level3_event_id",
        },
    }
}

#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Compare-and-set `sent[level]` from false to true.
    async fn claim(
        &self,
        entity_id: &str,
        level: ConversionLevel,
    ) -> Result<ClaimOutcome, DeliveryError>;

    /// Records the provider event id next to the already-set flag.
    async fn commit(
        &self,
        entity_id: &str,
        level: ConversionLevel,
        provider_event_id: &str,
    ) -> Result<(), DeliveryError>;

    /// Returns the slot to unclaimed so a later pass may try again.
    async fn rollback(&self, entity_id: &str, level: ConversionLevel)
        -> Result<(), DeliveryError>;

    async fn fetch_entity(&self, entity_id: &str)
        -> Result<Option<ConversionEntity>, DeliveryError>;

    /// Resets claims older than `older_than` that never committed an event id
    /// and have no successful audit record. Returns the number of slots reset.
    async fn reconcile_stale(&self, older_than: Duration) -> Result<u64, DeliveryError>;
}

/// Postgres-backed claim store.
#[derive(Clone)]
pub struct PgClaimStore {
    pool: PgPool,
}

impl PgClaimStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClaimStore for PgClaimStore {
    async fn claim(
        &self,
        entity_id: &str,
        level: ConversionLevel,
    ) -> Result<ClaimOutcome, DeliveryError> {
        let cols = level_columns(level);
        let query = format!(
            "UPDATE {table} SET {sent} = true, {claimed_at} = now(), {event_id} = NULL \
             WHERE id = $1 AND {sent} = false RETURNING id",
            table = ENTITY_TABLE,
            sent = cols.sent,
            claimed_at = cols.claimed_at,
            event_id = cols.event_id,
        );

        let claimed = sqlx::query_scalar::<_, String>(&query)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?;

        if claimed.is_some() {
            tracing::debug!("Claimed ({}, level {})", entity_id, level);
            return Ok(ClaimOutcome::Claimed);
        }

        let exists = sqlx::query_scalar::<_, bool>(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1)",
            ENTITY_TABLE
        ))
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await?;

        if exists {
            Ok(ClaimOutcome::AlreadyClaimed)
        } else {
            Err(DeliveryError::Validation(format!(
                "entity {} not found",
                entity_id
            )))
        }
    }

    async fn commit(
        &self,
        entity_id: &str,
        level: ConversionLevel,
        provider_event_id: &str,
    ) -> Result<(), DeliveryError> {
        let cols = level_columns(level);
        let query = format!(
            "UPDATE {table} SET {event_id} = $2 WHERE id = $1 AND {sent} = true",
            table = ENTITY_TABLE,
            event_id = cols.event_id,
            sent = cols.sent,
        );

        let result = sqlx::query(&query)
            .bind(entity_id)
            .bind(provider_event_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DeliveryError::Storage(format!(
                "commit found no claimed slot for ({}, level {})",
                entity_id, level
            )));
        }
        Ok(())
    }

    async fn rollback(
        &self,
        entity_id: &str,
        level: ConversionLevel,
    ) -> Result<(), DeliveryError> {
        let cols = level_columns(level);
        let query = format!(
            "UPDATE {table} SET {sent} = false, {claimed_at} = NULL, {event_id} = NULL \
             WHERE id = $1",
            table = ENTITY_TABLE,
            sent = cols.sent,
            claimed_at = cols.claimed_at,
            event_id = cols.event_id,
        );

        sqlx::query(&query)
            .bind(entity_id)
            .execute(&self.pool)
            .await?;

        tracing::debug!("Rolled back claim ({}, level {})", entity_id, level);
        Ok(())
    }

    async fn fetch_entity(
        &self,
        entity_id: &str,
    ) -> Result<Option<ConversionEntity>, DeliveryError> {
        let entity = sqlx::query_as::<_, ConversionEntity>(&format!(
            "SELECT id, user_account_id, direction_id, contact_phone, contact_email, click_id, \
                    level1_sent, level1_claimed_at, level1_event_id, \
                    level2_sent, level2_claimed_at, level2_event_id, \
                    level3_sent, level3_claimed_at, level3_event_id \
             FROM {} WHERE id = $1",
            ENTITY_TABLE
        ))
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entity)
    }

    async fn reconcile_stale(&self, older_than: Duration) -> Result<u64, DeliveryError> {
        let cutoff = Utc::now() - older_than;
        let mut total = 0;

        for level in ConversionLevel::ALL {
            let cols = level_columns(level);
            let query = format!(
                "UPDATE {table} e SET {sent} = false, {claimed_at} = NULL \
                 WHERE e.{sent} = true AND e.{event_id} IS NULL AND e.{claimed_at} < $1 \
                   AND NOT EXISTS ( \
                     SELECT 1 FROM {attempts} a \
                     WHERE a.entity_id = e.id AND a.level = $2 AND a.status = $3 \
                   )",
                table = ENTITY_TABLE,
                attempts = ATTEMPT_TABLE,
                sent = cols.sent,
                claimed_at = cols.claimed_at,
                event_id = cols.event_id,
            );

            let result = sqlx::query(&query)
                .bind(cutoff)
                .bind(level.as_u8() as i16)
                .bind(AuditStatus::Success.as_str())
                .execute(&self.pool)
                .await?;

            if result.rows_affected() > 0 {
                tracing::warn!(
                    "Reset {} stale level {} claim(s) older than {}",
                    result.rows_affected(),
                    level,
                    cutoff
                );
            }
            total += result.rows_affected();
        }

        Ok(total)
    }
}

/// State of one `(entity, level)` slot in [`InMemoryClaimStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimSlot {
    pub sent: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub provider_event_id: Option<String>,
}

/// Process-local claim store with the same compare-and-set semantics.
///
/// Slots are created lazily on first claim; entities only need to be inserted
/// for [`ClaimStore::fetch_entity`]. Reconciliation consults the attached
/// audit sink the way the Postgres store consults the attempts table.
#[derive(Debug, Default)]
pub struct InMemoryClaimStore {
    slots: Mutex<HashMap<(String, ConversionLevel), ClaimSlot>>,
    entities: Mutex<HashMap<String, ConversionEntity>>,
    audit: Option<Arc<InMemoryAuditSink>>,
}

impl InMemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shares the audit sink the engine writes to, so slots with a successful
    /// attempt survive reconciliation.
    pub fn with_audit(mut self, audit: Arc<InMemoryAuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn insert_entity(&self, entity: ConversionEntity) {
        lock(&self.entities).insert(entity.id.clone(), entity);
    }

    pub fn slot(&self, entity_id: &str, level: ConversionLevel) -> ClaimSlot {
        lock(&self.slots)
            .get(&(entity_id.to_string(), level))
            .cloned()
            .unwrap_or_default()
    }

    /// Test hook: backdates a claim so reconciliation sees it as stale.
    pub fn set_claimed_at(&self, entity_id: &str, level: ConversionLevel, at: DateTime<Utc>) {
        if let Some(slot) = lock(&self.slots).get_mut(&(entity_id.to_string(), level)) {
            slot.claimed_at = Some(at);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ClaimStore for InMemoryClaimStore {
    async fn claim(
        &self,
        entity_id: &str,
        level: ConversionLevel,
    ) -> Result<ClaimOutcome, DeliveryError> {
        let mut slots = lock(&self.slots);
        let slot = slots.entry((entity_id.to_string(), level)).or_default();
        if slot.sent {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        slot.sent = true;
        slot.claimed_at = Some(Utc::now());
        slot.provider_event_id = None;
        Ok(ClaimOutcome::Claimed)
    }

    async fn commit(
        &self,
        entity_id: &str,
        level: ConversionLevel,
        provider_event_id: &str,
    ) -> Result<(), DeliveryError> {
        let mut slots = lock(&self.slots);
        match slots.get_mut(&(entity_id.to_string(), level)) {
            Some(slot) if slot.sent => {
                slot.provider_event_id = Some(provider_event_id.to_string());
                Ok(())
            }
            _ => Err(DeliveryError::Storage(format!(
                "commit found no claimed slot for ({}, level {})",
                entity_id, level
            ))),
        }
    }

    async fn rollback(
        &self,
        entity_id: &str,
        level: ConversionLevel,
    ) -> Result<(), DeliveryError> {
        lock(&self.slots).insert((entity_id.to_string(), level), ClaimSlot::default());
        Ok(())
    }

    async fn fetch_entity(
        &self,
        entity_id: &str,
    ) -> Result<Option<ConversionEntity>, DeliveryError> {
        let Some(mut entity) = lock(&self.entities).get(entity_id).cloned() else {
            return Ok(None);
        };
        let slots = lock(&self.slots);
        for level in ConversionLevel::ALL {
            let slot = slots
                .get(&(entity_id.to_string(), level))
                .cloned()
                .unwrap_or_default();
            let (sent, claimed_at, event_id) = match level {
                ConversionLevel::Interest => (
                    &mut entity.level1_sent,
                    &mut entity.level1_claimed_at,
                    &mut entity.level1_event_id,
                ),
                ConversionLevel::Qualified => (
                    &mut entity.level2_sent,
                    &mut entity.level2_claimed_at,
                    &mut entity.level2_event_id,
                ),
                ConversionLevel::Scheduled => (
                    &mut entity.level3_sent,
                    &mut entity.level3_claimed_at,
                    &mut entity.level3_event_id,
                ),
            };
            *sent = slot.sent;
            *claimed_at = slot.claimed_at;
            *event_id = slot.provider_event_id;
        }
        Ok(Some(entity))
    }

    async fn reconcile_stale(&self, older_than: Duration) -> Result<u64, DeliveryError> {
        let cutoff = Utc::now() - older_than;
        let mut reset = 0;
        for ((entity_id, level), slot) in lock(&self.slots).iter_mut() {
            let stale = slot.sent
                && slot.provider_event_id.is_none()
                && slot.claimed_at.is_some_and(|at| at < cutoff);
            let delivered = self
                .audit
                .as_ref()
                .is_some_and(|audit| audit.has_success(entity_id, *level));
            if stale && !delivered {
                *slot = ClaimSlot::default();
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::models::{DeliveryAttempt, Provider};
    use uuid::Uuid;

    fn attempt(entity_id: &str, status: AuditStatus) -> DeliveryAttempt {
        DeliveryAttempt {
            id: Uuid::new_v4(),
            provider: Provider::Meta,
            level: ConversionLevel::Qualified,
            entity_id: Some(entity_id.to_string()),
            event_id: Some(format!("{}_2", entity_id)),
            status,
            correlation_id: Uuid::new_v4(),
            request_payload: None,
            response_payload: None,
            error_message: None,
            duration_ms: 5,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryClaimStore::new();
        assert_eq!(
            store.claim("E1", ConversionLevel::Qualified).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store.claim("E1", ConversionLevel::Qualified).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        // Other levels are independent slots.
        assert_eq!(
            store.claim("E1", ConversionLevel::Scheduled).await.unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(InMemoryClaimStore::new());
        let mut handles = vec![];
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim("E7", ConversionLevel::Interest).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() == ClaimOutcome::Claimed {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_rollback_allows_reclaim() {
        let store = InMemoryClaimStore::new();
        store.claim("E1", ConversionLevel::Interest).await.unwrap();
        store.rollback("E1", ConversionLevel::Interest).await.unwrap();
        assert_eq!(store.slot("E1", ConversionLevel::Interest), ClaimSlot::default());
        assert_eq!(
            store.claim("E1", ConversionLevel::Interest).await.unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test]
    async fn test_commit_requires_claim() {
        let store = InMemoryClaimStore::new();
        assert!(store
            .commit("E1", ConversionLevel::Interest, "evt")
            .await
            .is_err());

        store.claim("E1", ConversionLevel::Interest).await.unwrap();
        store
            .commit("E1", ConversionLevel::Interest, "evt")
            .await
            .unwrap();
        let slot = store.slot("E1", ConversionLevel::Interest);
        assert!(slot.sent);
        assert_eq!(slot.provider_event_id.as_deref(), Some("evt"));
    }

    #[tokio::test]
    async fn test_reconcile_resets_only_stale_uncommitted_claims() {
        let store = InMemoryClaimStore::new();
        let old = Utc::now() - Duration::minutes(30);

        store.claim("stale", ConversionLevel::Interest).await.unwrap();
        store.set_claimed_at("stale", ConversionLevel::Interest, old);

        store.claim("done", ConversionLevel::Interest).await.unwrap();
        store
            .commit("done", ConversionLevel::Interest, "evt")
            .await
            .unwrap();
        store.set_claimed_at("done", ConversionLevel::Interest, old);

        store.claim("fresh", ConversionLevel::Interest).await.unwrap();

        let reset = store.reconcile_stale(Duration::minutes(15)).await.unwrap();
        assert_eq!(reset, 1);
        assert!(!store.slot("stale", ConversionLevel::Interest).sent);
        assert!(store.slot("done", ConversionLevel::Interest).sent);
        assert!(store.slot("fresh", ConversionLevel::Interest).sent);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_slots_with_successful_attempt() {
        let audit = Arc::new(InMemoryAuditSink::new());
        let store = InMemoryClaimStore::new().with_audit(audit.clone());
        let old = Utc::now() - Duration::minutes(30);

        // Delivered, but the commit never landed.
        store.claim("sent", ConversionLevel::Qualified).await.unwrap();
        store.set_claimed_at("sent", ConversionLevel::Qualified, old);
        audit.append(&attempt("sent", AuditStatus::Success)).await.unwrap();

        store.claim("failed", ConversionLevel::Qualified).await.unwrap();
        store.set_claimed_at("failed", ConversionLevel::Qualified, old);
        audit.append(&attempt("failed", AuditStatus::Error)).await.unwrap();

        let reset = store.reconcile_stale(Duration::minutes(15)).await.unwrap();
        assert_eq!(reset, 1);
        assert!(store.slot("sent", ConversionLevel::Qualified).sent);
        assert!(!store.slot("failed", ConversionLevel::Qualified).sent);
    }

    #[tokio::test]
    async fn test_fetch_entity_reflects_slots() {
        let store = InMemoryClaimStore::new();
        store.insert_entity(ConversionEntity::new(
            "E1",
            Some("dir-1".into()),
            Default::default(),
        ));
        store.claim("E1", ConversionLevel::Qualified).await.unwrap();
        store
            .commit("E1", ConversionLevel::Qualified, "E1_2")
            .await
            .unwrap();

        let entity = store.fetch_entity("E1").await.unwrap().unwrap();
        assert!(!entity.level1_sent);
        assert!(entity.level2_sent);
        assert_eq!(entity.level2_event_id.as_deref(), Some("E1_2"));
        assert!(store.fetch_entity("missing").await.unwrap().is_none());
    }

    #[test]
    fn test_level_columns() {
        let cols = level_columns(ConversionLevel::Scheduled);
        assert_eq!(cols.sent, "level3_sent");
        assert_eq!(cols.claimed_at, "level3_claimed_at");
        assert_eq!(cols.event_id, "level3_event_id");
    }
}
