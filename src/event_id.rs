//! Deterministic external event identifiers.
//!
//! Providers deduplicate on `event_id`, so the same logical conversion must
//! produce the same id on every retry. Strategies are tried in a fixed order
//! and the first one with usable input wins.

use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::models::{ConversionLevel, Identity};
use crate::pii;

/// Which identity signal produced an event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventIdStrategy {
    /// Click token on the first level, used verbatim.
    ClickIdFirstLevel,
    EntityId,
    PhoneHash,
    EmailHash,
    ClickId,
    Random,
}

impl EventIdStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventIdStrategy::ClickIdFirstLevel => "click_id_first_level",
            EventIdStrategy::EntityId => "entity_id",
            EventIdStrategy::PhoneHash => "phone_hash",
            EventIdStrategy::EmailHash => "email_hash",
            EventIdStrategy::ClickId => "click_id",
            EventIdStrategy::Random => "random",
        }
    }

    /// Every strategy except `Random` is a pure function of its inputs.
    pub fn is_deterministic(&self) -> bool {
        !matches!(self, EventIdStrategy::Random)
    }
}

impl fmt::Display for EventIdStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventId {
    pub value: String,
    pub strategy: EventIdStrategy,
}

const HASH_PREFIX_LEN: usize = 16;

/// Derives the idempotency key for `(entity, level)` from the available signals.
pub fn generate_event_id(
    entity_id: Option<&str>,
    level: ConversionLevel,
    identity: &Identity,
) -> EventId {
    let entity_id = entity_id.map(str::trim).filter(|id| !id.is_empty());

    let (value, strategy) = if let (Some(click), ConversionLevel::Interest) =
        (identity.click_id(), level)
    {
        (click.to_string(), EventIdStrategy::ClickIdFirstLevel)
    } else if let Some(id) = entity_id {
        (format!("{}_{}", id, level), EventIdStrategy::EntityId)
    } else if let Some(digest) = identity.phone().and_then(|p| pii::hash_phone(p).ok()) {
        (
            format!("ph_{}_{}", &digest[..HASH_PREFIX_LEN], level),
            EventIdStrategy::PhoneHash,
        )
    } else if let Some(digest) = identity.email().and_then(|e| pii::hash_email(e).ok()) {
        (
            format!("em_{}_{}", &digest[..HASH_PREFIX_LEN], level),
            EventIdStrategy::EmailHash,
        )
    } else if let Some(click) = identity.click_id() {
        (format!("{}_{}", click, level), EventIdStrategy::ClickId)
    } else {
        (
            format!("rnd_{}_{}", Uuid::new_v4().simple(), level),
            EventIdStrategy::Random,
        )
    };

    if !strategy.is_deterministic() {
        tracing::warn!(
            "No identity signal for event id at level {}, using random id {}",
            level,
            value
        );
    } else {
        tracing::debug!("Event id {} generated via {}", value, strategy);
    }

    EventId { value, strategy }
}
