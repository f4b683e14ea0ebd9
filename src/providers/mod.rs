//! Provider adapters.
//!
//! An adapter owns everything provider-specific: the level → event table, which
//! identity fields may be sent, the request shape and how a response body is
//! judged. Claims, retries and breakers live in the engine and never branch on
//! the provider.

pub mod meta;
pub mod tiktok;

use serde_json::Value;

use crate::errors::DeliveryError;
use crate::models::{ConversionLevel, HashedIdentity, Identity, Provider, ProviderCredentials};
use crate::pii;
use crate::transport::ProviderRequest;

pub use meta::{MetaAdapter, MetaChannel};
pub use tiktok::TikTokAdapter;

/// One row of a provider's level mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelEvent {
    pub level: ConversionLevel,
    pub event_name: &'static str,
}

/// Everything an adapter needs to build one request.
#[derive(Debug, Clone, Copy)]
pub struct PayloadContext<'a> {
    pub base_url: &'a str,
    pub credentials: &'a ProviderCredentials,
    pub level: ConversionLevel,
    pub event_id: &'a str,
    pub identity: &'a HashedIdentity,
    pub custom_data: Option<&'a Value>,
    /// Unix seconds.
    pub event_time: i64,
}

/// Provider verdict on a response that made it through the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub success: bool,
    pub provider_event_id: Option<String>,
    /// Provider-side request/trace id, when one is returned.
    pub trace_id: Option<String>,
    pub error: Option<String>,
}

impl ParsedResponse {
    pub fn accepted(event_id: &str, trace_id: Option<String>) -> Self {
        Self {
            success: true,
            provider_event_id: Some(event_id.to_string()),
            trace_id,
            error: None,
        }
    }

    pub fn rejected(error: String, trace_id: Option<String>) -> Self {
        Self {
            success: false,
            provider_event_id: None,
            trace_id,
            error: Some(error),
        }
    }
}

pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Static level → event mapping.
    fn level_events(&self) -> &'static [LevelEvent];

    /// Picks the identity fields this provider/channel accepts and hashes PII.
    fn select_identity(&self, identity: &Identity) -> Result<HashedIdentity, DeliveryError>;

    fn build_payload(&self, ctx: &PayloadContext<'_>) -> Result<ProviderRequest, DeliveryError>;

    fn parse_response(&self, status: u16, body: &str, event_id: &str) -> ParsedResponse;

    fn event_for(&self, level: ConversionLevel) -> Result<&'static LevelEvent, DeliveryError> {
        self.level_events()
            .iter()
            .find(|entry| entry.level == level)
            .ok_or_else(|| {
                DeliveryError::Validation(format!(
                    "{} has no event mapped for level {}",
                    self.provider(),
                    level
                ))
            })
    }
}

/// Hashes the permitted identity fields.
///
/// A malformed phone or email is dropped when another signal survives and is
/// an `InvalidIdentity` error when it was the only one.
pub fn hash_identity(identity: &Identity, allow_pii: bool) -> Result<HashedIdentity, DeliveryError> {
    let mut hashed = HashedIdentity {
        click_id: identity.click_id().map(String::from),
        ..HashedIdentity::default()
    };
    let mut first_error = None;

    if allow_pii {
        if let Some(phone) = identity.phone() {
            match pii::hash_phone(phone) {
                Ok(digest) => hashed.phone_hash = Some(digest),
                Err(e) => first_error = Some(e),
            }
        }
        if let Some(email) = identity.email() {
            match pii::hash_email(email) {
                Ok(digest) => hashed.email_hash = Some(digest),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
    }

    let has_signal =
        hashed.phone_hash.is_some() || hashed.email_hash.is_some() || hashed.click_id.is_some();

    match (has_signal, first_error) {
        (true, Some(e)) => {
            tracing::warn!("Dropping unusable identity field: {}", e);
            Ok(hashed)
        }
        (true, None) => Ok(hashed),
        (false, Some(e)) => Err(e),
        (false, None) => Err(DeliveryError::Validation(
            "no phone, email or click id available".to_string(),
        )),
    }
}

/// Merges caller-supplied custom data into a provider properties object.
/// Keys the adapter sets itself win.
pub(crate) fn merge_custom_data(base: &mut serde_json::Map<String, Value>, extra: Option<&Value>) {
    if let Some(Value::Object(extra)) = extra {
        for (key, value) in extra {
            base.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}
