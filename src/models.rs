use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::DeliveryError;

// ============ Core enums ============

/// External advertising platform receiving conversion events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Meta,
    TikTok,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Meta => "meta",
            Provider::TikTok => "tiktok",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "meta" | "facebook" => Ok(Provider::Meta),
            "tiktok" => Ok(Provider::TikTok),
            other => Err(DeliveryError::Validation(format!(
                "unknown provider '{}'",
                other
            ))),
        }
    }
}

/// Funnel milestone reported to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConversionLevel {
    Interest = 1,
    Qualified = 2,
    Scheduled = 3,
}

impl ConversionLevel {
    pub const ALL: [ConversionLevel; 3] = [
        ConversionLevel::Interest,
        ConversionLevel::Qualified,
        ConversionLevel::Scheduled,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ConversionLevel {
    type Error = DeliveryError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ConversionLevel::Interest),
            2 => Ok(ConversionLevel::Qualified),
            3 => Ok(ConversionLevel::Scheduled),
            other => Err(DeliveryError::Validation(format!(
                "conversion level must be 1..=3, got {}",
                other
            ))),
        }
    }
}

impl From<ConversionLevel> for u8 {
    fn from(level: ConversionLevel) -> Self {
        level.as_u8()
    }
}

impl fmt::Display for ConversionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Status stored with every audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Error,
    Skipped,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Error => "error",
            AuditStatus::Skipped => "skipped",
        }
    }
}

// ============ Identity & credentials ============

/// Raw identity signals for a lead. Never persisted or sent outward as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Ad-click token (ctwa_clid, fbc, ttclid depending on the channel).
    #[serde(default)]
    pub click_id: Option<String>,
}

impl Identity {
    pub fn phone(&self) -> Option<&str> {
        non_blank(self.phone.as_deref())
    }

    pub fn email(&self) -> Option<&str> {
        non_blank(self.email.as_deref())
    }

    pub fn click_id(&self) -> Option<&str> {
        non_blank(self.click_id.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.phone().is_none() && self.email().is_none() && self.click_id().is_none()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Identity after provider-specific selection and hashing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashedIdentity {
    pub phone_hash: Option<String>,
    pub email_hash: Option<String>,
    pub click_id: Option<String>,
}

/// Pixel/account identifier plus access token for one provider.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub pixel_id: String,
    pub access_token: String,
}

impl ProviderCredentials {
    pub fn new(pixel_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            pixel_id: pixel_id.into(),
            access_token: access_token.into(),
        }
    }

    /// Both fields must carry a non-blank value for a send to be attempted.
    pub fn is_complete(&self) -> bool {
        !self.pixel_id.trim().is_empty() && !self.access_token.trim().is_empty()
    }
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("pixel_id", &self.pixel_id)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

// ============ Database models ============

/// A dialog/lead owned by the CRM, as far as conversion delivery cares.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ConversionEntity {
    pub id: String,
    pub user_account_id: Option<String>,
    pub direction_id: Option<String>,
    #[serde(skip_serializing)]
    pub contact_phone: Option<String>,
    #[serde(skip_serializing)]
    pub contact_email: Option<String>,
    pub click_id: Option<String>,
    pub level1_sent: bool,
    pub level1_claimed_at: Option<DateTime<Utc>>,
    pub level1_event_id: Option<String>,
    pub level2_sent: bool,
    pub level2_claimed_at: Option<DateTime<Utc>>,
    pub level2_event_id: Option<String>,
    pub level3_sent: bool,
    pub level3_claimed_at: Option<DateTime<Utc>>,
    pub level3_event_id: Option<String>,
}

impl ConversionEntity {
    /// An unclaimed entity with the given identity fields.
    pub fn new(id: impl Into<String>, direction_id: Option<String>, identity: Identity) -> Self {
        Self {
            id: id.into(),
            user_account_id: None,
            direction_id,
            contact_phone: identity.phone,
            contact_email: identity.email,
            click_id: identity.click_id,
            level1_sent: false,
            level1_claimed_at: None,
            level1_event_id: None,
            level2_sent: false,
            level2_claimed_at: None,
            level2_event_id: None,
            level3_sent: false,
            level3_claimed_at: None,
            level3_event_id: None,
        }
    }

    pub fn identity(&self) -> Identity {
        Identity {
            phone: self.contact_phone.clone(),
            email: self.contact_email.clone(),
            click_id: self.click_id.clone(),
        }
    }

    pub fn is_sent(&self, level: ConversionLevel) -> bool {
        match level {
            ConversionLevel::Interest => self.level1_sent,
            ConversionLevel::Qualified => self.level2_sent,
            ConversionLevel::Scheduled => self.level3_sent,
        }
    }
}

/// One row of the append-only delivery audit log.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub provider: Provider,
    pub level: ConversionLevel,
    pub entity_id: Option<String>,
    pub event_id: Option<String>,
    pub status: AuditStatus,
    pub correlation_id: Uuid,
    pub request_payload: Option<Value>,
    pub response_payload: Option<Value>,
    pub error_message: Option<String>,
    pub duration_ms: i64,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

// ============ API models ============

/// Inbound request to report one conversion.
#[derive(Debug, Clone, Deserialize)]
pub struct SendEventRequest {
    pub provider: Provider,
    #[serde(default)]
    pub credentials: Option<ProviderCredentials>,
    pub level: ConversionLevel,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub custom_data: Option<Value>,
}

/// Structured outcome returned to every caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DeliveryError>,
}

impl DeliveryResult {
    pub fn sent(event_id: String, provider_event_id: String) -> Self {
        Self {
            success: true,
            provider_event_id: Some(provider_event_id),
            event_id: Some(event_id),
            error: None,
        }
    }

    pub fn failed(error: DeliveryError, event_id: Option<String>) -> Self {
        Self {
            success: false,
            provider_event_id: None,
            event_id,
            error: Some(error),
        }
    }

    pub fn already_claimed() -> Self {
        Self::failed(DeliveryError::AlreadyClaimed, None)
    }

    pub fn is_already_claimed(&self) -> bool {
        matches!(self.error, Some(DeliveryError::AlreadyClaimed))
    }

    /// Sent now, or by someone else earlier: nothing left for the caller to do.
    pub fn is_settled(&self) -> bool {
        self.success || self.is_already_claimed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_conversion() {
        assert_eq!(
            ConversionLevel::try_from(2).unwrap(),
            ConversionLevel::Qualified
        );
        assert!(ConversionLevel::try_from(0).is_err());
        assert!(ConversionLevel::try_from(4).is_err());
    }

    #[test]
    fn test_level_deserializes_from_number() {
        let level: ConversionLevel = serde_json::from_str("3").unwrap();
        assert_eq!(level, ConversionLevel::Scheduled);
        assert!(serde_json::from_str::<ConversionLevel>("7").is_err());
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!("Meta".parse::<Provider>().unwrap(), Provider::Meta);
        assert_eq!("tiktok".parse::<Provider>().unwrap(), Provider::TikTok);
        assert!("snap".parse::<Provider>().is_err());
        let p: Provider = serde_json::from_str("\"tiktok\"").unwrap();
        assert_eq!(p, Provider::TikTok);
    }

    #[test]
    fn test_credentials_debug_redacts_token() {
        let creds = ProviderCredentials::new("123", "super-secret");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("123"));
        assert!(!printed.contains("super-secret"));
    }

    #[test]
    fn test_identity_blank_fields_are_absent() {
        let identity = Identity {
            phone: Some("   ".into()),
            email: None,
            click_id: Some("".into()),
        };
        assert!(identity.is_empty());
    }

    #[test]
    fn test_already_claimed_is_settled() {
        let result = DeliveryResult::already_claimed();
        assert!(!result.success);
        assert!(result.is_settled());
    }
}
