//! Meta Conversions API adapter.
//!
//! `POST {base_url}/{pixel_id}/events` with `{ data: [...], access_token }`.
//! A 2xx body carrying `events_received >= 1` means accepted.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::str::FromStr;

use super::{
    hash_identity, merge_custom_data, LevelEvent, ParsedResponse, PayloadContext, ProviderAdapter,
};
use crate::errors::DeliveryError;
use crate::models::{ConversionLevel, HashedIdentity, Identity, Provider};
use crate::transport::ProviderRequest;

const LEVEL_EVENTS: &[LevelEvent] = &[
    LevelEvent {
        level: ConversionLevel::Interest,
        event_name: "Lead",
    },
    LevelEvent {
        level: ConversionLevel::Qualified,
        event_name: "CompleteRegistration",
    },
    LevelEvent {
        level: ConversionLevel::Scheduled,
        event_name: "Schedule",
    },
];

/// Delivery channel, which decides action_source and the permitted identity fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetaChannel {
    /// CRM-originated events: hashed phone/email plus the optional click id.
    #[default]
    Crm,
    /// WhatsApp click-to-chat leads: no PII, `ctwa_clid` required.
    BusinessMessaging,
}

impl MetaChannel {
    fn action_source(&self) -> &'static str {
        match self {
            MetaChannel::Crm => "system_generated",
            MetaChannel::BusinessMessaging => "business_messaging",
        }
    }
}

impl FromStr for MetaChannel {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crm" | "system_generated" => Ok(MetaChannel::Crm),
            "business_messaging" | "whatsapp" => Ok(MetaChannel::BusinessMessaging),
            other => Err(DeliveryError::Validation(format!(
                "unknown Meta channel '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetaAdapter {
    channel: MetaChannel,
    test_event_code: Option<String>,
}

impl MetaAdapter {
    pub fn new(channel: MetaChannel) -> Self {
        Self {
            channel,
            test_event_code: None,
        }
    }

    /// Routes events to the Events Manager test tab instead of live data.
    pub fn with_test_event_code(mut self, code: Option<String>) -> Self {
        self.test_event_code = code.filter(|c| !c.trim().is_empty());
        self
    }

    fn user_data(&self, identity: &HashedIdentity) -> Value {
        let mut user = Map::new();
        if let Some(ref ph) = identity.phone_hash {
            user.insert("ph".to_string(), json!([ph]));
        }
        if let Some(ref em) = identity.email_hash {
            user.insert("em".to_string(), json!([em]));
        }
        if let Some(ref click) = identity.click_id {
            let key = match self.channel {
                MetaChannel::Crm => "fbc",
                MetaChannel::BusinessMessaging => "ctwa_clid",
            };
            user.insert(key.to_string(), json!(click));
        }
        Value::Object(user)
    }
}

#[derive(Debug, Deserialize)]
struct MetaResponse {
    events_received: Option<i64>,
    fbtrace_id: Option<String>,
    error: Option<MetaErrorBody>,
}

#[derive(Debug, Deserialize)]
struct MetaErrorBody {
    message: Option<String>,
    code: Option<i64>,
    fbtrace_id: Option<String>,
}

impl ProviderAdapter for MetaAdapter {
    fn provider(&self) -> Provider {
        Provider::Meta
    }

    fn level_events(&self) -> &'static [LevelEvent] {
        LEVEL_EVENTS
    }

    fn select_identity(&self, identity: &Identity) -> Result<HashedIdentity, DeliveryError> {
        match self.channel {
            MetaChannel::Crm => hash_identity(identity, true),
            MetaChannel::BusinessMessaging => {
                if identity.click_id().is_none() {
                    return Err(DeliveryError::Validation(
                        "business messaging events require a ctwa_clid".to_string(),
                    ));
                }
                hash_identity(identity, false)
            }
        }
    }

    fn build_payload(&self, ctx: &PayloadContext<'_>) -> Result<ProviderRequest, DeliveryError> {
        let event = self.event_for(ctx.level)?;

        let mut custom_data = Map::new();
        custom_data.insert("event_level".to_string(), json!(ctx.level.as_u8()));
        merge_custom_data(&mut custom_data, ctx.custom_data);

        let mut data = json!({
            "event_name": event.event_name,
            "event_time": ctx.event_time,
            "event_id": ctx.event_id,
            "action_source": self.channel.action_source(),
            "user_data": self.user_data(ctx.identity),
            "custom_data": custom_data,
        });
        if self.channel == MetaChannel::BusinessMessaging {
            data["messaging_channel"] = json!("whatsapp");
        }

        let mut body = json!({
            "data": [data],
            "access_token": ctx.credentials.access_token,
        });
        if let Some(ref code) = self.test_event_code {
            body["test_event_code"] = json!(code);
        }

        let url = format!(
            "{}/{}/events",
            ctx.base_url.trim_end_matches('/'),
            ctx.credentials.pixel_id
        );
        Ok(ProviderRequest::new(url, body))
    }

    fn parse_response(&self, status: u16, body: &str, event_id: &str) -> ParsedResponse {
        let parsed: Option<MetaResponse> = serde_json::from_str(body).ok();

        if let Some(err) = parsed.as_ref().and_then(|p| p.error.as_ref()) {
            let message = match (err.code, err.message.as_deref()) {
                (Some(code), Some(msg)) => format!("Meta error {}: {}", code, msg),
                (None, Some(msg)) => format!("Meta error: {}", msg),
                _ => format!("Meta returned {} with an error body", status),
            };
            return ParsedResponse::rejected(message, err.fbtrace_id.clone());
        }

        let trace_id = parsed.as_ref().and_then(|p| p.fbtrace_id.clone());
        let received = parsed.as_ref().and_then(|p| p.events_received).unwrap_or(0);

        if (200..300).contains(&status) && received >= 1 {
            ParsedResponse::accepted(event_id, trace_id)
        } else {
            ParsedResponse::rejected(
                format!(
                    "Meta returned {} with events_received={}",
                    status, received
                ),
                trace_id,
            )
        }
    }
}
