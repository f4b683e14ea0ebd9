//! TikTok Events API adapter.
//!
//! `POST {base_url}/event/track/` authenticated by the `Access-Token` header.
//! The body's `code` is `0` on acceptance regardless of HTTP status.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{
    hash_identity, merge_custom_data, LevelEvent, ParsedResponse, PayloadContext, ProviderAdapter,
};
use crate::errors::DeliveryError;
use crate::models::{ConversionLevel, HashedIdentity, Identity, Provider};
use crate::transport::ProviderRequest;

// One event name for every level; `properties.event_level` tells them apart.
const LEVEL_EVENTS: &[LevelEvent] = &[
    LevelEvent {
        level: ConversionLevel::Interest,
        event_name: "SubmitForm",
    },
    LevelEvent {
        level: ConversionLevel::Qualified,
        event_name: "SubmitForm",
    },
    LevelEvent {
        level: ConversionLevel::Scheduled,
        event_name: "SubmitForm",
    },
];

#[derive(Debug, Clone, Default)]
pub struct TikTokAdapter {
    test_event_code: Option<String>,
}

impl TikTokAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_test_event_code(mut self, code: Option<String>) -> Self {
        self.test_event_code = code.filter(|c| !c.trim().is_empty());
        self
    }
}

#[derive(Debug, Deserialize)]
struct TikTokResponse {
    code: Option<i64>,
    message: Option<String>,
    request_id: Option<String>,
}

impl ProviderAdapter for TikTokAdapter {
    fn provider(&self) -> Provider {
        Provider::TikTok
    }

    fn level_events(&self) -> &'static [LevelEvent] {
        LEVEL_EVENTS
    }

    fn select_identity(&self, identity: &Identity) -> Result<HashedIdentity, DeliveryError> {
        hash_identity(identity, true)
    }

    fn build_payload(&self, ctx: &PayloadContext<'_>) -> Result<ProviderRequest, DeliveryError> {
        let event = self.event_for(ctx.level)?;

        let mut user = Map::new();
        if let Some(ref phone) = ctx.identity.phone_hash {
            user.insert("phone".to_string(), json!(phone));
        }
        if let Some(ref email) = ctx.identity.email_hash {
            user.insert("email".to_string(), json!(email));
        }
        if let Some(ref click) = ctx.identity.click_id {
            user.insert("ttclid".to_string(), json!(click));
        }

        let mut properties = Map::new();
        properties.insert("event_level".to_string(), json!(ctx.level.as_u8()));
        merge_custom_data(&mut properties, ctx.custom_data);

        let mut body = json!({
            "event_source": "crm",
            "event_source_id": ctx.credentials.pixel_id,
            "data": [{
                "event": event.event_name,
                "event_time": ctx.event_time,
                "event_id": ctx.event_id,
                "user": user,
                "properties": properties,
            }],
        });
        if let Some(ref code) = self.test_event_code {
            body["test_event_code"] = json!(code);
        }

        let url = format!("{}/event/track/", ctx.base_url.trim_end_matches('/'));
        Ok(ProviderRequest::new(url, body)
            .with_header("Access-Token", &ctx.credentials.access_token))
    }

    fn parse_response(&self, status: u16, body: &str, event_id: &str) -> ParsedResponse {
        let parsed: Option<TikTokResponse> = serde_json::from_str(body).ok();
        let trace_id = parsed.as_ref().and_then(|p| p.request_id.clone());

        match parsed.as_ref().and_then(|p| p.code) {
            Some(0) if (200..300).contains(&status) => ParsedResponse::accepted(event_id, trace_id),
            Some(code) => ParsedResponse::rejected(
                format!(
                    "TikTok error {}: {}",
                    code,
                    parsed
                        .as_ref()
                        .and_then(|p| p.message.as_deref())
                        .unwrap_or("no message")
                ),
                trace_id,
            ),
            None => ParsedResponse::rejected(
                format!("TikTok returned {} without a result code", status),
                trace_id,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderCredentials;
    use crate::pii;

    #[test]
    fn test_same_event_for_every_level() {
        let adapter = TikTokAdapter::new();
        for level in ConversionLevel::ALL {
            assert_eq!(adapter.event_for(level).unwrap().event_name, "SubmitForm");
        }
    }

    #[test]
    fn test_payload_shape() {
        let creds = ProviderCredentials::new("CPIXEL", "TT-TOKEN");
        let identity = HashedIdentity {
            phone_hash: Some(pii::hash("15551234567")),
            email_hash: Some(pii::hash("a@b.com")),
            click_id: Some("ttclid-1".into()),
        };
        let request = TikTokAdapter::new()
            .build_payload(&PayloadContext {
                base_url: "https://business-api.tiktok.com/open_api/v1.3",
                credentials: &creds,
                level: ConversionLevel::Scheduled,
                event_id: "E9_3",
                identity: &identity,
                custom_data: None,
                event_time: 1_700_000_000,
            })
            .unwrap();

        assert_eq!(
            request.url,
            "https://business-api.tiktok.com/open_api/v1.3/event/track/"
        );
        assert_eq!(
            request.headers,
            vec![("Access-Token".to_string(), "TT-TOKEN".to_string())]
        );
        assert_eq!(request.body["event_source_id"], "CPIXEL");
        let event = &request.body["data"][0];
        assert_eq!(event["event"], "SubmitForm");
        assert_eq!(event["event_id"], "E9_3");
        assert_eq!(event["properties"]["event_level"], 3);
        assert_eq!(event["user"]["ttclid"], "ttclid-1");
        assert_eq!(event["user"]["email"], pii::hash("a@b.com"));
        // Token travels in the header only.
        assert!(!request.body.to_string().contains("TT-TOKEN"));
    }

    #[test]
    fn test_parse_success_and_rejection() {
        let adapter = TikTokAdapter::new();
        let ok = adapter.parse_response(
            200,
            r#"{"code":0,"message":"OK","request_id":"r-1","data":{}}"#,
            "E9_3",
        );
        assert!(ok.success);
        assert_eq!(ok.provider_event_id.as_deref(), Some("E9_3"));
        assert_eq!(ok.trace_id.as_deref(), Some("r-1"));

        let rejected = adapter.parse_response(
            200,
            r#"{"code":40002,"message":"Invalid event_source_id","request_id":"r-2"}"#,
            "E9_3",
        );
        assert!(!rejected.success);
        assert_eq!(
            rejected.error.as_deref(),
            Some("TikTok error 40002: Invalid event_source_id")
        );

        let garbage = adapter.parse_response(404, "<html>", "E9_3");
        assert!(!garbage.success);
    }
}
