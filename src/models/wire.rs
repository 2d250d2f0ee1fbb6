//! Strict boundary schemas (spec section 9, "dynamic/untyped payloads →
//! schemas"): the inbound reply webhook body, and the three pub/sub payload
//! shapes published on the Event Bus and re-emitted over SSE. Unknown fields
//! are ignored by serde's default behavior; required fields are validated by
//! simply being non-`Option` so a missing one is a deserialize error, which
//! HTTP boundaries turn into a 400.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /api/webhooks/reply` (spec section 6).
#[derive(Debug, Clone, Deserialize)]
pub struct InboundReplyPayload {
    pub from: String,
    pub to: String,
    pub subject: Option<String>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub message_id: Option<String>,
}

/// `campaign:new` pub/sub payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignLifecycleEvent {
    pub id: Uuid,
    pub status: Option<String>,
    pub totals: Option<crate::models::campaign::Totals>,
    pub health: Option<serde_json::Value>,
}

/// `campaign:{id}:contact_update` pub/sub payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactUpdateEvent {
    pub campaign_id: Uuid,
    pub contact_id: Uuid,
    pub status: Option<String>,
    pub attempts: Option<i32>,
    pub bg_attempts: Option<i32>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub event: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_open_at: Option<DateTime<Utc>>,
    pub last_click_at: Option<DateTime<Utc>>,
    pub replies_count: Option<i32>,
    pub last_reply_at: Option<DateTime<Utc>>,
}

impl ContactUpdateEvent {
    pub fn new(campaign_id: Uuid, contact_id: Uuid) -> Self {
        Self {
            campaign_id,
            contact_id,
            ..Default::default()
        }
    }
}

/// `campaign:{id}:events` pub/sub payload — a thin wrapper around the
/// append-only `CampaignEvent` used for live notification rather than
/// storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignNotification {
    pub campaign_id: Uuid,
    pub contact_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
}
