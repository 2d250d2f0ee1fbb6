use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Open,
    Click,
    Reply,
    FollowupSent,
    FollowupSkipped,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Open => "open",
            EventType::Click => "click",
            EventType::Reply => "reply",
            EventType::FollowupSent => "followup_sent",
            EventType::FollowupSkipped => "followup_skipped",
        }
    }
}

/// Append-only engagement record (spec section 3). Never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignEvent {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub contact_id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub url: Option<String>,
    pub ua: Option<String>,
    pub ip: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Freeform diagnostic context, e.g. `note:"decode_failed"` for a click
    /// whose `u` parameter could not be decoded (spec section 4.4).
    pub trace: Option<serde_json::Value>,
}

impl CampaignEvent {
    pub fn new(campaign_id: Uuid, contact_id: Uuid, kind: EventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            contact_id,
            kind,
            url: None,
            ua: None,
            ip: None,
            created_at: Utc::now(),
            trace: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_trace(mut self, trace: serde_json::Value) -> Self {
        self.trace = Some(trace);
        self
    }
}
