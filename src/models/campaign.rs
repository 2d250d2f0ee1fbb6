use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Running,
    Paused,
    Cancelled,
    Completed,
    CompletedWithFailures,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Cancelled => "cancelled",
            CampaignStatus::Completed => "completed",
            CampaignStatus::CompletedWithFailures => "completed_with_failures",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Cancelled | CampaignStatus::Completed | CampaignStatus::CompletedWithFailures
        )
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "running" => CampaignStatus::Running,
            "paused" => CampaignStatus::Paused,
            "cancelled" => CampaignStatus::Cancelled,
            "completed" => CampaignStatus::Completed,
            "completed_with_failures" => CampaignStatus::CompletedWithFailures,
            other => panic!("unknown campaign status in storage: {other}"),
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rule governing whether a follow-up step fires once its delay elapses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpRule {
    Always,
    NoReply,
    Replied,
}

impl FollowUpRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowUpRule::Always => "always",
            FollowUpRule::NoReply => "no_reply",
            FollowUpRule::Replied => "replied",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "always" => FollowUpRule::Always,
            "no_reply" => FollowUpRule::NoReply,
            "replied" => FollowUpRule::Replied,
            other => panic!("unknown follow-up rule in storage: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// base64-encoded payload; the Sender decodes it at send time.
    pub content_base64: String,
}

/// A message step shared by the initial send and each follow-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpDef {
    pub name: Option<String>,
    pub delay_minutes: i64,
    pub rule: FollowUpRule,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
}

/// The `{initial, followUps, contacts}` blob cached verbatim under the Meta
/// Cache's `campaign:{id}:definition` key (spec section 4.3) and persisted
/// in the campaign row so the Finalizer can rebuild it after eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignDefinition {
    pub initial: MessageBody,
    pub follow_ups: Vec<FollowUpDef>,
    pub contacts: Vec<Contact>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Totals {
    pub intended: i64,
    pub processed: i64,
    pub sent: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub intended: i64,
    pub processed: i64,
    pub sent: i64,
    pub failed: i64,
    /// JSON-encoded `CampaignDefinition`.
    pub definition: serde_json::Value,
}

impl Campaign {
    pub fn status(&self) -> CampaignStatus {
        CampaignStatus::from_db(&self.status)
    }

    pub fn totals(&self) -> Totals {
        Totals {
            intended: self.intended,
            processed: self.processed,
            sent: self.sent,
            failed: self.failed,
        }
    }

    pub fn definition(&self) -> Result<CampaignDefinition, serde_json::Error> {
        serde_json::from_value(self.definition.clone())
    }
}

#[derive(Debug, Deserialize)]
pub struct StartCampaignRequest {
    pub name: String,
    pub initial: MessageBody,
    #[serde(default)]
    pub follow_ups: Vec<FollowUpDef>,
    pub contacts: Vec<Contact>,
}
