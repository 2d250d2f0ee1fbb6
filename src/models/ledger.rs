use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    ManualHold,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Sending => "sending",
            LedgerStatus::Sent => "sent",
            LedgerStatus::Failed => "failed",
            LedgerStatus::ManualHold => "manual_hold",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "pending" => LedgerStatus::Pending,
            "sending" => LedgerStatus::Sending,
            "sent" => LedgerStatus::Sent,
            "failed" => LedgerStatus::Failed,
            "manual_hold" => LedgerStatus::ManualHold,
            other => panic!("unknown ledger status in storage: {other}"),
        }
    }
}

impl std::fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpStepStatus {
    Scheduled,
    Sent,
    Skipped,
}

impl FollowUpStepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowUpStepStatus::Scheduled => "scheduled",
            FollowUpStepStatus::Sent => "sent",
            FollowUpStepStatus::Skipped => "skipped",
        }
    }
}

/// One entry of `LedgerRow.follow_up_plan`, mirroring `campaign.follow_ups[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpPlanEntry {
    pub status: FollowUpStepStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub skipped_at: Option<DateTime<Utc>>,
    pub skipped_reason: Option<String>,
}

impl FollowUpPlanEntry {
    pub fn scheduled(at: DateTime<Utc>) -> Self {
        Self {
            status: FollowUpStepStatus::Scheduled,
            scheduled_for: Some(at),
            sent_at: None,
            skipped_at: None,
            skipped_reason: None,
        }
    }
}

/// The per-`(campaign_id, contact_id)` authoritative row (spec section 3).
/// `current_step_index` is `-1` for the initial send, `0..N-1` for follow-ups.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerRow {
    pub campaign_id: Uuid,
    pub contact_id: Uuid,
    pub email: String,
    pub status: String,
    pub attempts: i32,
    pub bg_attempts: i32,
    pub current_step_index: i32,
    pub current_step_name: Option<String>,
    pub current_step_attempts: i32,
    pub current_step_bg_attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_click_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub replied: bool,
    pub replies_count: i32,
    pub last_reply_at: Option<DateTime<Utc>>,
    pub last_reply_snippet: Option<String>,
    /// JSON-encoded `Vec<FollowUpPlanEntry>`.
    pub follow_up_plan: serde_json::Value,
}

impl LedgerRow {
    pub fn status(&self) -> LedgerStatus {
        LedgerStatus::from_db(&self.status)
    }

    pub fn follow_up_plan(&self) -> Vec<FollowUpPlanEntry> {
        serde_json::from_value(self.follow_up_plan.clone()).unwrap_or_default()
    }

    pub fn is_initial_step(&self) -> bool {
        self.current_step_index < 0
    }
}
