use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Idempotent by `fingerprint` (spec section 3/4.8): the inbound message-id
/// when present, else `SHA256(from|to|subject|text)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub contact_id: Uuid,
    pub fingerprint: String,
    pub from: String,
    pub to: String,
    pub subject: Option<String>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub message_id: Option<String>,
    pub received_at: DateTime<Utc>,
}
