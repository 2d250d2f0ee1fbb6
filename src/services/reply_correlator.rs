//! Reply Correlator (C10), spec section 4.8. Plus-address recipients carry
//! the routing key (`local+{campaignId}+{contactId}@domain`); the
//! fingerprint (`messageId`, or `SHA256(from|to|subject|text)` otherwise)
//! makes re-delivery of the same webhook idempotent.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::event::{CampaignEvent, EventType};
use crate::models::ids::parse_id;
use crate::models::reply::Reply;
use crate::models::wire::{ContactUpdateEvent, InboundReplyPayload};
use crate::services::traits::{EventBusBackend, EventLogBackend, LedgerBackend, ReplyBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    Duplicate,
    Unroutable,
}

pub struct ReplyCorrelator {
    replies: Arc<dyn ReplyBackend>,
    ledger: Arc<dyn LedgerBackend>,
    events: Arc<dyn EventLogBackend>,
    bus: Arc<dyn EventBusBackend>,
}

struct Recipient {
    campaign_id: Uuid,
    contact_id: Uuid,
}

impl ReplyCorrelator {
    pub fn new(
        replies: Arc<dyn ReplyBackend>,
        ledger: Arc<dyn LedgerBackend>,
        events: Arc<dyn EventLogBackend>,
        bus: Arc<dyn EventBusBackend>,
    ) -> Self {
        Self { replies, ledger, events, bus }
    }

    pub async fn ingest(&self, payload: InboundReplyPayload) -> anyhow::Result<IngestOutcome> {
        let recipient = match parse_plus_address(&payload.to) {
            Some(r) => r,
            None => return Ok(IngestOutcome::Unroutable),
        };

        let fingerprint = compute_fingerprint(&payload);
        if self.replies.exists(&fingerprint).await? {
            return Ok(IngestOutcome::Duplicate);
        }

        let now = Utc::now();
        let snippet: String = payload.text.as_deref().unwrap_or_default().chars().take(500).collect();

        let reply = Reply {
            id: Uuid::new_v4(),
            campaign_id: recipient.campaign_id,
            contact_id: recipient.contact_id,
            fingerprint,
            from: payload.from.clone(),
            to: payload.to.clone(),
            subject: payload.subject.clone(),
            text: payload.text.clone(),
            html: payload.html.clone(),
            message_id: payload.message_id.clone(),
            received_at: now,
        };
        self.replies.insert(&reply).await?;
        self.events
            .append(&CampaignEvent::new(recipient.campaign_id, recipient.contact_id, EventType::Reply))
            .await?;
        self.ledger
            .record_reply(recipient.campaign_id, recipient.contact_id, &snippet, now)
            .await?;

        let mut evt = ContactUpdateEvent::new(recipient.campaign_id, recipient.contact_id);
        evt.event = Some("reply".to_string());
        evt.last_reply_at = Some(now);
        if let Some(row) = self.ledger.get(recipient.campaign_id, recipient.contact_id).await? {
            evt.replies_count = Some(row.replies_count);
        }
        self.bus.publish_contact(&evt).await?;

        Ok(IngestOutcome::Inserted)
    }
}

fn parse_plus_address(to: &str) -> Option<Recipient> {
    let local = to.split('@').next()?;
    let mut parts = local.splitn(3, '+');
    let _base = parts.next()?;
    let campaign_raw = parts.next()?;
    let contact_raw = parts.next()?;
    Some(Recipient {
        campaign_id: parse_id(campaign_raw).ok()?.as_uuid(),
        contact_id: parse_id(contact_raw).ok()?.as_uuid(),
    })
}

fn compute_fingerprint(payload: &InboundReplyPayload) -> String {
    if let Some(message_id) = payload.message_id.as_deref() {
        let trimmed = message_id.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(payload.from.as_bytes());
    hasher.update(b"|");
    hasher.update(payload.to.as_bytes());
    hasher.update(b"|");
    hasher.update(payload.subject.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(payload.text.as_deref().unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::traits::{InMemoryBus, InMemoryEventLog, InMemoryLedger, InMemoryReplyStore};

    fn correlator() -> (ReplyCorrelator, Arc<InMemoryLedger>, Arc<InMemoryBus>) {
        let replies = Arc::new(InMemoryReplyStore::default());
        let ledger = Arc::new(InMemoryLedger::default());
        let events = Arc::new(InMemoryEventLog::default());
        let bus = Arc::new(InMemoryBus::default());
        (
            ReplyCorrelator::new(replies, ledger.clone(), events, bus.clone()),
            ledger,
            bus,
        )
    }

    #[tokio::test]
    async fn ingests_and_marks_ledger_replied() {
        let (correlator, ledger, bus) = correlator();
        let campaign_id = Uuid::new_v4();
        let contact_id = Uuid::new_v4();
        ledger.insert_pending(campaign_id, contact_id, "a@gmail.com");

        let payload = InboundReplyPayload {
            from: "a@gmail.com".into(),
            to: format!("campaigns+{campaign_id}+{contact_id}@example.com"),
            subject: Some("Re: hi".into()),
            text: Some("sounds good".into()),
            html: None,
            message_id: Some("<abc@mail>".into()),
        };

        let outcome = correlator.ingest(payload).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Inserted);

        let row = ledger.get(campaign_id, contact_id).await.unwrap().unwrap();
        assert!(row.replied);
        assert_eq!(row.replies_count, 1);
        assert_eq!(bus.contact_events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_fingerprint_is_a_noop() {
        let (correlator, ledger, _bus) = correlator();
        let campaign_id = Uuid::new_v4();
        let contact_id = Uuid::new_v4();
        ledger.insert_pending(campaign_id, contact_id, "a@gmail.com");

        let payload = InboundReplyPayload {
            from: "a@gmail.com".into(),
            to: format!("campaigns+{campaign_id}+{contact_id}@example.com"),
            subject: Some("Re: hi".into()),
            text: Some("sounds good".into()),
            html: None,
            message_id: Some("<dup@mail>".into()),
        };

        assert_eq!(correlator.ingest(payload.clone()).await.unwrap(), IngestOutcome::Inserted);
        assert_eq!(correlator.ingest(payload).await.unwrap(), IngestOutcome::Duplicate);

        let row = ledger.get(campaign_id, contact_id).await.unwrap().unwrap();
        assert_eq!(row.replies_count, 1);
    }

    #[test]
    fn unroutable_without_plus_address() {
        assert!(parse_plus_address("plain@example.com").is_none());
    }

    #[test]
    fn fingerprint_falls_back_to_content_hash_when_no_message_id() {
        let payload = InboundReplyPayload {
            from: "a@b.com".into(),
            to: "c@d.com".into(),
            subject: None,
            text: Some("hi".into()),
            html: None,
            message_id: None,
        };
        let fp = compute_fingerprint(&payload);
        assert_eq!(fp.len(), 64);
    }
}
