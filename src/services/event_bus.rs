//! Event Bus (C1), spec section 4.2/6: Redis pub/sub channels for live
//! updates, plus a bounded durable list backing `campaign:new` so a late SSE
//! subscriber can be handed recent history on connect.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::models::wire::{CampaignLifecycleEvent, CampaignNotification, ContactUpdateEvent};
use crate::services::traits::EventBusBackend;

const CAMPAIGN_NEW_HISTORY_LEN: isize = 200;

pub struct EventBus {
    conn: ConnectionManager,
}

impl EventBus {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub fn contact_channel(campaign_id: uuid::Uuid) -> String {
        format!("campaign:{campaign_id}:contact_update")
    }

    pub fn events_channel(campaign_id: uuid::Uuid) -> String {
        format!("campaign:{campaign_id}:events")
    }

    pub const CAMPAIGN_NEW_CHANNEL: &'static str = "campaign:new";
    const CAMPAIGN_NEW_LIST: &'static str = "campaign:new:history";

    pub async fn recent_campaign_history(&self, limit: isize) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn.lrange(Self::CAMPAIGN_NEW_LIST, 0, limit - 1).await?;
        Ok(items)
    }
}

#[async_trait]
impl EventBusBackend for EventBus {
    async fn publish_campaign(&self, event: &CampaignLifecycleEvent) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(event)?;
        let _: () = conn.publish(Self::CAMPAIGN_NEW_CHANNEL, &payload).await?;
        let _: () = conn.lpush(Self::CAMPAIGN_NEW_LIST, &payload).await?;
        let _: () = conn.ltrim(Self::CAMPAIGN_NEW_LIST, 0, CAMPAIGN_NEW_HISTORY_LEN - 1).await?;
        Ok(())
    }

    async fn publish_contact(&self, event: &ContactUpdateEvent) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(event)?;
        let _: () = conn.publish(Self::contact_channel(event.campaign_id), payload).await?;
        Ok(())
    }

    async fn publish_notification(&self, event: &CampaignNotification) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(event)?;
        let _: () = conn.publish(Self::events_channel(event.campaign_id), payload).await?;
        Ok(())
    }
}
