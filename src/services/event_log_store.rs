//! Postgres-backed `campaign_events` table (spec section 3's
//! `CampaignEvent`): append-only engagement history, distinct from the
//! fire-and-forget pub/sub notifications in `event_bus.rs`.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::event::{CampaignEvent, EventType};
use crate::services::traits::EventLogBackend;

pub struct EventLogStore {
    pool: PgPool,
}

impl EventLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLogBackend for EventLogStore {
    async fn append(&self, event: &CampaignEvent) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO campaign_events (id, campaign_id, contact_id, kind, url, ua, ip, created_at, trace)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(event.campaign_id)
        .bind(event.contact_id)
        .bind(event.kind.as_str())
        .bind(&event.url)
        .bind(&event.ua)
        .bind(&event.ip)
        .bind(event.created_at)
        .bind(&event.trace)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_by_kind(&self, campaign_id: uuid::Uuid, kind: EventType) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM campaign_events WHERE campaign_id = $1 AND kind = $2",
        )
        .bind(campaign_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
