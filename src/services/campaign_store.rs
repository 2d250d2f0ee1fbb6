//! The authoritative campaign document (spec section 3), backed by a
//! Postgres `campaigns` table. Distinct from `ledger_store.rs`'s
//! per-recipient rows: this is the single document the Control Plane (C9)
//! and Finalizer (C8) mutate.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::campaign::{Campaign, CampaignDefinition, Totals};
use crate::services::traits::CampaignBackend;

pub struct CampaignStore {
    pool: PgPool,
}

impl CampaignStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignBackend for CampaignStore {
    async fn create(
        &self,
        campaign_id: Uuid,
        name: &str,
        definition: &CampaignDefinition,
        intended: i64,
    ) -> anyhow::Result<()> {
        let def_json = serde_json::to_value(definition)?;
        sqlx::query(
            r#"
            INSERT INTO campaigns (id, name, status, created_at, updated_at, intended, processed, sent, failed, definition)
            VALUES ($1, $2, 'running', NOW(), NOW(), $3, 0, 0, 0, $4)
            "#,
        )
        .bind(campaign_id)
        .bind(name)
        .bind(intended)
        .bind(def_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, campaign_id: Uuid) -> anyhow::Result<Option<Campaign>> {
        let row = sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(campaign_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn set_status(&self, campaign_id: Uuid, status: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns
            SET status = $2, updated_at = NOW(),
                completed_at = CASE WHEN $2 = 'cancelled' THEN NOW() ELSE completed_at END
            WHERE id = $1
            "#,
        )
        .bind(campaign_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(&self, campaign_id: Uuid, status: &str, totals: &Totals) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns
            SET status = $2, completed_at = NOW(), updated_at = NOW(),
                intended = $3, processed = $4, sent = $5, failed = $6
            WHERE id = $1
            "#,
        )
        .bind(campaign_id)
        .bind(status)
        .bind(totals.intended)
        .bind(totals.processed)
        .bind(totals.sent)
        .bind(totals.failed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM campaigns WHERE id = $1")
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_for_reconcile(&self, limit: i64) -> anyhow::Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM campaigns WHERE status <> 'running' ORDER BY updated_at ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}
