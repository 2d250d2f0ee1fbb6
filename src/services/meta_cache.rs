//! Meta Cache (C5), spec sections 4.3 and 6. Volatile per-campaign counters,
//! the definition blob, and engagement/domain-health snapshots, all stored
//! as Redis hashes/strings under the exact key layout spec section 6 names.
//! Advisory only: the Finalizer (`finalizer.rs`) treats an empty or stale
//! cache as the signal to recompute totals from the Ledger, never the other
//! way around (spec section 4.3: "ledger wins").

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use uuid::Uuid;

use crate::models::campaign::Totals;
use crate::services::traits::CacheBackend;

pub struct MetaCache {
    conn: ConnectionManager,
}

impl MetaCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn meta_key(campaign_id: Uuid) -> String {
        format!("campaign:{campaign_id}:meta")
    }

    fn definition_key(campaign_id: Uuid) -> String {
        format!("campaign:{campaign_id}:definition")
    }

    fn metrics_key(campaign_id: Uuid) -> String {
        format!("campaign:{campaign_id}:metrics")
    }

    fn health_key(campaign_id: Uuid, domain: &str) -> String {
        format!("campaign:{campaign_id}:health:{domain}")
    }

    pub const ALL_CAMPAIGNS_SET: &'static str = "campaign:all";

    pub async fn track_campaign(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(Self::ALL_CAMPAIGNS_SET, campaign_id.to_string()).await?;
        Ok(())
    }

    pub async fn untrack_campaign(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(Self::ALL_CAMPAIGNS_SET, campaign_id.to_string()).await?;
        Ok(())
    }

    pub async fn all_campaign_ids(&self) -> anyhow::Result<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.smembers(Self::ALL_CAMPAIGNS_SET).await?;
        Ok(raw.into_iter().filter_map(|s| Uuid::parse_str(&s).ok()).collect())
    }

    /// `campaign:{id}:metrics` hash: `opens`, `clicks` (spec section 6).
    pub async fn incr_metric(&self, campaign_id: Uuid, field: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hincr(Self::metrics_key(campaign_id), field, 1).await?;
        Ok(())
    }

    /// `campaign:{id}:health` keyed `domain:{d}:sent|failed|lastUpdated`.
    pub async fn record_domain_health(&self, campaign_id: Uuid, domain: &str, success: bool) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let key = Self::health_key(campaign_id, domain);
        let field = if success { "sent" } else { "failed" };
        let _: () = conn.hincr(&key, field, 1).await?;
        let _: () = conn.hset(&key, "lastUpdated", chrono::Utc::now().to_rfc3339()).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for MetaCache {
    async fn read_totals(&self, campaign_id: Uuid) -> anyhow::Result<Option<Totals>> {
        let mut conn = self.conn.clone();
        let key = Self::meta_key(campaign_id);
        let exists: bool = conn.exists(&key).await?;
        if !exists {
            return Ok(None);
        }
        let (intended, processed, sent, failed): (Option<i64>, Option<i64>, Option<i64>, Option<i64>) =
            redis::pipe()
                .hget(&key, "intended")
                .hget(&key, "processed")
                .hget(&key, "sent")
                .hget(&key, "failed")
                .query_async(&mut conn)
                .await?;
        Ok(Some(Totals {
            intended: intended.unwrap_or(0),
            processed: processed.unwrap_or(0),
            sent: sent.unwrap_or(0),
            failed: failed.unwrap_or(0),
        }))
    }

    async fn write_totals(&self, campaign_id: Uuid, totals: &Totals, status: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let key = Self::meta_key(campaign_id);
        let _: () = conn
            .hset_multiple(
                &key,
                &[
                    ("intended", totals.intended),
                    ("processed", totals.processed),
                    ("sent", totals.sent),
                    ("failed", totals.failed),
                ],
            )
            .await?;
        let _: () = conn.hset(&key, "status", status).await?;
        Ok(())
    }

    async fn incr_sent(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let key = Self::meta_key(campaign_id);
        let _: () = conn.hincr(&key, "sent", 1).await?;
        let _: () = conn.hincr(&key, "processed", 1).await?;
        Ok(())
    }

    async fn incr_failed(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let key = Self::meta_key(campaign_id);
        let _: () = conn.hincr(&key, "failed", 1).await?;
        let _: () = conn.hincr(&key, "processed", 1).await?;
        Ok(())
    }

    async fn set_status(&self, campaign_id: Uuid, status: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(Self::meta_key(campaign_id), "status", status).await?;
        Ok(())
    }

    async fn read_definition(&self, campaign_id: Uuid) -> anyhow::Result<Option<Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::definition_key(campaign_id)).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn write_definition(&self, campaign_id: Uuid, def: &Value) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(def)?;
        let _: () = conn.set(Self::definition_key(campaign_id), raw).await?;
        Ok(())
    }

    async fn delete_definition(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::definition_key(campaign_id)).await?;
        Ok(())
    }

    async fn read_status(&self, campaign_id: Uuid) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let status: Option<String> = conn.hget(Self::meta_key(campaign_id), "status").await?;
        Ok(status)
    }

    async fn track_campaign(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        MetaCache::track_campaign(self, campaign_id).await
    }

    async fn delete_all(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::meta_key(campaign_id)).await?;
        let _: () = conn.del(Self::definition_key(campaign_id)).await?;
        let _: () = conn.del(Self::metrics_key(campaign_id)).await?;
        self.untrack_campaign(campaign_id).await?;
        Ok(())
    }

    async fn incr_metric(&self, campaign_id: Uuid, field: &str) -> anyhow::Result<()> {
        MetaCache::incr_metric(self, campaign_id, field).await
    }

    async fn record_domain_health(&self, campaign_id: Uuid, domain: &str, success: bool) -> anyhow::Result<()> {
        MetaCache::record_domain_health(self, campaign_id, domain, success).await
    }
}
