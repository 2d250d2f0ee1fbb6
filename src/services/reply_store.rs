//! Postgres-backed `replies` table (spec section 4.8), unique on
//! `fingerprint` so a duplicate webhook delivery is a no-op rather than a
//! second row.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::reply::Reply;
use crate::services::traits::ReplyBackend;

pub struct ReplyStore {
    pool: PgPool,
}

impl ReplyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReplyBackend for ReplyStore {
    async fn exists(&self, fingerprint: &str) -> anyhow::Result<bool> {
        let found: Option<i32> = sqlx::query_scalar("SELECT 1 FROM replies WHERE fingerprint = $1")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn insert(&self, reply: &Reply) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO replies (id, campaign_id, contact_id, fingerprint, "from", "to", subject, text, html, message_id, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (fingerprint) DO NOTHING
            "#,
        )
        .bind(reply.id)
        .bind(reply.campaign_id)
        .bind(reply.contact_id)
        .bind(&reply.fingerprint)
        .bind(&reply.from)
        .bind(&reply.to)
        .bind(&reply.subject)
        .bind(&reply.text)
        .bind(&reply.html)
        .bind(&reply.message_id)
        .bind(reply.received_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
