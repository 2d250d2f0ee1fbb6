//! Ledger Store (C4), spec section 4.3. The authoritative per-recipient
//! table. Every transition is a targeted `UPDATE ... WHERE campaign_id = $1
//! AND contact_id = $2` statement, idempotent under replay — no module
//! reads a counter and writes it back without going through one of these
//! named transitions (spec invariant 7: `bg_attempts` non-decreasing while a
//! step is in flight).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::campaign::Totals;
use crate::models::ledger::{FollowUpPlanEntry, LedgerRow, LedgerStatus};
use crate::services::traits::LedgerBackend;

pub struct LedgerStore {
    pool: PgPool,
}

impl LedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert_pending(&self, campaign_id: Uuid, contact_id: Uuid, email: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_rows (campaign_id, contact_id, email, status, attempts, bg_attempts,
                current_step_index, current_step_attempts, current_step_bg_attempts,
                replied, replies_count, follow_up_plan)
            VALUES ($1, $2, $3, 'pending', 0, 0, -1, 0, 0, false, 0, '[]'::jsonb)
            ON CONFLICT (campaign_id, contact_id) DO NOTHING
            "#,
        )
        .bind(campaign_id)
        .bind(contact_id)
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerBackend for LedgerStore {
    async fn get(&self, campaign_id: Uuid, contact_id: Uuid) -> anyhow::Result<Option<LedgerRow>> {
        let row = sqlx::query_as::<_, LedgerRow>(
            "SELECT * FROM ledger_rows WHERE campaign_id = $1 AND contact_id = $2",
        )
        .bind(campaign_id)
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_sending(&self, campaign_id: Uuid, contact_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE ledger_rows SET status = 'sending', last_attempt_at = NOW() WHERE campaign_id = $1 AND contact_id = $2",
        )
        .bind(campaign_id)
        .bind(contact_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_attempt(&self, campaign_id: Uuid, contact_id: Uuid, n: i32) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE ledger_rows
            SET bg_attempts = GREATEST(bg_attempts, $3),
                current_step_bg_attempts = GREATEST(current_step_bg_attempts, $3)
            WHERE campaign_id = $1 AND contact_id = $2
            "#,
        )
        .bind(campaign_id)
        .bind(contact_id)
        .bind(n)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit_sent(
        &self,
        campaign_id: Uuid,
        contact_id: Uuid,
        step_index: i32,
        step_name: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE ledger_rows
            SET status = 'sent', current_step_index = $3, current_step_name = $4,
                current_step_attempts = 0, current_step_bg_attempts = 0,
                last_activity_at = NOW(), last_error = NULL
            WHERE campaign_id = $1 AND contact_id = $2
            "#,
        )
        .bind(campaign_id)
        .bind(contact_id)
        .bind(step_index)
        .bind(step_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit_failed(&self, campaign_id: Uuid, contact_id: Uuid, reason: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE ledger_rows SET status = 'failed', last_error = $3 WHERE campaign_id = $1 AND contact_id = $2",
        )
        .bind(campaign_id)
        .bind(contact_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn write_intermediate_error(
        &self,
        campaign_id: Uuid,
        contact_id: Uuid,
        bg_attempts: i32,
        error: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE ledger_rows
            SET bg_attempts = GREATEST(bg_attempts, $3),
                current_step_bg_attempts = GREATEST(current_step_bg_attempts, $3),
                last_error = $4, last_attempt_at = NOW()
            WHERE campaign_id = $1 AND contact_id = $2
            "#,
        )
        .bind(campaign_id)
        .bind(contact_id)
        .bind(bg_attempts)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bump_first_attempt(&self, campaign_id: Uuid, contact_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE ledger_rows SET attempts = 1 WHERE campaign_id = $1 AND contact_id = $2 AND attempts = 0",
        )
        .bind(campaign_id)
        .bind(contact_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_follow_up_plan(&self, campaign_id: Uuid, contact_id: Uuid, plan: Vec<FollowUpPlanEntry>) -> anyhow::Result<()> {
        let value = serde_json::to_value(plan)?;
        sqlx::query(
            "UPDATE ledger_rows SET follow_up_plan = $3 WHERE campaign_id = $1 AND contact_id = $2",
        )
        .bind(campaign_id)
        .bind(contact_id)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `followUpPlan[i].sentAt` is monotone (spec invariant 4): this only
    /// sets it the first time, via a `WHERE sent_at IS NULL`-style guard
    /// expressed here as a read-modify-write under the row's single
    /// synchronization point.
    async fn mark_follow_up_sent(&self, campaign_id: Uuid, contact_id: Uuid, step: usize) -> anyhow::Result<()> {
        if let Some(row) = self.get(campaign_id, contact_id).await? {
            let mut plan = row.follow_up_plan();
            if let Some(entry) = plan.get_mut(step) {
                if entry.sent_at.is_none() {
                    entry.sent_at = Some(Utc::now());
                    entry.status = crate::models::ledger::FollowUpStepStatus::Sent;
                }
            }
            self.set_follow_up_plan(campaign_id, contact_id, plan).await?;
        }
        Ok(())
    }

    async fn mark_follow_up_skipped(&self, campaign_id: Uuid, contact_id: Uuid, step: usize, reason: &str) -> anyhow::Result<()> {
        if let Some(row) = self.get(campaign_id, contact_id).await? {
            let mut plan = row.follow_up_plan();
            if let Some(entry) = plan.get_mut(step) {
                entry.status = crate::models::ledger::FollowUpStepStatus::Skipped;
                entry.skipped_at = Some(Utc::now());
                entry.skipped_reason = Some(reason.to_string());
            }
            self.set_follow_up_plan(campaign_id, contact_id, plan).await?;
        }
        Ok(())
    }

    async fn has_reply(&self, campaign_id: Uuid, contact_id: Uuid) -> anyhow::Result<bool> {
        let replied: Option<bool> = sqlx::query_scalar(
            "SELECT replied FROM ledger_rows WHERE campaign_id = $1 AND contact_id = $2",
        )
        .bind(campaign_id)
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(replied.unwrap_or(false))
    }

    async fn record_reply(&self, campaign_id: Uuid, contact_id: Uuid, snippet: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE ledger_rows
            SET replied = true, replies_count = replies_count + 1, last_reply_at = $4, last_reply_snippet = $3
            WHERE campaign_id = $1 AND contact_id = $2
            "#,
        )
        .bind(campaign_id)
        .bind(contact_id)
        .bind(snippet)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `openedAt` is set at most once (spec section 8's round-trip
    /// property): `$setOnce` semantics via `COALESCE`.
    async fn record_open(&self, campaign_id: Uuid, contact_id: Uuid, at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE ledger_rows SET opened_at = COALESCE(opened_at, $3) WHERE campaign_id = $1 AND contact_id = $2",
        )
        .bind(campaign_id)
        .bind(contact_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_click(&self, campaign_id: Uuid, contact_id: Uuid, at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE ledger_rows
            SET last_click_at = $3, opened_at = COALESCE(opened_at, $3)
            WHERE campaign_id = $1 AND contact_id = $2
            "#,
        )
        .bind(campaign_id)
        .bind(contact_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_pending(&self, campaign_id: Uuid) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_rows SET status = 'failed', last_error = 'cancelled'
            WHERE campaign_id = $1 AND status = 'pending'
            "#,
        )
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reset_for_retry(&self, campaign_id: Uuid, contact_id: Uuid, new_attempts: i32) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE ledger_rows
            SET status = 'pending', attempts = $3, current_step_bg_attempts = 0, last_error = NULL
            WHERE campaign_id = $1 AND contact_id = $2
            "#,
        )
        .bind(campaign_id)
        .bind(contact_id)
        .bind(new_attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_retry_eligible(&self, campaign_id: Uuid, max_attempts: i32, limit: i64) -> anyhow::Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT contact_id FROM ledger_rows
            WHERE campaign_id = $1 AND status = 'failed'
                AND attempts < $2 AND current_step_bg_attempts >= $2
            ORDER BY last_activity_at NULLS FIRST
            LIMIT $3
            "#,
        )
        .bind(campaign_id)
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn list_pending(&self, campaign_id: Uuid) -> anyhow::Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT contact_id FROM ledger_rows WHERE campaign_id = $1 AND status = 'pending'",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn ensure_pending(&self, campaign_id: Uuid, contact_id: Uuid, email: &str) -> anyhow::Result<()> {
        self.insert_pending(campaign_id, contact_id, email).await
    }

    async fn aggregate_totals(&self, campaign_id: Uuid) -> anyhow::Result<Totals> {
        let row: (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) AS intended,
                COUNT(*) FILTER (WHERE status = 'sent') AS sent,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM ledger_rows WHERE campaign_id = $1
            "#,
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(Totals {
            intended: row.0,
            processed: row.1 + row.2,
            sent: row.1,
            failed: row.2,
        })
    }
}

impl LedgerRow {
    pub fn status_enum(&self) -> LedgerStatus {
        self.status()
    }
}
