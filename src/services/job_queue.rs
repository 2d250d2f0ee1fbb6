//! Durable Job Queue (C3), spec section 4.1. Backed by a Postgres `jobs`
//! table, claimed with the teacher's `FOR UPDATE SKIP LOCKED` idiom
//! (`services/job_queue.rs` in the teacher; also independently present in
//! the corpus's zero2prod-style delivery workers) so multiple worker
//! processes can race for jobs safely.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::services::traits::{JobKind, JobRecord, QueueBackend};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Exponential backoff, base 60s, with +/-20% jitter (spec section 4.1).
pub fn compute_backoff(attempts_made: u32) -> Duration {
    let base = 60f64 * 2f64.powi(attempts_made.saturating_sub(1) as i32);
    let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
    let seconds = (base * (1.0 + jitter)).max(1.0);
    Duration::seconds(seconds as i64)
}

fn job_kind_to_db(kind: JobKind) -> (&'static str, Option<i32>) {
    match kind {
        JobKind::Initial => ("initial", None),
        JobKind::FollowUp(step) => ("followup", Some(step as i32)),
    }
}

fn job_kind_from_db(kind: &str, step: Option<i32>) -> JobKind {
    match kind {
        "initial" => JobKind::Initial,
        "followup" => JobKind::FollowUp(step.unwrap_or(0) as usize),
        other => panic!("unknown job kind in storage: {other}"),
    }
}

pub struct JobQueue {
    pool: PgPool,
    max_attempts: i32,
}

impl JobQueue {
    pub fn new(pool: PgPool, max_attempts: i32) -> Self {
        Self { pool, max_attempts }
    }

    /// Control-plane-driven retry: a brand new job row, `bg_attempts` reset
    /// to zero (spec section 4.1: "deliberately resetting").
    pub async fn enqueue_fresh(&self, campaign_id: Uuid, contact_id: Uuid, kind: JobKind) -> anyhow::Result<Uuid> {
        self.enqueue(campaign_id, contact_id, kind, Duration::zero()).await
    }

    /// The `Consume(name)` stream: claims up to `limit` jobs whose delay has
    /// elapsed, atomically, via `FOR UPDATE SKIP LOCKED`.
    pub async fn claim_batch(&self, limit: i64) -> anyhow::Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, Uuid, String, Option<i32>, i32, DateTime<Utc>)>(
            r#"
            WITH claimed AS (
                SELECT id FROM jobs
                WHERE status IN ('pending', 'scheduled') AND run_after <= NOW()
                ORDER BY run_after ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs SET status = 'processing'
            FROM claimed
            WHERE jobs.id = claimed.id
            RETURNING jobs.id, jobs.campaign_id, jobs.contact_id, jobs.kind, jobs.step, jobs.bg_attempts, jobs.run_after
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, campaign_id, contact_id, kind, step, bg_attempts, run_after)| JobRecord {
                id,
                campaign_id,
                contact_id,
                kind: job_kind_from_db(&kind, step),
                bg_attempts,
                run_after,
            })
            .collect())
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }
}

#[async_trait]
impl QueueBackend for JobQueue {
    async fn enqueue(&self, campaign_id: Uuid, contact_id: Uuid, kind: JobKind, delay: Duration) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        let (kind_str, step) = job_kind_to_db(kind);
        let run_after = Utc::now() + delay;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, campaign_id, contact_id, kind, step, status, bg_attempts, run_after, created_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, NOW())
            "#,
        )
        .bind(id)
        .bind(campaign_id)
        .bind(contact_id)
        .bind(kind_str)
        .bind(step)
        .bind(run_after)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Queue-driven retry of the same job row — `bg_attempts` only
    /// increments, never resets (spec section 4.1's retry contract).
    async fn retry_in_place(&self, job_id: Uuid, delay: Duration) -> anyhow::Result<()> {
        let run_after = Utc::now() + delay;
        sqlx::query(
            "UPDATE jobs SET status = 'scheduled', bg_attempts = bg_attempts + 1, run_after = $2 WHERE id = $1",
        )
        .bind(job_id)
        .bind(run_after)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Locally-denied rate-governor permit: never reached SMTP, so
    /// `bg_attempts` must not move (spec section 4.2).
    async fn reschedule_only(&self, job_id: Uuid, delay: Duration) -> anyhow::Result<()> {
        let run_after = Utc::now() + delay;
        sqlx::query("UPDATE jobs SET status = 'scheduled', run_after = $2 WHERE id = $1")
            .bind(job_id)
            .bind(run_after)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_for_campaign(&self, campaign_id: Uuid) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE campaign_id = $1 AND status IN ('pending', 'scheduled')",
        )
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn snapshot(&self, campaign_id: Uuid) -> anyhow::Result<HashMap<String, i64>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs WHERE campaign_id = $1 GROUP BY status",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn mark_completed(&self, job_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE jobs SET status = 'completed', completed_at = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal failure after `bg_attempts` exhausted the cap.
    async fn mark_failed(&self, job_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE jobs SET status = 'failed', completed_at = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_monotonically_in_expectation() {
        let d1 = compute_backoff(1).num_seconds() as f64;
        let d3 = compute_backoff(3).num_seconds() as f64;
        // worst case d1 (with +20% jitter) vs best case d3 (with -20% jitter)
        assert!(d3 * 1.2 > d1 * 0.8 * 3.5);
    }

    #[test]
    fn backoff_jitter_bounded_to_20_percent() {
        for attempt in 1..=5 {
            let base = 60f64 * 2f64.powi(attempt - 1);
            for _ in 0..50 {
                let d = compute_backoff(attempt as u32).num_seconds() as f64;
                assert!(d >= base * 0.8 - 1.0 && d <= base * 1.2 + 1.0);
            }
        }
    }
}
