//! Trait seams for the five storage-backed collaborators (Queue, Ledger,
//! Cache, Rate Governor, Event Bus) plus in-memory fakes. Grounded on the
//! corpus's `EmailQueueBackend`-style trait-plus-fake pattern
//! (`pegasusheavy-armature`): the Delivery Worker, Finalizer, and Control
//! Plane are written against these traits so their logic is unit-testable
//! without a live Postgres/Redis connection (spec section 8's testable
//! properties).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::campaign::{Campaign, CampaignDefinition, Totals};
use crate::models::event::{CampaignEvent, EventType};
use crate::models::ledger::{FollowUpPlanEntry, LedgerRow, LedgerStatus};
use crate::models::reply::Reply;
use crate::models::wire::{CampaignLifecycleEvent, CampaignNotification, ContactUpdateEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Initial,
    FollowUp(usize),
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub contact_id: Uuid,
    pub kind: JobKind,
    pub bg_attempts: i32,
    pub run_after: DateTime<Utc>,
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn enqueue(&self, campaign_id: Uuid, contact_id: Uuid, kind: JobKind, delay: chrono::Duration) -> anyhow::Result<Uuid>;
    /// Queue-driven retry of the *same* job row: increments `bg_attempts`,
    /// never resets it (spec section 4.1's retry contract).
    async fn retry_in_place(&self, job_id: Uuid, delay: chrono::Duration) -> anyhow::Result<()>;
    /// Reschedules the same job row without touching `bg_attempts` — used
    /// only for a locally-denied rate-governor permit, which never reached
    /// SMTP (spec section 4.2: "must not be incremented").
    async fn reschedule_only(&self, job_id: Uuid, delay: chrono::Duration) -> anyhow::Result<()>;
    async fn remove_for_campaign(&self, campaign_id: Uuid) -> anyhow::Result<u64>;
    async fn snapshot(&self, campaign_id: Uuid) -> anyhow::Result<HashMap<String, i64>>;
    async fn mark_completed(&self, job_id: Uuid) -> anyhow::Result<()>;
    async fn mark_failed(&self, job_id: Uuid) -> anyhow::Result<()>;
}

#[async_trait]
pub trait LedgerBackend: Send + Sync {
    async fn get(&self, campaign_id: Uuid, contact_id: Uuid) -> anyhow::Result<Option<LedgerRow>>;
    async fn mark_sending(&self, campaign_id: Uuid, contact_id: Uuid) -> anyhow::Result<()>;
    /// Records that attempt number `n` of the current step is now in
    /// flight, before the send is even attempted — `bg_attempts` and
    /// `current_step_bg_attempts` are `GREATEST`-bumped to `n` (spec
    /// invariant 7: non-decreasing while a step is in flight).
    async fn mark_attempt(&self, campaign_id: Uuid, contact_id: Uuid, n: i32) -> anyhow::Result<()>;
    async fn commit_sent(
        &self,
        campaign_id: Uuid,
        contact_id: Uuid,
        step_index: i32,
        step_name: Option<&str>,
    ) -> anyhow::Result<()>;
    async fn commit_failed(&self, campaign_id: Uuid, contact_id: Uuid, reason: &str) -> anyhow::Result<()>;
    async fn write_intermediate_error(
        &self,
        campaign_id: Uuid,
        contact_id: Uuid,
        bg_attempts: i32,
        error: &str,
    ) -> anyhow::Result<()>;
    async fn bump_first_attempt(&self, campaign_id: Uuid, contact_id: Uuid) -> anyhow::Result<()>;
    async fn set_follow_up_plan(&self, campaign_id: Uuid, contact_id: Uuid, plan: Vec<FollowUpPlanEntry>) -> anyhow::Result<()>;
    async fn mark_follow_up_sent(&self, campaign_id: Uuid, contact_id: Uuid, step: usize) -> anyhow::Result<()>;
    async fn mark_follow_up_skipped(&self, campaign_id: Uuid, contact_id: Uuid, step: usize, reason: &str) -> anyhow::Result<()>;
    async fn has_reply(&self, campaign_id: Uuid, contact_id: Uuid) -> anyhow::Result<bool>;
    async fn record_reply(&self, campaign_id: Uuid, contact_id: Uuid, snippet: &str, at: DateTime<Utc>) -> anyhow::Result<()>;
    async fn record_open(&self, campaign_id: Uuid, contact_id: Uuid, at: DateTime<Utc>) -> anyhow::Result<()>;
    async fn record_click(&self, campaign_id: Uuid, contact_id: Uuid, at: DateTime<Utc>) -> anyhow::Result<()>;
    async fn cancel_pending(&self, campaign_id: Uuid) -> anyhow::Result<u64>;
    async fn aggregate_totals(&self, campaign_id: Uuid) -> anyhow::Result<Totals>;
    /// Control-plane `retryContact` (spec section 4.7): resets the row to
    /// `pending`, bumps `attempts` to `new_attempts`, zeroes
    /// `currentStepBgAttempts`, clears `lastError` — deliberately resetting
    /// `bgAttempts` for the step, unlike a queue-driven retry.
    async fn reset_for_retry(&self, campaign_id: Uuid, contact_id: Uuid, new_attempts: i32) -> anyhow::Result<()>;
    /// Rows eligible for `retryFailed` (spec section 4.7):
    /// `status=failed, attempts<max_attempts, currentStepBgAttempts>=max_attempts`.
    async fn list_retry_eligible(&self, campaign_id: Uuid, max_attempts: i32, limit: i64) -> anyhow::Result<Vec<Uuid>>;
    /// `resume` (spec section 4.7): contacts still `pending`, used to
    /// re-enqueue any that lack an active job.
    async fn list_pending(&self, campaign_id: Uuid) -> anyhow::Result<Vec<Uuid>>;
    /// Campaign start: creates the row if absent, a no-op otherwise (a
    /// second `start_campaign` call with the same contact is idempotent).
    async fn ensure_pending(&self, campaign_id: Uuid, contact_id: Uuid, email: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn read_totals(&self, campaign_id: Uuid) -> anyhow::Result<Option<Totals>>;
    async fn write_totals(&self, campaign_id: Uuid, totals: &Totals, status: &str) -> anyhow::Result<()>;
    async fn incr_sent(&self, campaign_id: Uuid) -> anyhow::Result<()>;
    async fn incr_failed(&self, campaign_id: Uuid) -> anyhow::Result<()>;
    async fn set_status(&self, campaign_id: Uuid, status: &str) -> anyhow::Result<()>;
    async fn read_definition(&self, campaign_id: Uuid) -> anyhow::Result<Option<Value>>;
    async fn write_definition(&self, campaign_id: Uuid, def: &Value) -> anyhow::Result<()>;
    async fn delete_definition(&self, campaign_id: Uuid) -> anyhow::Result<()>;
    /// Advisory fast-path for the worker's per-job `READ_STATUS` check (spec
    /// section 4.5); `None` means cache-empty, so callers fall back to the
    /// `CampaignBackend`.
    async fn read_status(&self, campaign_id: Uuid) -> anyhow::Result<Option<String>>;
    /// `campaign:all` set (spec section 6), maintained by the Control Plane.
    async fn track_campaign(&self, campaign_id: Uuid) -> anyhow::Result<()>;
    /// Best-effort removal of every cache key namespaced to this campaign
    /// (`meta`, `definition`, `metrics`, plus the `campaign:all` membership).
    /// `health` keys are left to expire via TTL since they are keyed per
    /// domain and cannot be enumerated without a `SCAN`.
    async fn delete_all(&self, campaign_id: Uuid) -> anyhow::Result<()>;
    /// `campaign:{id}:metrics` hash (spec section 6): bumps `field`
    /// (`"opens"` or `"clicks"`).
    async fn incr_metric(&self, campaign_id: Uuid, field: &str) -> anyhow::Result<()>;
    /// `campaign:{id}:health` hash (spec section 6), keyed
    /// `domain:{d}:sent|failed|lastUpdated`.
    async fn record_domain_health(&self, campaign_id: Uuid, domain: &str, success: bool) -> anyhow::Result<()>;
}

/// The authoritative campaign document (spec section 3's `Campaign`),
/// distinct from the per-recipient `LedgerRow`s. Created once by
/// `engine.rs::start_campaign`, mutated only by the Control Plane (C9) and
/// the Finalizer (C8).
#[async_trait]
pub trait CampaignBackend: Send + Sync {
    async fn create(
        &self,
        campaign_id: Uuid,
        name: &str,
        definition: &CampaignDefinition,
        intended: i64,
    ) -> anyhow::Result<()>;
    async fn get(&self, campaign_id: Uuid) -> anyhow::Result<Option<Campaign>>;
    async fn set_status(&self, campaign_id: Uuid, status: &str) -> anyhow::Result<()>;
    /// Finalization: write terminal status, totals, and `completed_at`.
    async fn complete(&self, campaign_id: Uuid, status: &str, totals: &Totals) -> anyhow::Result<()>;
    async fn delete(&self, campaign_id: Uuid) -> anyhow::Result<()>;
    /// Bounded window for the Reconciler sweep (spec section 4.6), oldest
    /// `updated_at` first.
    async fn list_for_reconcile(&self, limit: i64) -> anyhow::Result<Vec<Uuid>>;
}

#[async_trait]
pub trait GovernorBackend: Send + Sync {
    /// Attempts to reserve one send for `domain`; returns `true` if granted.
    async fn try_acquire(&self, domain: &str) -> anyhow::Result<bool>;
    async fn record_outcome(&self, domain: &str, success: bool) -> anyhow::Result<()>;
    async fn set_block(&self, domain: Option<&str>, ttl: chrono::Duration) -> anyhow::Result<()>;
    async fn is_blocked(&self, domain: &str) -> anyhow::Result<bool>;
    /// Rolling failure rate for `domain`, the `failRate` term of spec
    /// section 4.2's block-TTL formula.
    async fn failure_rate(&self, domain: &str) -> anyhow::Result<f64>;
}

/// The append-only `campaign_events` table (spec section 3's
/// `CampaignEvent`), distinct from the pub/sub `EventBusBackend` used for
/// live notification. Rows here are durable engagement history; bus
/// messages are fire-and-forget.
#[async_trait]
pub trait EventLogBackend: Send + Sync {
    async fn append(&self, event: &CampaignEvent) -> anyhow::Result<()>;
    async fn count_by_kind(&self, campaign_id: Uuid, kind: EventType) -> anyhow::Result<i64>;
}

/// Idempotent reply storage (spec section 4.8), keyed by `fingerprint`.
#[async_trait]
pub trait ReplyBackend: Send + Sync {
    async fn exists(&self, fingerprint: &str) -> anyhow::Result<bool>;
    async fn insert(&self, reply: &Reply) -> anyhow::Result<()>;
}

#[async_trait]
pub trait EventBusBackend: Send + Sync {
    async fn publish_campaign(&self, event: &CampaignLifecycleEvent) -> anyhow::Result<()>;
    async fn publish_contact(&self, event: &ContactUpdateEvent) -> anyhow::Result<()>;
    async fn publish_notification(&self, event: &CampaignNotification) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------
// In-memory fakes, used by unit/integration-shaped tests (spec section 8).
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryQueue {
    pub jobs: Mutex<HashMap<Uuid, JobRecord>>,
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn enqueue(&self, campaign_id: Uuid, contact_id: Uuid, kind: JobKind, delay: chrono::Duration) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        let rec = JobRecord {
            id,
            campaign_id,
            contact_id,
            kind,
            bg_attempts: 0,
            run_after: Utc::now() + delay,
        };
        self.jobs.lock().unwrap().insert(id, rec);
        Ok(id)
    }

    async fn retry_in_place(&self, job_id: Uuid, delay: chrono::Duration) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&job_id) {
            job.bg_attempts += 1;
            job.run_after = Utc::now() + delay;
        }
        Ok(())
    }

    async fn reschedule_only(&self, job_id: Uuid, delay: chrono::Duration) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&job_id) {
            job.run_after = Utc::now() + delay;
        }
        Ok(())
    }

    async fn remove_for_campaign(&self, campaign_id: Uuid) -> anyhow::Result<u64> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, j| j.campaign_id != campaign_id);
        Ok((before - jobs.len()) as u64)
    }

    async fn snapshot(&self, campaign_id: Uuid) -> anyhow::Result<HashMap<String, i64>> {
        let jobs = self.jobs.lock().unwrap();
        let mut out = HashMap::new();
        let n = jobs.values().filter(|j| j.campaign_id == campaign_id).count() as i64;
        out.insert("pending".to_string(), n);
        Ok(out)
    }

    /// `removeOnComplete = true` (spec section 4.1): the in-memory fake
    /// drops the row outright.
    async fn mark_completed(&self, job_id: Uuid) -> anyhow::Result<()> {
        self.jobs.lock().unwrap().remove(&job_id);
        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid) -> anyhow::Result<()> {
        self.jobs.lock().unwrap().remove(&job_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryLedger {
    pub rows: Mutex<HashMap<(Uuid, Uuid), LedgerRow>>,
}

impl InMemoryLedger {
    pub fn insert_pending(&self, campaign_id: Uuid, contact_id: Uuid, email: &str) {
        let row = LedgerRow {
            campaign_id,
            contact_id,
            email: email.to_string(),
            status: LedgerStatus::Pending.as_str().to_string(),
            attempts: 0,
            bg_attempts: 0,
            current_step_index: -1,
            current_step_name: None,
            current_step_attempts: 0,
            current_step_bg_attempts: 0,
            last_attempt_at: None,
            last_error: None,
            opened_at: None,
            last_click_at: None,
            last_activity_at: None,
            replied: false,
            replies_count: 0,
            last_reply_at: None,
            last_reply_snippet: None,
            follow_up_plan: serde_json::to_value(Vec::<FollowUpPlanEntry>::new()).unwrap(),
        };
        self.rows.lock().unwrap().insert((campaign_id, contact_id), row);
    }
}

#[async_trait]
impl LedgerBackend for InMemoryLedger {
    async fn get(&self, campaign_id: Uuid, contact_id: Uuid) -> anyhow::Result<Option<LedgerRow>> {
        Ok(self.rows.lock().unwrap().get(&(campaign_id, contact_id)).cloned())
    }

    async fn mark_sending(&self, campaign_id: Uuid, contact_id: Uuid) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&(campaign_id, contact_id)) {
            row.status = LedgerStatus::Sending.as_str().to_string();
            row.last_attempt_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_attempt(&self, campaign_id: Uuid, contact_id: Uuid, n: i32) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&(campaign_id, contact_id)) {
            row.bg_attempts = row.bg_attempts.max(n);
            row.current_step_bg_attempts = row.current_step_bg_attempts.max(n);
            row.last_attempt_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn commit_sent(
        &self,
        campaign_id: Uuid,
        contact_id: Uuid,
        step_index: i32,
        step_name: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&(campaign_id, contact_id)) {
            row.status = LedgerStatus::Sent.as_str().to_string();
            row.current_step_index = step_index;
            row.current_step_name = step_name.map(|s| s.to_string());
            row.current_step_attempts = 0;
            row.current_step_bg_attempts = 0;
            row.last_activity_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn commit_failed(&self, campaign_id: Uuid, contact_id: Uuid, reason: &str) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&(campaign_id, contact_id)) {
            row.status = LedgerStatus::Failed.as_str().to_string();
            row.last_error = Some(reason.to_string());
        }
        Ok(())
    }

    async fn write_intermediate_error(
        &self,
        campaign_id: Uuid,
        contact_id: Uuid,
        bg_attempts: i32,
        error: &str,
    ) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&(campaign_id, contact_id)) {
            row.bg_attempts = bg_attempts;
            row.current_step_bg_attempts = bg_attempts;
            row.last_error = Some(error.to_string());
            row.last_attempt_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn bump_first_attempt(&self, campaign_id: Uuid, contact_id: Uuid) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&(campaign_id, contact_id)) {
            if row.attempts == 0 {
                row.attempts = 1;
            }
        }
        Ok(())
    }

    async fn set_follow_up_plan(&self, campaign_id: Uuid, contact_id: Uuid, plan: Vec<FollowUpPlanEntry>) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&(campaign_id, contact_id)) {
            row.follow_up_plan = serde_json::to_value(plan).unwrap();
        }
        Ok(())
    }

    async fn mark_follow_up_sent(&self, campaign_id: Uuid, contact_id: Uuid, step: usize) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&(campaign_id, contact_id)) {
            let mut plan = row.follow_up_plan();
            if let Some(entry) = plan.get_mut(step) {
                if entry.sent_at.is_none() {
                    entry.sent_at = Some(Utc::now());
                    entry.status = crate::models::ledger::FollowUpStepStatus::Sent;
                }
            }
            row.follow_up_plan = serde_json::to_value(plan).unwrap();
        }
        Ok(())
    }

    async fn mark_follow_up_skipped(&self, campaign_id: Uuid, contact_id: Uuid, step: usize, reason: &str) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&(campaign_id, contact_id)) {
            let mut plan = row.follow_up_plan();
            if let Some(entry) = plan.get_mut(step) {
                entry.status = crate::models::ledger::FollowUpStepStatus::Skipped;
                entry.skipped_at = Some(Utc::now());
                entry.skipped_reason = Some(reason.to_string());
            }
            row.follow_up_plan = serde_json::to_value(plan).unwrap();
        }
        Ok(())
    }

    async fn has_reply(&self, campaign_id: Uuid, contact_id: Uuid) -> anyhow::Result<bool> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&(campaign_id, contact_id))
            .map(|r| r.replied)
            .unwrap_or(false))
    }

    async fn record_reply(&self, campaign_id: Uuid, contact_id: Uuid, snippet: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&(campaign_id, contact_id)) {
            row.replied = true;
            row.replies_count += 1;
            row.last_reply_at = Some(at);
            row.last_reply_snippet = Some(snippet.to_string());
        }
        Ok(())
    }

    async fn record_open(&self, campaign_id: Uuid, contact_id: Uuid, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&(campaign_id, contact_id)) {
            if row.opened_at.is_none() {
                row.opened_at = Some(at);
            }
        }
        Ok(())
    }

    async fn record_click(&self, campaign_id: Uuid, contact_id: Uuid, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&(campaign_id, contact_id)) {
            row.last_click_at = Some(at);
            if row.opened_at.is_none() {
                row.opened_at = Some(at);
            }
        }
        Ok(())
    }

    async fn cancel_pending(&self, campaign_id: Uuid) -> anyhow::Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let mut n = 0u64;
        for row in rows.values_mut() {
            if row.campaign_id == campaign_id && row.status() == LedgerStatus::Pending {
                row.status = LedgerStatus::Failed.as_str().to_string();
                row.last_error = Some("cancelled".to_string());
                n += 1;
            }
        }
        Ok(n)
    }

    async fn reset_for_retry(&self, campaign_id: Uuid, contact_id: Uuid, new_attempts: i32) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&(campaign_id, contact_id)) {
            row.status = LedgerStatus::Pending.as_str().to_string();
            row.attempts = new_attempts;
            row.current_step_bg_attempts = 0;
            row.last_error = None;
        }
        Ok(())
    }

    async fn list_retry_eligible(&self, campaign_id: Uuid, max_attempts: i32, limit: i64) -> anyhow::Result<Vec<Uuid>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .filter(|r| {
                r.campaign_id == campaign_id
                    && r.status() == LedgerStatus::Failed
                    && r.attempts < max_attempts
                    && r.current_step_bg_attempts >= max_attempts
            })
            .take(limit.max(0) as usize)
            .map(|r| r.contact_id)
            .collect())
    }

    async fn list_pending(&self, campaign_id: Uuid) -> anyhow::Result<Vec<Uuid>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .filter(|r| r.campaign_id == campaign_id && r.status() == LedgerStatus::Pending)
            .map(|r| r.contact_id)
            .collect())
    }

    async fn ensure_pending(&self, campaign_id: Uuid, contact_id: Uuid, email: &str) -> anyhow::Result<()> {
        let exists = self.rows.lock().unwrap().contains_key(&(campaign_id, contact_id));
        if !exists {
            self.insert_pending(campaign_id, contact_id, email);
        }
        Ok(())
    }

    async fn aggregate_totals(&self, campaign_id: Uuid) -> anyhow::Result<Totals> {
        let rows = self.rows.lock().unwrap();
        let mut totals = Totals::default();
        for row in rows.values().filter(|r| r.campaign_id == campaign_id) {
            totals.intended += 1;
            match row.status() {
                LedgerStatus::Sent => {
                    totals.sent += 1;
                    totals.processed += 1;
                }
                LedgerStatus::Failed => {
                    totals.failed += 1;
                    totals.processed += 1;
                }
                _ => {}
            }
        }
        Ok(totals)
    }
}

#[derive(Default)]
pub struct InMemoryCache {
    pub metrics: Mutex<HashMap<Uuid, HashMap<String, i64>>>,
    pub health: Mutex<HashMap<(Uuid, String), (i64, i64)>>,
    pub totals: Mutex<HashMap<Uuid, (Totals, String)>>,
    pub definitions: Mutex<HashMap<Uuid, Value>>,
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn read_totals(&self, campaign_id: Uuid) -> anyhow::Result<Option<Totals>> {
        Ok(self.totals.lock().unwrap().get(&campaign_id).map(|(t, _)| t.clone()))
    }

    async fn write_totals(&self, campaign_id: Uuid, totals: &Totals, status: &str) -> anyhow::Result<()> {
        self.totals.lock().unwrap().insert(campaign_id, (totals.clone(), status.to_string()));
        Ok(())
    }

    async fn incr_sent(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        let mut map = self.totals.lock().unwrap();
        let entry = map.entry(campaign_id).or_insert((Totals::default(), "running".to_string()));
        entry.0.sent += 1;
        entry.0.processed += 1;
        Ok(())
    }

    async fn incr_failed(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        let mut map = self.totals.lock().unwrap();
        let entry = map.entry(campaign_id).or_insert((Totals::default(), "running".to_string()));
        entry.0.failed += 1;
        entry.0.processed += 1;
        Ok(())
    }

    async fn set_status(&self, campaign_id: Uuid, status: &str) -> anyhow::Result<()> {
        let mut map = self.totals.lock().unwrap();
        let entry = map.entry(campaign_id).or_insert((Totals::default(), status.to_string()));
        entry.1 = status.to_string();
        Ok(())
    }

    async fn read_definition(&self, campaign_id: Uuid) -> anyhow::Result<Option<Value>> {
        Ok(self.definitions.lock().unwrap().get(&campaign_id).cloned())
    }

    async fn write_definition(&self, campaign_id: Uuid, def: &Value) -> anyhow::Result<()> {
        self.definitions.lock().unwrap().insert(campaign_id, def.clone());
        Ok(())
    }

    async fn delete_definition(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        self.definitions.lock().unwrap().remove(&campaign_id);
        Ok(())
    }

    async fn read_status(&self, campaign_id: Uuid) -> anyhow::Result<Option<String>> {
        Ok(self.totals.lock().unwrap().get(&campaign_id).map(|(_, s)| s.clone()))
    }

    async fn track_campaign(&self, _campaign_id: Uuid) -> anyhow::Result<()> {
        Ok(())
    }

    async fn delete_all(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        self.totals.lock().unwrap().remove(&campaign_id);
        self.definitions.lock().unwrap().remove(&campaign_id);
        self.metrics.lock().unwrap().remove(&campaign_id);
        Ok(())
    }

    async fn incr_metric(&self, campaign_id: Uuid, field: &str) -> anyhow::Result<()> {
        let mut metrics = self.metrics.lock().unwrap();
        let entry = metrics.entry(campaign_id).or_default();
        *entry.entry(field.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn record_domain_health(&self, campaign_id: Uuid, domain: &str, success: bool) -> anyhow::Result<()> {
        let mut health = self.health.lock().unwrap();
        let entry = health.entry((campaign_id, domain.to_string())).or_insert((0, 0));
        if success {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCampaignStore {
    pub campaigns: Mutex<HashMap<Uuid, Campaign>>,
}

#[async_trait]
impl CampaignBackend for InMemoryCampaignStore {
    async fn create(
        &self,
        campaign_id: Uuid,
        name: &str,
        definition: &CampaignDefinition,
        intended: i64,
    ) -> anyhow::Result<()> {
        let campaign = Campaign {
            id: campaign_id,
            name: name.to_string(),
            status: "running".to_string(),
            created_at: Utc::now(),
            completed_at: None,
            intended,
            processed: 0,
            sent: 0,
            failed: 0,
            definition: serde_json::to_value(definition)?,
        };
        self.campaigns.lock().unwrap().insert(campaign_id, campaign);
        Ok(())
    }

    async fn get(&self, campaign_id: Uuid) -> anyhow::Result<Option<Campaign>> {
        Ok(self.campaigns.lock().unwrap().get(&campaign_id).cloned())
    }

    async fn set_status(&self, campaign_id: Uuid, status: &str) -> anyhow::Result<()> {
        let mut campaigns = self.campaigns.lock().unwrap();
        if let Some(c) = campaigns.get_mut(&campaign_id) {
            c.status = status.to_string();
            if status == "cancelled" {
                c.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn complete(&self, campaign_id: Uuid, status: &str, totals: &Totals) -> anyhow::Result<()> {
        let mut campaigns = self.campaigns.lock().unwrap();
        if let Some(c) = campaigns.get_mut(&campaign_id) {
            c.status = status.to_string();
            c.completed_at = Some(Utc::now());
            c.intended = totals.intended;
            c.processed = totals.processed;
            c.sent = totals.sent;
            c.failed = totals.failed;
        }
        Ok(())
    }

    async fn delete(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        self.campaigns.lock().unwrap().remove(&campaign_id);
        Ok(())
    }

    async fn list_for_reconcile(&self, limit: i64) -> anyhow::Result<Vec<Uuid>> {
        let campaigns = self.campaigns.lock().unwrap();
        Ok(campaigns
            .values()
            .filter(|c| c.status() != crate::models::campaign::CampaignStatus::Running)
            .take(limit.max(0) as usize)
            .map(|c| c.id)
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryGovernor {
    pub blocked: Mutex<HashMap<String, DateTime<Utc>>>,
    pub admit: Mutex<bool>,
    pub fail_rate: Mutex<f64>,
}

impl InMemoryGovernor {
    pub fn always_admit() -> Self {
        Self {
            blocked: Mutex::new(HashMap::new()),
            admit: Mutex::new(true),
            fail_rate: Mutex::new(0.0),
        }
    }

    pub fn always_deny() -> Self {
        Self {
            blocked: Mutex::new(HashMap::new()),
            admit: Mutex::new(false),
            fail_rate: Mutex::new(0.0),
        }
    }
}

#[async_trait]
impl GovernorBackend for InMemoryGovernor {
    async fn try_acquire(&self, domain: &str) -> anyhow::Result<bool> {
        if self.is_blocked(domain).await? {
            return Ok(false);
        }
        Ok(*self.admit.lock().unwrap())
    }

    async fn record_outcome(&self, _domain: &str, _success: bool) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_block(&self, domain: Option<&str>, ttl: chrono::Duration) -> anyhow::Result<()> {
        let key = domain.unwrap_or("__global__").to_string();
        self.blocked.lock().unwrap().insert(key, Utc::now() + ttl);
        Ok(())
    }

    async fn is_blocked(&self, domain: &str) -> anyhow::Result<bool> {
        let blocked = self.blocked.lock().unwrap();
        let now = Utc::now();
        let domain_blocked = blocked.get(domain).map(|exp| *exp > now).unwrap_or(false);
        let global_blocked = blocked.get("__global__").map(|exp| *exp > now).unwrap_or(false);
        Ok(domain_blocked || global_blocked)
    }

    async fn failure_rate(&self, _domain: &str) -> anyhow::Result<f64> {
        Ok(*self.fail_rate.lock().unwrap())
    }
}

#[derive(Default)]
pub struct InMemoryBus {
    pub campaign_events: Mutex<Vec<CampaignLifecycleEvent>>,
    pub contact_events: Mutex<Vec<ContactUpdateEvent>>,
    pub notifications: Mutex<Vec<CampaignNotification>>,
}

#[async_trait]
impl EventBusBackend for InMemoryBus {
    async fn publish_campaign(&self, event: &CampaignLifecycleEvent) -> anyhow::Result<()> {
        self.campaign_events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn publish_contact(&self, event: &ContactUpdateEvent) -> anyhow::Result<()> {
        self.contact_events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn publish_notification(&self, event: &CampaignNotification) -> anyhow::Result<()> {
        self.notifications.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Records synthetic `CampaignEvent`s for assertions in tests that don't
/// need a real event table.
#[derive(Default)]
pub struct InMemoryEventLog {
    pub events: Mutex<Vec<CampaignEvent>>,
}

impl InMemoryEventLog {
    pub fn push(&self, campaign_id: Uuid, contact_id: Uuid, kind: EventType) {
        self.events.lock().unwrap().push(CampaignEvent::new(campaign_id, contact_id, kind));
    }

    pub fn count(&self, kind: EventType) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.kind == kind).count()
    }
}

#[derive(Default)]
pub struct InMemoryReplyStore {
    pub replies: Mutex<HashMap<String, Reply>>,
}

#[async_trait]
impl ReplyBackend for InMemoryReplyStore {
    async fn exists(&self, fingerprint: &str) -> anyhow::Result<bool> {
        Ok(self.replies.lock().unwrap().contains_key(fingerprint))
    }

    async fn insert(&self, reply: &Reply) -> anyhow::Result<()> {
        self.replies.lock().unwrap().insert(reply.fingerprint.clone(), reply.clone());
        Ok(())
    }
}

#[async_trait]
impl EventLogBackend for InMemoryEventLog {
    async fn append(&self, event: &CampaignEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn count_by_kind(&self, campaign_id: Uuid, kind: EventType) -> anyhow::Result<i64> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.campaign_id == campaign_id && e.kind == kind)
            .count() as i64)
    }
}
