//! Control Plane (C9), spec section 4.7. Every operation is idempotent and
//! authenticated elsewhere; this module only ever writes through the
//! `CampaignBackend`/`LedgerBackend`/`QueueBackend`/`CacheBackend`/
//! `EventBusBackend` seams so it stays unit-testable without an HTTP
//! harness. `src/api/campaigns.rs` is a thin wrapper that parses requests
//! and calls straight through to these methods.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::Config;
use crate::models::campaign::{CampaignDefinition, CampaignStatus, StartCampaignRequest, Totals};
use crate::models::wire::CampaignLifecycleEvent;
use crate::services::finalizer::Finalizer;
use crate::services::traits::{CacheBackend, CampaignBackend, EventBusBackend, JobKind, LedgerBackend, QueueBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    NotFound,
    /// `delete` without `confirm=true`, or while `status=running`.
    DeleteNotConfirmed,
    /// `retryContact` on a row that isn't `status=failed` with an exhausted step.
    NotRetryEligible,
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::NotFound => write!(f, "campaign not found"),
            ControlError::DeleteNotConfirmed => write!(f, "delete requires confirm=true and a non-running campaign"),
            ControlError::NotRetryEligible => write!(f, "contact is not eligible for retry"),
        }
    }
}

impl std::error::Error for ControlError {}

/// Server-side cap on how many rows a single `retryFailed` call touches
/// (spec section 4.7: "batched retryContact ... with server-side cap").
const RETRY_FAILED_BATCH_LIMIT: i64 = 500;

pub struct ControlPlane {
    queue: Arc<dyn QueueBackend>,
    ledger: Arc<dyn LedgerBackend>,
    cache: Arc<dyn CacheBackend>,
    campaigns: Arc<dyn CampaignBackend>,
    bus: Arc<dyn EventBusBackend>,
    finalizer: Arc<Finalizer>,
    cfg: Config,
}

impl ControlPlane {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        ledger: Arc<dyn LedgerBackend>,
        cache: Arc<dyn CacheBackend>,
        campaigns: Arc<dyn CampaignBackend>,
        bus: Arc<dyn EventBusBackend>,
        finalizer: Arc<Finalizer>,
        cfg: Config,
    ) -> Self {
        Self { queue, ledger, cache, campaigns, bus, finalizer, cfg }
    }

    /// Creates the campaign document, one `pending` ledger row per contact,
    /// and an `initial` job for each (spec section 2's "start" flow). Not one
    /// of the six spec section 4.7 operations, but owned here since it's the
    /// only other writer of the campaign document.
    pub async fn start_campaign(&self, req: StartCampaignRequest) -> anyhow::Result<Uuid> {
        let campaign_id = Uuid::new_v4();
        let definition = CampaignDefinition {
            initial: req.initial,
            follow_ups: req.follow_ups,
            contacts: req.contacts,
        };
        let intended = definition.contacts.len() as i64;

        self.campaigns.create(campaign_id, &req.name, &definition, intended).await?;
        self.cache.track_campaign(campaign_id).await?;
        let def_json = serde_json::to_value(&definition)?;
        self.cache.write_definition(campaign_id, &def_json).await?;
        self.cache
            .write_totals(campaign_id, &Totals { intended, ..Default::default() }, "running")
            .await?;

        for contact in &definition.contacts {
            self.ledger.ensure_pending(campaign_id, contact.id, &contact.email).await?;
            self.queue
                .enqueue(campaign_id, contact.id, JobKind::Initial, chrono::Duration::zero())
                .await?;
        }

        self.bus
            .publish_campaign(&CampaignLifecycleEvent { id: campaign_id, status: Some("running".to_string()), totals: None, health: None })
            .await?;

        Ok(campaign_id)
    }

    /// "Running workers observe this on next READ_STATUS and no-op."
    pub async fn pause(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        self.campaigns.set_status(campaign_id, CampaignStatus::Paused.as_str()).await?;
        self.cache.set_status(campaign_id, CampaignStatus::Paused.as_str()).await?;
        self.publish_status(campaign_id, CampaignStatus::Paused).await
    }

    /// "Pending ledger rows become eligible again; optionally re-enqueue any
    /// that lack active jobs." A fresh initial job is enqueued for every
    /// still-`pending` row — cheap and idempotent, since a job claim past
    /// completion is a no-op (`READ_STATUS` sees the terminal row).
    pub async fn resume(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        self.campaigns.set_status(campaign_id, CampaignStatus::Running.as_str()).await?;
        self.cache.set_status(campaign_id, CampaignStatus::Running.as_str()).await?;
        for contact_id in self.ledger.list_pending(campaign_id).await? {
            self.queue
                .enqueue(campaign_id, contact_id, JobKind::Initial, chrono::Duration::zero())
                .await?;
        }
        self.publish_status(campaign_id, CampaignStatus::Running).await
    }

    /// `cancel`: marks the campaign terminal, fails every `pending` row with
    /// `lastError="cancelled"`, removes queued jobs, and publishes
    /// `cancelled` (spec section 4.7). Already-`sent`/`sending` rows are left
    /// untouched — the worker's own `READ_STATUS` check no-ops anything still
    /// in flight.
    pub async fn cancel(&self, campaign_id: Uuid) -> anyhow::Result<()> {
        let cancelled = self.ledger.cancel_pending(campaign_id).await?;
        if cancelled > 0 {
            let mut totals = self.cache.read_totals(campaign_id).await?.unwrap_or_default();
            totals.failed += cancelled as i64;
            totals.processed += cancelled as i64;
            self.cache.write_totals(campaign_id, &totals, CampaignStatus::Cancelled.as_str()).await?;
        }
        self.queue.remove_for_campaign(campaign_id).await?;
        self.campaigns.set_status(campaign_id, CampaignStatus::Cancelled.as_str()).await?;
        self.cache.set_status(campaign_id, CampaignStatus::Cancelled.as_str()).await?;
        self.publish_status(campaign_id, CampaignStatus::Cancelled).await
    }

    /// `delete`: requires `confirm=true` and `status != running` (spec
    /// section 4.7). Removes jobs, cache keys, the campaign document, and
    /// publishes `deleted`.
    pub async fn delete(&self, campaign_id: Uuid, confirm: bool) -> anyhow::Result<Result<(), ControlError>> {
        if !confirm {
            return Ok(Err(ControlError::DeleteNotConfirmed));
        }
        let campaign = match self.campaigns.get(campaign_id).await? {
            Some(c) => c,
            None => return Ok(Err(ControlError::NotFound)),
        };
        if campaign.status() == CampaignStatus::Running {
            return Ok(Err(ControlError::DeleteNotConfirmed));
        }

        self.queue.remove_for_campaign(campaign_id).await?;
        self.cache.delete_all(campaign_id).await?;
        self.campaigns.delete(campaign_id).await?;
        self.bus
            .publish_campaign(&CampaignLifecycleEvent { id: campaign_id, status: Some("deleted".to_string()), totals: None, health: None })
            .await?;
        Ok(Ok(()))
    }

    /// `retryContact`: requires `status=failed`, `attempts<MAX_ATTEMPTS`,
    /// `currentStepBgAttempts>=MAX_ATTEMPTS`. Resets the row to `pending`,
    /// bumps `attempts`, zeroes `currentStepBgAttempts`, enqueues a fresh job
    /// (deliberately resetting `bgAttempts` for the step, unlike a
    /// queue-driven retry — spec section 4.7).
    pub async fn retry_contact(&self, campaign_id: Uuid, contact_id: Uuid) -> anyhow::Result<Result<(), ControlError>> {
        let row = match self.ledger.get(campaign_id, contact_id).await? {
            Some(r) => r,
            None => return Ok(Err(ControlError::NotFound)),
        };
        let eligible = row.status() == crate::models::ledger::LedgerStatus::Failed
            && row.attempts < self.cfg.max_attempts
            && row.current_step_bg_attempts >= self.cfg.max_attempts;
        if !eligible {
            return Ok(Err(ControlError::NotRetryEligible));
        }
        self.ledger.reset_for_retry(campaign_id, contact_id, row.attempts + 1).await?;
        let kind = if row.is_initial_step() {
            JobKind::Initial
        } else {
            JobKind::FollowUp(row.current_step_index as usize)
        };
        self.queue.enqueue(campaign_id, contact_id, kind, chrono::Duration::zero()).await?;
        Ok(Ok(()))
    }

    /// `retryFailed`: batched `retryContact` over every eligible row, capped
    /// server-side (spec section 4.7). Returns how many were retried.
    pub async fn retry_failed(&self, campaign_id: Uuid) -> anyhow::Result<usize> {
        let eligible = self
            .ledger
            .list_retry_eligible(campaign_id, self.cfg.max_attempts, RETRY_FAILED_BATCH_LIMIT)
            .await?;
        let mut retried = 0;
        for contact_id in eligible {
            if self.retry_contact(campaign_id, contact_id).await?.is_ok() {
                retried += 1;
            }
        }
        Ok(retried)
    }

    /// `reconcile`: triggers `finalize` immediately for a single campaign.
    pub async fn reconcile(&self, campaign_id: Uuid) -> anyhow::Result<bool> {
        self.finalizer.finalize(campaign_id).await
    }

    async fn publish_status(&self, campaign_id: Uuid, status: CampaignStatus) -> anyhow::Result<()> {
        let totals = self.cache.read_totals(campaign_id).await?;
        self.bus
            .publish_campaign(&CampaignLifecycleEvent {
                id: campaign_id,
                status: Some(status.as_str().to_string()),
                totals,
                health: None,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::campaign::{Contact, FollowUpDef, FollowUpRule, MessageBody};
    use crate::services::traits::{InMemoryBus, InMemoryCache, InMemoryCampaignStore, InMemoryLedger, InMemoryQueue};

    fn test_cfg() -> Config {
        Config {
            database_url: String::new(),
            redis_url: String::new(),
            jwt_secret: "x".into(),
            smtp_host: None,
            smtp_port: None,
            smtp_username: None,
            smtp_password: None,
            smtp_from_email: "from@test.dev".into(),
            smtp_from_name: "Test".into(),
            public_base_url: "https://track.test".into(),
            webhook_secret: "secret".into(),
            max_attempts: 3,
            email_rate_max: 100,
            email_rate_duration: chrono::Duration::seconds(60),
            email_global_rate_max: 1000,
            email_global_rate_duration: chrono::Duration::seconds(60),
            email_warmup_factor: 1.0,
            email_failure_warn_rate: 0.05,
            email_failure_strict_rate: 0.15,
            email_domain_block_ttl: chrono::Duration::seconds(300),
            email_global_block_ttl: chrono::Duration::seconds(300),
            worker_concurrency: 5,
            reconciler_interval_ms: 60_000,
            permanent_recipient_bypasses_attempts: true,
        }
    }

    struct Harness {
        cp: ControlPlane,
        queue: Arc<InMemoryQueue>,
        ledger: Arc<InMemoryLedger>,
        #[allow(dead_code)]
        cache: Arc<InMemoryCache>,
        campaigns: Arc<InMemoryCampaignStore>,
        bus: Arc<InMemoryBus>,
        max_attempts: i32,
    }

    fn harness(cfg: Config) -> Harness {
        let queue = Arc::new(InMemoryQueue::default());
        let ledger = Arc::new(InMemoryLedger::default());
        let cache = Arc::new(InMemoryCache::default());
        let campaigns = Arc::new(InMemoryCampaignStore::default());
        let bus = Arc::new(InMemoryBus::default());
        let finalizer = Arc::new(Finalizer::new(cache.clone(), ledger.clone(), campaigns.clone(), bus.clone()));
        let max_attempts = cfg.max_attempts;
        let cp = ControlPlane::new(queue.clone(), ledger.clone(), cache.clone(), campaigns.clone(), bus.clone(), finalizer, cfg);
        Harness { cp, queue, ledger, cache, campaigns, bus, max_attempts }
    }

    fn start_request() -> StartCampaignRequest {
        StartCampaignRequest {
            name: "test".into(),
            initial: MessageBody { subject: "Hi".into(), body: "Hello".into(), attachments: vec![] },
            follow_ups: vec![FollowUpDef {
                name: Some("bump".into()),
                delay_minutes: 60,
                rule: FollowUpRule::NoReply,
                subject: "Following up".into(),
                body: "Still there?".into(),
                attachments: vec![],
            }],
            contacts: vec![Contact { id: Uuid::new_v4(), email: "a@gmail.com".into(), name: None }],
        }
    }

    #[tokio::test]
    async fn start_campaign_seeds_ledger_and_queue() {
        let h = harness(test_cfg());
        let req = start_request();
        let contact_id = req.contacts[0].id;
        let campaign_id = h.cp.start_campaign(req).await.unwrap();

        assert!(h.ledger.get(campaign_id, contact_id).await.unwrap().is_some());
        assert_eq!(h.queue.jobs.lock().unwrap().len(), 1);
        assert_eq!(h.campaigns.get(campaign_id).await.unwrap().unwrap().status(), CampaignStatus::Running);
        assert_eq!(h.bus.campaign_events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_status() {
        let h = harness(test_cfg());
        let campaign_id = h.cp.start_campaign(start_request()).await.unwrap();

        h.cp.pause(campaign_id).await.unwrap();
        assert_eq!(h.campaigns.get(campaign_id).await.unwrap().unwrap().status(), CampaignStatus::Paused);

        h.cp.resume(campaign_id).await.unwrap();
        assert_eq!(h.campaigns.get(campaign_id).await.unwrap().unwrap().status(), CampaignStatus::Running);
    }

    #[tokio::test]
    async fn cancel_fails_pending_rows_and_drains_queue() {
        let h = harness(test_cfg());
        let req = start_request();
        let contact_id = req.contacts[0].id;
        let campaign_id = h.cp.start_campaign(req).await.unwrap();
        assert_eq!(h.queue.jobs.lock().unwrap().len(), 1);

        h.cp.cancel(campaign_id).await.unwrap();

        let row = h.ledger.get(campaign_id, contact_id).await.unwrap().unwrap();
        assert_eq!(row.status(), crate::models::ledger::LedgerStatus::Failed);
        assert_eq!(row.last_error.as_deref(), Some("cancelled"));
        assert_eq!(h.queue.jobs.lock().unwrap().len(), 0);
        assert_eq!(h.campaigns.get(campaign_id).await.unwrap().unwrap().status(), CampaignStatus::Cancelled);
    }

    #[tokio::test]
    async fn delete_requires_confirm_and_non_running_status() {
        let h = harness(test_cfg());
        let campaign_id = h.cp.start_campaign(start_request()).await.unwrap();

        assert_eq!(h.cp.delete(campaign_id, true).await.unwrap(), Err(ControlError::DeleteNotConfirmed));
        assert_eq!(h.cp.delete(campaign_id, false).await.unwrap(), Err(ControlError::DeleteNotConfirmed));

        h.cp.cancel(campaign_id).await.unwrap();
        assert_eq!(h.cp.delete(campaign_id, true).await.unwrap(), Ok(()));
        assert!(h.campaigns.get(campaign_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_contact_rejects_ineligible_row() {
        let h = harness(test_cfg());
        let req = start_request();
        let contact_id = req.contacts[0].id;
        let campaign_id = h.cp.start_campaign(req).await.unwrap();

        // row is still `pending`, not `failed` with an exhausted step
        let result = h.cp.retry_contact(campaign_id, contact_id).await.unwrap();
        assert_eq!(result, Err(ControlError::NotRetryEligible));
    }

    #[tokio::test]
    async fn retry_contact_reenqueues_exhausted_failed_row() {
        let h = harness(test_cfg());
        let req = start_request();
        let contact_id = req.contacts[0].id;
        let campaign_id = h.cp.start_campaign(req).await.unwrap();

        // simulate the worker having exhausted bg_attempts and failed the row
        {
            let mut rows = h.ledger.rows.lock().unwrap();
            let row = rows.get_mut(&(campaign_id, contact_id)).unwrap();
            row.status = crate::models::ledger::LedgerStatus::Failed.as_str().to_string();
            row.attempts = 1;
            row.current_step_bg_attempts = h.max_attempts;
        }

        let before = h.queue.jobs.lock().unwrap().len();
        let result = h.cp.retry_contact(campaign_id, contact_id).await.unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(h.queue.jobs.lock().unwrap().len(), before + 1);

        let row = h.ledger.get(campaign_id, contact_id).await.unwrap().unwrap();
        assert_eq!(row.status(), crate::models::ledger::LedgerStatus::Pending);
        assert_eq!(row.attempts, 2);
    }

    #[tokio::test]
    async fn reconcile_triggers_finalize() {
        let h = harness(test_cfg());
        let req = start_request();
        let campaign_id = h.cp.start_campaign(req).await.unwrap();
        // nothing processed yet, so finalize should not yet consider it done
        assert!(!h.cp.reconcile(campaign_id).await.unwrap());
    }
}
