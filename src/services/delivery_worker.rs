//! Delivery Worker (C7), spec section 4.5: the per-job state machine
//! (`READ_STATUS → LOAD_LEDGER → ACQUIRE_PERMIT → LOAD_DEFINITION →
//! MARK_SENDING → RENDER → SEND → COMMIT`). Grounded on the teacher's
//! `bin/worker.rs` job-consumer loop, generalized from its fixed
//! `job_type` string dispatch into this campaign-specific state machine,
//! and on `errors.rs`'s `Outcome` enum for the "throw to retry" redesign.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use rand::Rng;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::models::campaign::{Attachment, CampaignDefinition, Contact, FollowUpRule};
use crate::models::event::{CampaignEvent, EventType};
use crate::models::ledger::{FollowUpPlanEntry, FollowUpStepStatus, LedgerRow};
use crate::models::wire::ContactUpdateEvent;
use crate::services::errors::{DeliveryError, Outcome};
use crate::services::finalizer::Finalizer;
use crate::services::html_rewriter;
use crate::services::job_queue::compute_backoff;
use crate::services::rate_governor::{classify_smtp_signal, RateGovernor};
use crate::services::sender::{OutboundMessage, Sender};
use crate::services::traits::{
    CacheBackend, CampaignBackend, EventBusBackend, EventLogBackend, GovernorBackend, JobKind, JobRecord,
    LedgerBackend, QueueBackend,
};

/// What the caller driving the queue-consumer loop should do next. The
/// queue itself already recorded completion/retry/failure by the time this
/// is returned; the variant exists for logging and test assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Done,
    Retry,
    Terminal,
}

pub struct DeliveryWorker {
    queue: Arc<dyn QueueBackend>,
    ledger: Arc<dyn LedgerBackend>,
    cache: Arc<dyn CacheBackend>,
    campaigns: Arc<dyn CampaignBackend>,
    governor: Arc<dyn GovernorBackend>,
    events: Arc<dyn EventLogBackend>,
    bus: Arc<dyn EventBusBackend>,
    sender: Arc<dyn Sender>,
    finalizer: Arc<Finalizer>,
    cfg: Config,
}

impl DeliveryWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        ledger: Arc<dyn LedgerBackend>,
        cache: Arc<dyn CacheBackend>,
        campaigns: Arc<dyn CampaignBackend>,
        governor: Arc<dyn GovernorBackend>,
        events: Arc<dyn EventLogBackend>,
        bus: Arc<dyn EventBusBackend>,
        sender: Arc<dyn Sender>,
        finalizer: Arc<Finalizer>,
        cfg: Config,
    ) -> Self {
        Self {
            queue,
            ledger,
            cache,
            campaigns,
            governor,
            events,
            bus,
            sender,
            finalizer,
            cfg,
        }
    }

    /// Drives one claimed job through the full state machine.
    pub async fn process_job(&self, job: &JobRecord) -> anyhow::Result<WorkerOutcome> {
        match self.campaign_status(job.campaign_id).await? {
            None => {
                self.queue.mark_completed(job.id).await?;
                return Ok(WorkerOutcome::Done);
            }
            Some(status) if status == "paused" || status == "cancelled" => {
                self.queue.mark_completed(job.id).await?;
                return Ok(WorkerOutcome::Done);
            }
            _ => {}
        }

        let row = match self.ledger.get(job.campaign_id, job.contact_id).await? {
            Some(row) => row,
            None => {
                warn!(campaign_id = %job.campaign_id, contact_id = %job.contact_id, "queued job has no ledger row");
                self.queue.mark_completed(job.id).await?;
                return Ok(WorkerOutcome::Done);
            }
        };

        if row.email.trim().is_empty() {
            self.ledger
                .commit_failed(job.campaign_id, job.contact_id, "missing contact or email")
                .await?;
            self.cache.incr_failed(job.campaign_id).await?;
            self.publish_contact_update(job.campaign_id, job.contact_id, Some("failed")).await?;
            self.finalizer.finalize(job.campaign_id).await?;
            self.queue.mark_completed(job.id).await?;
            return Ok(WorkerOutcome::Done);
        }

        let definition = match self.load_definition(job.campaign_id).await? {
            Some(d) => d,
            None => return self.config_missing_retry(job, "campaign definition not found").await,
        };

        match job.kind {
            JobKind::Initial => self.process_initial(job, &row, &definition).await,
            JobKind::FollowUp(step) => self.process_follow_up(job, &row, &definition, step).await,
        }
    }

    async fn campaign_status(&self, campaign_id: Uuid) -> anyhow::Result<Option<String>> {
        if let Some(status) = self.cache.read_status(campaign_id).await? {
            return Ok(Some(status));
        }
        Ok(self.campaigns.get(campaign_id).await?.map(|c| c.status))
    }

    async fn load_definition(&self, campaign_id: Uuid) -> anyhow::Result<Option<CampaignDefinition>> {
        if let Some(raw) = self.cache.read_definition(campaign_id).await? {
            if let Ok(def) = serde_json::from_value(raw) {
                return Ok(Some(def));
            }
        }
        let campaign = match self.campaigns.get(campaign_id).await? {
            Some(c) => c,
            None => return Ok(None),
        };
        let def = campaign.definition().ok();
        if let Some(def) = &def {
            if let Ok(json) = serde_json::to_value(def) {
                let _ = self.cache.write_definition(campaign_id, &json).await;
            }
        }
        Ok(def)
    }

    async fn process_initial(
        &self,
        job: &JobRecord,
        row: &LedgerRow,
        definition: &CampaignDefinition,
    ) -> anyhow::Result<WorkerOutcome> {
        let contact = definition.contacts.iter().find(|c| c.id == job.contact_id).cloned();
        let message = definition.initial.clone();
        self.send_step(
            job,
            row,
            definition,
            -1,
            None,
            message.subject,
            message.body,
            message.attachments,
            contact,
            true,
        )
        .await
    }

    async fn process_follow_up(
        &self,
        job: &JobRecord,
        row: &LedgerRow,
        definition: &CampaignDefinition,
        step: usize,
    ) -> anyhow::Result<WorkerOutcome> {
        let fu = match definition.follow_ups.get(step) {
            Some(fu) => fu.clone(),
            None => {
                return self
                    .config_missing_retry(job, &format!("follow-up step {step} no longer defined"))
                    .await
            }
        };

        let should_send = match fu.rule {
            FollowUpRule::Always => true,
            FollowUpRule::NoReply => !row.replied,
            FollowUpRule::Replied => row.replied,
        };

        if !should_send {
            let reason = match fu.rule {
                FollowUpRule::NoReply => "replied",
                FollowUpRule::Replied => "requires-reply",
                FollowUpRule::Always => unreachable!("always-rule never skips"),
            };
            self.ledger
                .mark_follow_up_skipped(job.campaign_id, job.contact_id, step, reason)
                .await?;
            self.events
                .append(&CampaignEvent::new(job.campaign_id, job.contact_id, EventType::FollowupSkipped).with_trace(
                    serde_json::json!({ "reason": reason }),
                ))
                .await?;
            self.publish_contact_update(job.campaign_id, job.contact_id, Some("followup_skipped")).await?;
            self.queue.mark_completed(job.id).await?;
            return Ok(WorkerOutcome::Done);
        }

        let contact = definition.contacts.iter().find(|c| c.id == job.contact_id).cloned();
        let step_name = fu.name.clone().unwrap_or_else(|| format!("followup_{step}"));
        self.send_step(
            job,
            row,
            definition,
            step as i32,
            Some(step_name),
            fu.subject,
            fu.body,
            fu.attachments,
            contact,
            false,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_step(
        &self,
        job: &JobRecord,
        row: &LedgerRow,
        definition: &CampaignDefinition,
        step_index: i32,
        step_name: Option<String>,
        subject_template: String,
        body_template: String,
        attachments: Vec<Attachment>,
        contact: Option<Contact>,
        is_initial: bool,
    ) -> anyhow::Result<WorkerOutcome> {
        let domain = domain_of(&row.email);

        if !self.governor.try_acquire(&domain).await? {
            // Never reached SMTP: bg_attempts must not move (spec section 4.2).
            self.ledger
                .write_intermediate_error(
                    job.campaign_id,
                    job.contact_id,
                    job.bg_attempts,
                    &format!("throttled: local permit denied for domain {domain}"),
                )
                .await?;
            let delay = compute_backoff(job.bg_attempts.max(1) as u32);
            self.queue.reschedule_only(job.id, delay).await?;
            self.publish_contact_update(job.campaign_id, job.contact_id, None).await?;
            return Ok(WorkerOutcome::Retry);
        }

        let next_attempt = job.bg_attempts + 1;
        self.ledger.mark_attempt(job.campaign_id, job.contact_id, next_attempt).await?;
        if is_initial {
            self.ledger.bump_first_attempt(job.campaign_id, job.contact_id).await?;
        }
        self.ledger.mark_sending(job.campaign_id, job.contact_id).await?;

        let jitter_ms = rand::thread_rng().gen_range(250..=1250);
        tokio::time::sleep(StdDuration::from_millis(jitter_ms)).await;

        let subject = substitute(&subject_template, contact.as_ref(), &row.email);
        let rendered_body = substitute(&body_template, contact.as_ref(), &row.email);
        let now_ms = Utc::now().timestamp_millis();
        let html = html_rewriter::rewrite(&rendered_body, &self.cfg.public_base_url, job.campaign_id, job.contact_id, now_ms);
        let text = html_rewriter::to_plain_text(&rendered_body);

        let outbound = OutboundMessage {
            to_email: row.email.clone(),
            subject,
            html,
            text,
            attachments,
        };

        match self.sender.send(&outbound).await {
            Ok(()) => {
                self.governor.record_outcome(&domain, true).await?;
                self.cache.record_domain_health(job.campaign_id, &domain, true).await?;
                self.ledger
                    .commit_sent(job.campaign_id, job.contact_id, step_index, step_name.as_deref())
                    .await?;

                if is_initial {
                    self.cache.incr_sent(job.campaign_id).await?;
                    self.schedule_follow_ups(job.campaign_id, job.contact_id, definition).await?;
                } else {
                    let step = step_index as usize;
                    self.ledger.mark_follow_up_sent(job.campaign_id, job.contact_id, step).await?;
                    self.events
                        .append(&CampaignEvent::new(job.campaign_id, job.contact_id, EventType::FollowupSent))
                        .await?;
                }

                self.publish_contact_update(job.campaign_id, job.contact_id, Some("sent")).await?;

                if is_initial {
                    self.finalizer.finalize(job.campaign_id).await?;
                }

                self.queue.mark_completed(job.id).await?;
                Ok(WorkerOutcome::Done)
            }
            Err(failure) => {
                self.governor.record_outcome(&domain, false).await?;
                self.cache.record_domain_health(job.campaign_id, &domain, false).await?;
                if let Some(trips_global) = classify_smtp_signal(failure.code, &failure.message) {
                    let fail_rate = self.governor.failure_rate(&domain).await?;
                    let ttl = RateGovernor::block_ttl(self.cfg.email_domain_block_ttl, next_attempt as u32, fail_rate);
                    let block_domain = if trips_global { None } else { Some(domain.as_str()) };
                    self.governor.set_block(block_domain, ttl).await?;
                }
                let error = DeliveryError::from_smtp(failure.code, &failure.message);
                self.handle_send_failure(job, step_index, is_initial, error, next_attempt).await
            }
        }
    }

    async fn handle_send_failure(
        &self,
        job: &JobRecord,
        step_index: i32,
        is_initial: bool,
        error: DeliveryError,
        next_attempt: i32,
    ) -> anyhow::Result<WorkerOutcome> {
        let outcome = error.classify(self.cfg.permanent_recipient_bypasses_attempts);
        let terminal = matches!(outcome, Outcome::Fatal) || next_attempt >= self.cfg.max_attempts;

        if !terminal {
            self.ledger
                .write_intermediate_error(job.campaign_id, job.contact_id, next_attempt, &error.to_string())
                .await?;
            self.queue.retry_in_place(job.id, compute_backoff(next_attempt as u32)).await?;
            return Ok(WorkerOutcome::Retry);
        }

        if is_initial {
            self.ledger.commit_failed(job.campaign_id, job.contact_id, &error.to_string()).await?;
            self.cache.incr_failed(job.campaign_id).await?;
            self.publish_contact_update(job.campaign_id, job.contact_id, Some("failed")).await?;
            self.finalizer.finalize(job.campaign_id).await?;
        } else {
            self.ledger
                .mark_follow_up_skipped(job.campaign_id, job.contact_id, step_index as usize, "send-failed")
                .await?;
            self.events
                .append(&CampaignEvent::new(job.campaign_id, job.contact_id, EventType::FollowupSkipped).with_trace(
                    serde_json::json!({ "reason": "send-failed", "error": error.to_string() }),
                ))
                .await?;
            self.publish_contact_update(job.campaign_id, job.contact_id, Some("followup_failed")).await?;
        }

        self.queue.mark_failed(job.id).await?;
        Ok(WorkerOutcome::Terminal)
    }

    async fn config_missing_retry(&self, job: &JobRecord, reason: &str) -> anyhow::Result<WorkerOutcome> {
        let next_attempt = job.bg_attempts + 1;
        self.ledger
            .write_intermediate_error(job.campaign_id, job.contact_id, next_attempt, &format!("config missing: {reason}"))
            .await?;
        self.queue.retry_in_place(job.id, compute_backoff(next_attempt as u32)).await?;
        Ok(WorkerOutcome::Retry)
    }

    /// Spec section 4.5: one `followup` job per step with a positive delay,
    /// enqueued only after the initial send succeeds.
    async fn schedule_follow_ups(&self, campaign_id: Uuid, contact_id: Uuid, definition: &CampaignDefinition) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut plan = Vec::with_capacity(definition.follow_ups.len());
        for (i, fu) in definition.follow_ups.iter().enumerate() {
            if fu.delay_minutes > 0 {
                let delay = Duration::seconds(fu.delay_minutes * 60);
                self.queue.enqueue(campaign_id, contact_id, JobKind::FollowUp(i), delay).await?;
                plan.push(FollowUpPlanEntry::scheduled(now + delay));
            } else {
                plan.push(FollowUpPlanEntry {
                    status: FollowUpStepStatus::Skipped,
                    scheduled_for: None,
                    sent_at: None,
                    skipped_at: Some(now),
                    skipped_reason: Some("non-positive delay".to_string()),
                });
            }
        }
        self.ledger.set_follow_up_plan(campaign_id, contact_id, plan).await?;
        Ok(())
    }

    async fn publish_contact_update(&self, campaign_id: Uuid, contact_id: Uuid, event: Option<&str>) -> anyhow::Result<()> {
        let mut evt = ContactUpdateEvent::new(campaign_id, contact_id);
        if let Some(row) = self.ledger.get(campaign_id, contact_id).await? {
            evt.status = Some(row.status.clone());
            evt.attempts = Some(row.attempts);
            evt.bg_attempts = Some(row.bg_attempts);
            evt.last_attempt_at = row.last_attempt_at;
            evt.last_error = row.last_error.clone();
            evt.opened_at = row.opened_at;
            evt.last_click_at = row.last_click_at;
            evt.replies_count = Some(row.replies_count);
            evt.last_reply_at = row.last_reply_at;
        }
        evt.event = event.map(|s| s.to_string());
        self.bus.publish_contact(&evt).await
    }
}

fn domain_of(email: &str) -> String {
    email.rsplit('@').next().unwrap_or("").to_ascii_lowercase()
}

/// Spec section 1's non-goal "no templating engine beyond string
/// substitution at the boundary": replaces `{{name}}`/`{{email}}` tokens.
fn substitute(template: &str, contact: Option<&Contact>, fallback_email: &str) -> String {
    let name = contact
        .and_then(|c| c.name.clone())
        .unwrap_or_else(|| "there".to_string());
    let email = contact.map(|c| c.email.clone()).unwrap_or_else(|| fallback_email.to_string());
    template.replace("{{name}}", &name).replace("{{email}}", &email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::campaign::{FollowUpDef, MessageBody, Totals};
    use crate::services::sender::ScriptedSender;
    use crate::services::traits::{
        InMemoryBus, InMemoryCache, InMemoryCampaignStore, InMemoryEventLog, InMemoryGovernor, InMemoryLedger,
        InMemoryQueue,
    };

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
            email_rate_duration: Duration::seconds(60),
            email_global_rate_max: 1000,
            email_global_rate_duration: Duration::seconds(60),
            email_warmup_factor: 1.0,
            email_failure_warn_rate: 0.05,
            email_failure_strict_rate: 0.15,
            email_domain_block_ttl: Duration::seconds(300),
            email_global_block_ttl: Duration::seconds(300),
            worker_concurrency: 5,
            reconciler_interval_ms: 60_000,
            permanent_recipient_bypasses_attempts: true,
        }
    }

    struct Harness {
        worker: DeliveryWorker,
        queue: Arc<InMemoryQueue>,
        ledger: Arc<InMemoryLedger>,
        cache: Arc<InMemoryCache>,
        campaigns: Arc<InMemoryCampaignStore>,
        sender: Arc<ScriptedSender>,
    }

    fn harness(cfg: Config, governor_admits: bool, sender: ScriptedSender) -> Harness {
        let queue = Arc::new(InMemoryQueue::default());
        let ledger = Arc::new(InMemoryLedger::default());
        let cache = Arc::new(InMemoryCache::default());
        let campaigns = Arc::new(InMemoryCampaignStore::default());
        let governor = Arc::new(if governor_admits {
            InMemoryGovernor::always_admit()
        } else {
            InMemoryGovernor::always_deny()
        });
        let events = Arc::new(InMemoryEventLog::default());
        let bus = Arc::new(InMemoryBus::default());
        let sender = Arc::new(sender);
        let finalizer = Arc::new(Finalizer::new(cache.clone(), ledger.clone(), campaigns.clone(), bus.clone()));

        let worker = DeliveryWorker::new(
            queue.clone(),
            ledger.clone(),
            cache.clone(),
            campaigns.clone(),
            governor,
            events,
            bus,
            sender.clone(),
            finalizer,
            cfg,
        );

        Harness { worker, queue, ledger, cache, campaigns, sender }
    }

    fn one_contact_definition() -> (CampaignDefinition, Contact) {
        let contact = Contact { id: Uuid::new_v4(), email: "a@gmail.com".into(), name: Some("A".into()) };
        let def = CampaignDefinition {
            initial: MessageBody { subject: "Hi {{name}}".into(), body: "Hello {{name}}".into(), attachments: vec![] },
            follow_ups: vec![FollowUpDef {
                name: Some("bump".into()),
                delay_minutes: 1,
                rule: FollowUpRule::NoReply,
                subject: "Following up".into(),
                body: "Still there?".into(),
                attachments: vec![],
            }],
            contacts: vec![contact.clone()],
        };
        (def, contact)
    }

    async fn seed_campaign(h: &Harness, def: &CampaignDefinition, contact: &Contact) -> Uuid {
        let campaign_id = Uuid::new_v4();
        h.campaigns.create(campaign_id, "test", def, 1).await.unwrap();
        h.ledger.insert_pending(campaign_id, contact.id, &contact.email);
        campaign_id
    }

    #[tokio::test]
    async fn happy_path_sends_and_schedules_follow_up() {
        let (def, contact) = one_contact_definition();
        let h = harness(test_cfg(), true, ScriptedSender::always_succeeds());
        let campaign_id = seed_campaign(&h, &def, &contact).await;

        let job = JobRecord {
            id: Uuid::new_v4(),
            campaign_id,
            contact_id: contact.id,
            kind: JobKind::Initial,
            bg_attempts: 0,
            run_after: Utc::now(),
        };

        let outcome = h.worker.process_job(&job).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Done);

        let row = h.ledger.get(campaign_id, contact.id).await.unwrap().unwrap();
        assert_eq!(row.status(), crate::models::ledger::LedgerStatus::Sent);
        assert_eq!(row.bg_attempts, 1);
        assert_eq!(row.attempts, 1);
        assert_eq!(h.sender.sent_count(), 1);

        // follow-up job enqueued
        assert_eq!(h.queue.jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn permanent_bounce_fails_row_and_finalizes() {
        let (def, contact) = one_contact_definition();
        let sender = ScriptedSender::new(vec![Err(crate::services::sender::SendFailure {
            code: Some(550),
            message: "no such user".into(),
        })]);
        let h = harness(test_cfg(), true, sender);
        let campaign_id = seed_campaign(&h, &def, &contact).await;

        let job = JobRecord {
            id: Uuid::new_v4(),
            campaign_id,
            contact_id: contact.id,
            kind: JobKind::Initial,
            bg_attempts: 0,
            run_after: Utc::now(),
        };

        let outcome = h.worker.process_job(&job).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Terminal);

        let row = h.ledger.get(campaign_id, contact.id).await.unwrap().unwrap();
        assert_eq!(row.status(), crate::models::ledger::LedgerStatus::Failed);
        assert_eq!(row.bg_attempts, 1);

        let campaign = h.campaigns.get(campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.status(), crate::models::campaign::CampaignStatus::CompletedWithFailures);
    }

    #[tokio::test]
    async fn transient_failure_retries_without_marking_failed() {
        let (def, contact) = one_contact_definition();
        let sender = ScriptedSender::new(vec![Err(crate::services::sender::SendFailure {
            code: Some(450),
            message: "try again later".into(),
        })]);
        let mut cfg = test_cfg();
        cfg.max_attempts = 3;
        let h = harness(cfg, true, sender);
        let campaign_id = seed_campaign(&h, &def, &contact).await;

        let job = JobRecord {
            id: Uuid::new_v4(),
            campaign_id,
            contact_id: contact.id,
            kind: JobKind::Initial,
            bg_attempts: 0,
            run_after: Utc::now(),
        };

        let outcome = h.worker.process_job(&job).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Retry);

        let row = h.ledger.get(campaign_id, contact.id).await.unwrap().unwrap();
        assert_eq!(row.status(), crate::models::ledger::LedgerStatus::Sending);
        assert_eq!(row.bg_attempts, 1);
        assert_eq!(row.last_error.as_deref(), Some("throttled: 450: try again later"));
    }

    #[tokio::test]
    async fn locally_denied_permit_does_not_bump_bg_attempts() {
        let (def, contact) = one_contact_definition();
        let h = harness(test_cfg(), false, ScriptedSender::always_succeeds());
        let campaign_id = seed_campaign(&h, &def, &contact).await;

        let job = JobRecord {
            id: Uuid::new_v4(),
            campaign_id,
            contact_id: contact.id,
            kind: JobKind::Initial,
            bg_attempts: 0,
            run_after: Utc::now(),
        };

        let outcome = h.worker.process_job(&job).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Retry);

        let row = h.ledger.get(campaign_id, contact.id).await.unwrap().unwrap();
        assert_eq!(row.bg_attempts, 0);
        assert_eq!(h.sender.sent_count(), 0);
    }

    #[tokio::test]
    async fn paused_campaign_is_a_noop() {
        let (def, contact) = one_contact_definition();
        let h = harness(test_cfg(), true, ScriptedSender::always_succeeds());
        let campaign_id = seed_campaign(&h, &def, &contact).await;
        h.cache
            .write_totals(campaign_id, &Totals::default(), "paused")
            .await
            .unwrap();

        let job = JobRecord {
            id: Uuid::new_v4(),
            campaign_id,
            contact_id: contact.id,
            kind: JobKind::Initial,
            bg_attempts: 0,
            run_after: Utc::now(),
        };

        let outcome = h.worker.process_job(&job).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Done);
        assert_eq!(h.sender.sent_count(), 0);
    }

    #[tokio::test]
    async fn no_reply_follow_up_skips_when_replied() {
        let (def, contact) = one_contact_definition();
        let h = harness(test_cfg(), true, ScriptedSender::always_succeeds());
        let campaign_id = seed_campaign(&h, &def, &contact).await;
        h.ledger
            .record_reply(campaign_id, contact.id, "thanks", Utc::now())
            .await
            .unwrap();
        h.ledger
            .set_follow_up_plan(campaign_id, contact.id, vec![FollowUpPlanEntry::scheduled(Utc::now())])
            .await
            .unwrap();

        let job = JobRecord {
            id: Uuid::new_v4(),
            campaign_id,
            contact_id: contact.id,
            kind: JobKind::FollowUp(0),
            bg_attempts: 0,
            run_after: Utc::now(),
        };

        let outcome = h.worker.process_job(&job).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Done);
        assert_eq!(h.sender.sent_count(), 0);

        let row = h.ledger.get(campaign_id, contact.id).await.unwrap().unwrap();
        let plan = row.follow_up_plan();
        assert_eq!(plan[0].status, FollowUpStepStatus::Skipped);
        assert_eq!(plan[0].skipped_reason.as_deref(), Some("replied"));
    }
}
