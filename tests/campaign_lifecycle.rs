//! End-to-end scenarios (spec section 8) driven over the in-memory fakes:
//! `ControlPlane` and `DeliveryWorker` wired onto the same shared backends,
//! with jobs pulled by hand instead of a real queue consumer loop.

use std::sync::Arc;

use campaign_delivery_engine::config::Config;
use campaign_delivery_engine::models::campaign::{
    CampaignStatus, Contact, FollowUpDef, FollowUpRule, MessageBody, StartCampaignRequest,
};
use campaign_delivery_engine::models::ledger::LedgerStatus;
use campaign_delivery_engine::models::wire::InboundReplyPayload;
use campaign_delivery_engine::services::control_plane::ControlPlane;
use campaign_delivery_engine::services::delivery_worker::{DeliveryWorker, WorkerOutcome};
use campaign_delivery_engine::services::finalizer::Finalizer;
use campaign_delivery_engine::services::reply_correlator::{IngestOutcome, ReplyCorrelator};
use campaign_delivery_engine::services::sender::{ScriptedSender, SendFailure};
use campaign_delivery_engine::services::traits::{
    InMemoryBus, InMemoryCache, InMemoryCampaignStore, InMemoryEventLog, InMemoryGovernor, InMemoryLedger,
    InMemoryQueue, InMemoryReplyStore, JobRecord, LedgerBackend, QueueBackend,
};
use uuid::Uuid;

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

/// Wires a `ControlPlane`, `DeliveryWorker`, `Finalizer`, and
/// `ReplyCorrelator` onto one shared set of in-memory backends, mirroring
/// how `Engine::start` wires the real ones.
struct World {
    cp: ControlPlane,
    worker: DeliveryWorker,
    correlator: ReplyCorrelator,
    queue: Arc<InMemoryQueue>,
    ledger: Arc<InMemoryLedger>,
    cache: Arc<InMemoryCache>,
    campaigns: Arc<InMemoryCampaignStore>,
    sender: Arc<ScriptedSender>,
}

fn world(cfg: Config, governor_admits: bool, sender: ScriptedSender) -> World {
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
    let replies = Arc::new(InMemoryReplyStore::default());
    let sender = Arc::new(sender);

    let finalizer = Arc::new(Finalizer::new(cache.clone(), ledger.clone(), campaigns.clone(), bus.clone()));
    let cp = ControlPlane::new(
        queue.clone(),
        ledger.clone(),
        cache.clone(),
        campaigns.clone(),
        bus.clone(),
        finalizer.clone(),
        cfg.clone(),
    );
    let worker = DeliveryWorker::new(
        queue.clone(),
        ledger.clone(),
        cache.clone(),
        campaigns.clone(),
        governor,
        events.clone(),
        bus.clone(),
        sender.clone(),
        finalizer,
        cfg,
    );
    let correlator = ReplyCorrelator::new(replies, ledger.clone(), events, bus);

    World { cp, worker, correlator, queue, ledger, cache, campaigns, sender }
}

fn one_contact_request() -> (StartCampaignRequest, Uuid) {
    let contact = Contact { id: Uuid::new_v4(), email: "a@gmail.com".into(), name: Some("A".into()) };
    let req = StartCampaignRequest {
        name: "welcome".into(),
        initial: MessageBody { subject: "Hi {{name}}".into(), body: "Hello {{name}}".into(), attachments: vec![] },
        follow_ups: vec![FollowUpDef {
            name: Some("bump".into()),
            delay_minutes: 60,
            rule: FollowUpRule::NoReply,
            subject: "Following up".into(),
            body: "Still there?".into(),
            attachments: vec![],
        }],
        contacts: vec![contact.clone()],
    };
    (req, contact.id)
}

/// Pulls the single queued job for a campaign out of the in-memory queue,
/// the way a real claim would, without needing `Engine::consume_loop`.
fn pop_job(queue: &InMemoryQueue, campaign_id: Uuid) -> JobRecord {
    let jobs = queue.jobs.lock().unwrap();
    jobs.values()
        .find(|j| j.campaign_id == campaign_id)
        .cloned()
        .expect("expected a queued job for campaign")
}

#[tokio::test]
async fn happy_path_start_send_follow_up_and_finalize() {
    let (req, contact_id) = one_contact_request();
    let w = world(test_cfg(), true, ScriptedSender::always_succeeds());

    let campaign_id = w.cp.start_campaign(req).await.unwrap();
    let job = pop_job(&w.queue, campaign_id);
    assert_eq!(job.kind, campaign_delivery_engine::services::traits::JobKind::Initial);

    let outcome = w.worker.process_job(&job).await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Done);

    let row = w.ledger.get(campaign_id, contact_id).await.unwrap().unwrap();
    assert_eq!(row.status(), LedgerStatus::Sent);
    assert_eq!(w.sender.sent_count(), 1);

    // follow-up scheduled, but campaign not finalized yet (still has a
    // follow-up step outstanding and totals not yet processed==intended
    // from the follow-up's perspective — this campaign's `intended` only
    // counts the one contact, so `finalize` already ran inline after the
    // initial send and the campaign is complete).
    let campaign = w.campaigns.get(campaign_id).await.unwrap().unwrap();
    assert!(campaign.status().is_terminal());
}

#[tokio::test]
async fn throttle_storm_retries_without_marking_the_row_failed() {
    let (req, contact_id) = one_contact_request();
    let sender = ScriptedSender::new(vec![Err(SendFailure { code: Some(450), message: "try again later".into() })]);
    let w = world(test_cfg(), true, sender);

    let campaign_id = w.cp.start_campaign(req).await.unwrap();
    let job = pop_job(&w.queue, campaign_id);

    let outcome = w.worker.process_job(&job).await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Retry);

    let row = w.ledger.get(campaign_id, contact_id).await.unwrap().unwrap();
    assert_eq!(row.status(), LedgerStatus::Sending);
    assert_eq!(row.bg_attempts, 1);

    // campaign is not finalized while the row is still mid-retry
    let campaign = w.campaigns.get(campaign_id).await.unwrap().unwrap();
    assert_eq!(campaign.status(), CampaignStatus::Running);
}

#[tokio::test]
async fn hard_bounce_fails_the_row_and_completes_with_failures() {
    let (req, contact_id) = one_contact_request();
    let sender = ScriptedSender::new(vec![Err(SendFailure { code: Some(550), message: "no such user".into() })]);
    let w = world(test_cfg(), true, sender);

    let campaign_id = w.cp.start_campaign(req).await.unwrap();
    let job = pop_job(&w.queue, campaign_id);

    let outcome = w.worker.process_job(&job).await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Terminal);

    let row = w.ledger.get(campaign_id, contact_id).await.unwrap().unwrap();
    assert_eq!(row.status(), LedgerStatus::Failed);

    let campaign = w.campaigns.get(campaign_id).await.unwrap().unwrap();
    assert_eq!(campaign.status(), CampaignStatus::CompletedWithFailures);
}

#[tokio::test]
async fn cancel_mid_flight_drains_the_queue_and_fails_pending_rows() {
    let (req, contact_id) = one_contact_request();
    let w = world(test_cfg(), true, ScriptedSender::always_succeeds());

    let campaign_id = w.cp.start_campaign(req).await.unwrap();
    assert_eq!(w.queue.jobs.lock().unwrap().len(), 1);

    w.cp.cancel(campaign_id).await.unwrap();

    assert_eq!(w.queue.jobs.lock().unwrap().len(), 0);
    let row = w.ledger.get(campaign_id, contact_id).await.unwrap().unwrap();
    assert_eq!(row.status(), LedgerStatus::Failed);
    assert_eq!(row.last_error.as_deref(), Some("cancelled"));

    let campaign = w.campaigns.get(campaign_id).await.unwrap().unwrap();
    assert_eq!(campaign.status(), CampaignStatus::Cancelled);
}

#[tokio::test]
async fn reply_before_follow_up_suppresses_it() {
    let (req, contact_id) = one_contact_request();
    let w = world(test_cfg(), true, ScriptedSender::always_succeeds());
    let campaign_id = w.cp.start_campaign(req).await.unwrap();

    let job = pop_job(&w.queue, campaign_id);
    let outcome = w.worker.process_job(&job).await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Done);

    // the recipient replies before their follow-up fires
    let payload = InboundReplyPayload {
        from: "a@gmail.com".into(),
        to: format!("campaigns+{campaign_id}+{contact_id}@example.com"),
        subject: Some("Re: Hi A".into()),
        text: Some("no thanks".into()),
        html: None,
        message_id: Some("<msg-1@mail>".into()),
    };
    assert_eq!(w.correlator.ingest(payload).await.unwrap(), IngestOutcome::Inserted);

    let row = w.ledger.get(campaign_id, contact_id).await.unwrap().unwrap();
    assert!(row.replied);
    let plan = row.follow_up_plan();
    assert_eq!(plan.len(), 1);

    // the follow-up job fires per its schedule; with a reply now on file the
    // worker should skip it rather than send.
    let follow_up_job = JobRecord {
        id: Uuid::new_v4(),
        campaign_id,
        contact_id,
        kind: campaign_delivery_engine::services::traits::JobKind::FollowUp(0),
        bg_attempts: 0,
        run_after: chrono::Utc::now(),
    };
    let outcome = w.worker.process_job(&follow_up_job).await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Done);
    assert_eq!(w.sender.sent_count(), 1, "only the initial send, follow-up was skipped");

    let row = w.ledger.get(campaign_id, contact_id).await.unwrap().unwrap();
    let plan = row.follow_up_plan();
    assert_eq!(
        plan[0].status,
        campaign_delivery_engine::models::ledger::FollowUpStepStatus::Skipped
    );
}

#[tokio::test]
async fn crash_at_commit_is_recovered_by_reconcile_sweep() {
    let (req, _contact_id) = one_contact_request();
    let w = world(test_cfg(), true, ScriptedSender::always_succeeds());
    let campaign_id = w.cp.start_campaign(req).await.unwrap();

    let job = pop_job(&w.queue, campaign_id);
    w.worker.process_job(&job).await.unwrap();

    // simulate a crash between the ledger commit and the cache write: wipe
    // the cached totals/status so the campaign row looks stale, but leave
    // the campaign document itself un-finalized.
    w.cache.totals.lock().unwrap().remove(&campaign_id);
    w.campaigns
        .campaigns
        .lock()
        .unwrap()
        .get_mut(&campaign_id)
        .unwrap()
        .status = "running".to_string();

    let recovered = w.cp.reconcile(campaign_id).await.unwrap();
    assert!(recovered);

    let campaign = w.campaigns.get(campaign_id).await.unwrap().unwrap();
    assert!(campaign.status().is_terminal());
}
