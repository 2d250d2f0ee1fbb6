//! The `DeliveryEngine` value (spec section 9's "global state → owned
//! subsystem" redesign flag). The teacher wires its module-level Postgres
//! pool straight into `main`; here every collaborator is constructed once
//! and handed around as `Arc<dyn Trait>`, so tests build isolated instances
//! instead of reaching for a process-global client.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::services::campaign_store::CampaignStore;
use crate::services::control_plane::ControlPlane;
use crate::services::delivery_worker::DeliveryWorker;
use crate::services::errors::DeliveryError;
use crate::services::event_bus::EventBus;
use crate::services::event_log_store::EventLogStore;
use crate::services::finalizer::Finalizer;
use crate::services::job_queue::JobQueue;
use crate::services::ledger_store::LedgerStore;
use crate::services::meta_cache::MetaCache;
use crate::services::rate_governor::RateGovernor;
use crate::services::reply_correlator::ReplyCorrelator;
use crate::services::reply_store::ReplyStore;
use crate::services::sender::{LettreSender, Sender};
use crate::services::traits::{CacheBackend, CampaignBackend, EventBusBackend, EventLogBackend, GovernorBackend, LedgerBackend, QueueBackend, ReplyBackend};

/// Everything a running process needs: the Postgres pool, Redis connection
/// manager, and every collaborator built against it. Cloning an `Engine` is
/// cheap (every field is an `Arc` or a pool handle) so both `main.rs` and
/// `bin/worker.rs` can share one.
#[derive(Clone)]
pub struct Engine {
    pub cfg: Config,
    pub pool: PgPool,
    pub queue: Arc<JobQueue>,
    pub ledger: Arc<dyn LedgerBackend>,
    pub cache: Arc<dyn CacheBackend>,
    pub campaigns: Arc<dyn CampaignBackend>,
    pub governor: Arc<dyn GovernorBackend>,
    pub events: Arc<dyn EventLogBackend>,
    pub replies: Arc<dyn ReplyBackend>,
    pub bus: Arc<EventBus>,
    pub sender: Arc<dyn Sender>,
    pub finalizer: Arc<Finalizer>,
    pub control_plane: Arc<ControlPlane>,
    pub reply_correlator: Arc<ReplyCorrelator>,
    worker: Arc<DeliveryWorker>,
}

impl Engine {
    /// `Start(config)`: connects the pool and Redis manager, runs
    /// migrations, and builds every collaborator.
    pub async fn start(cfg: Config) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&cfg.database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let redis_client = redis::Client::open(cfg.redis_url.clone())?;
        let conn = ConnectionManager::new(redis_client).await?;

        let queue = Arc::new(JobQueue::new(pool.clone(), cfg.max_attempts));
        let ledger: Arc<dyn LedgerBackend> = Arc::new(LedgerStore::new(pool.clone()));
        let cache: Arc<dyn CacheBackend> = Arc::new(MetaCache::new(conn.clone()));
        let campaigns: Arc<dyn CampaignBackend> = Arc::new(CampaignStore::new(pool.clone()));
        let governor: Arc<dyn GovernorBackend> = Arc::new(RateGovernor::new(conn.clone(), cfg.clone()));
        let events: Arc<dyn EventLogBackend> = Arc::new(EventLogStore::new(pool.clone()));
        let replies: Arc<dyn ReplyBackend> = Arc::new(ReplyStore::new(pool.clone()));
        let bus = Arc::new(EventBus::new(conn));

        let sender: Arc<dyn Sender> = match &cfg.smtp_host {
            Some(host) => Arc::new(LettreSender::new(
                host,
                cfg.smtp_port.unwrap_or(587),
                cfg.smtp_username.clone(),
                cfg.smtp_password.clone(),
                cfg.smtp_from_email.clone(),
                cfg.smtp_from_name.clone(),
            )?),
            None => {
                warn!("SMTP_HOST not set; falling back to a no-op sender");
                Arc::new(crate::services::sender::ScriptedSender::always_succeeds())
            }
        };

        let finalizer = Arc::new(Finalizer::new(cache.clone(), ledger.clone(), campaigns.clone(), bus.clone()));
        let control_plane = Arc::new(ControlPlane::new(
            queue.clone(),
            ledger.clone(),
            cache.clone(),
            campaigns.clone(),
            bus.clone(),
            finalizer.clone(),
            cfg.clone(),
        ));
        let reply_correlator = Arc::new(ReplyCorrelator::new(replies.clone(), ledger.clone(), events.clone(), bus.clone()));

        let worker = Arc::new(DeliveryWorker::new(
            queue.clone(),
            ledger.clone(),
            cache.clone(),
            campaigns.clone(),
            governor.clone(),
            events.clone(),
            bus.clone(),
            sender.clone(),
            finalizer.clone(),
            cfg.clone(),
        ));

        Ok(Self {
            cfg,
            pool,
            queue,
            ledger,
            cache,
            campaigns,
            governor,
            events,
            replies,
            bus,
            sender,
            finalizer,
            control_plane,
            reply_correlator,
            worker,
        })
    }

    /// `Run()`: the worker-pool consumer loop plus the reconciler sweep,
    /// run until `stop()` is observed. `WORKER_CONCURRENCY` bounds an
    /// `Arc<Semaphore>` each claimed job acquires a permit from before being
    /// spawned onto its own task (spec section 5).
    pub async fn run(&self, stop: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.cfg.worker_concurrency));
        let mut consumer_stop = stop.clone();
        let consumer = self.clone();
        let consumer_task = tokio::spawn(async move { consumer.consume_loop(semaphore, consumer_stop.clone()).await });

        let mut reconcile_stop = stop;
        let reconciler = self.clone();
        let reconciler_task = tokio::spawn(async move { reconciler.reconcile_loop(reconcile_stop.clone()).await });

        let _ = tokio::join!(consumer_task, reconciler_task);
        Ok(())
    }

    async fn consume_loop(&self, semaphore: Arc<Semaphore>, mut stop: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                return;
            }
            match self.queue.claim_batch(self.cfg.worker_concurrency as i64).await {
                Ok(jobs) if !jobs.is_empty() => {
                    for job in jobs {
                        let permit = semaphore.clone().acquire_owned().await;
                        let worker = self.worker.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(err) = worker.process_job(&job).await {
                                error!(job_id = %job.id, "delivery worker failed to process job: {err}");
                            }
                        });
                    }
                }
                Ok(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(StdDuration::from_millis(500)) => {}
                        _ = stop.changed() => {}
                    }
                }
                Err(err) => {
                    error!("failed to claim jobs: {err}");
                    tokio::time::sleep(StdDuration::from_secs(1)).await;
                }
            }
        }
    }

    async fn reconcile_loop(&self, mut stop: tokio::sync::watch::Receiver<bool>) {
        let interval = StdDuration::from_millis(self.cfg.reconciler_interval_ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => return,
            }
            if *stop.borrow() {
                return;
            }
            match self.finalizer.reconcile_sweep(200).await {
                Ok(n) if n > 0 => info!("reconciler sweep confirmed {n} campaign(s) finalized"),
                Ok(_) => {}
                Err(err) => error!("reconciler sweep failed: {err}"),
            }
        }
    }
}

/// Classifies an SMTP failure for the Rate Governor's block decision; a
/// thin re-export so `api`/`engine` callers don't need to reach into
/// `services::errors` directly.
pub use DeliveryError as SendError;
