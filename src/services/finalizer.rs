//! Finalizer / Reconciler (C8), spec section 4.6. `finalize` is invoked
//! inline by the Delivery Worker after every initial-step resolution, and
//! again periodically by the Reconciler sweep (`bin/worker.rs`) to correct
//! drift from crash-at-commit, cache eviction, or out-of-order counters.

use std::sync::Arc;
use uuid::Uuid;

use crate::models::campaign::CampaignStatus;
use crate::models::wire::CampaignLifecycleEvent;
use crate::services::traits::{CacheBackend, CampaignBackend, EventBusBackend, LedgerBackend};

pub struct Finalizer {
    cache: Arc<dyn CacheBackend>,
    ledger: Arc<dyn LedgerBackend>,
    campaigns: Arc<dyn CampaignBackend>,
    bus: Arc<dyn EventBusBackend>,
}

impl Finalizer {
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        ledger: Arc<dyn LedgerBackend>,
        campaigns: Arc<dyn CampaignBackend>,
        bus: Arc<dyn EventBusBackend>,
    ) -> Self {
        Self { cache, ledger, campaigns, bus }
    }

    /// Returns `true` if the campaign was (already, or just now) finalized.
    pub async fn finalize(&self, campaign_id: Uuid) -> anyhow::Result<bool> {
        let campaign = match self.campaigns.get(campaign_id).await? {
            Some(c) => c,
            None => return Ok(false),
        };
        if campaign.status().is_terminal() {
            return Ok(true);
        }

        let totals = match self.cache.read_totals(campaign_id).await? {
            Some(t) => t,
            None => self.ledger.aggregate_totals(campaign_id).await?,
        };
        let processed = totals.sent + totals.failed;
        let total = campaign.intended.max(processed);

        if total == 0 || processed < total {
            return Ok(false);
        }

        let status = if totals.failed == 0 {
            CampaignStatus::Completed
        } else {
            CampaignStatus::CompletedWithFailures
        };

        self.campaigns.complete(campaign_id, status.as_str(), &totals).await?;
        self.cache.write_totals(campaign_id, &totals, status.as_str()).await?;
        self.bus
            .publish_campaign(&CampaignLifecycleEvent {
                id: campaign_id,
                status: Some(status.as_str().to_string()),
                totals: Some(totals),
                health: None,
            })
            .await?;

        if status == CampaignStatus::Completed {
            self.cache.delete_definition(campaign_id).await?;
        }

        Ok(true)
    }

    /// Periodic sweep: re-runs `finalize` over a bounded window of
    /// non-running campaigns (spec section 4.6). Returns how many were
    /// (re)confirmed finalized.
    pub async fn reconcile_sweep(&self, limit: i64) -> anyhow::Result<usize> {
        let ids = self.campaigns.list_for_reconcile(limit).await?;
        let mut confirmed = 0;
        for id in ids {
            if self.finalize(id).await? {
                confirmed += 1;
            }
        }
        Ok(confirmed)
    }
}
