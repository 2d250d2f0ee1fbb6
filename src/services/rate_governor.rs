//! Rate Governor (C2), spec section 4.2. Two overlapping sliding-window
//! counters per member (`rate:domain:{d}`, `rate:global`) stored as Redis
//! ordered sets scored by timestamp, plus `throttle:*` TTL keys for hard
//! blocks. Grounded on the corpus's `ZADD`/`ZREMRANGEBYSCORE`/`ZCARD` idiom
//! (`solutions-plug-predictIQ`, `pegasusheavy-armature`) — the teacher has
//! no Redis dependency, so this module is a required addition (DESIGN.md).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::Config;
use crate::services::traits::GovernorBackend;

pub struct RateGovernor {
    conn: ConnectionManager,
    cfg: Config,
}

impl RateGovernor {
    pub fn new(conn: ConnectionManager, cfg: Config) -> Self {
        Self { conn, cfg }
    }

    fn domain_key(domain: &str) -> String {
        format!("rate:domain:{domain}")
    }

    fn stats_key(domain: &str) -> String {
        format!("stats:domain:{domain}")
    }

    fn throttle_key(domain: Option<&str>) -> String {
        match domain {
            Some(d) => format!("throttle:domain:{d}"),
            None => "throttle:global".to_string(),
        }
    }

    /// The exact `factor` table from spec section 4.2.
    pub fn capacity_factor(fail_rate: f64) -> f64 {
        if fail_rate >= 0.15 {
            0.2
        } else if fail_rate >= 0.05 {
            0.5
        } else {
            1.0
        }
    }

    pub fn effective_capacity(base_capacity: u64, warmup: f64, fail_rate: f64) -> u64 {
        ((base_capacity as f64) * warmup.clamp(f64::MIN_POSITIVE, 1.0) * Self::capacity_factor(fail_rate)).floor() as u64
    }

    /// TTL formula from spec section 4.2, capped at 1h.
    pub fn block_ttl(base: chrono::Duration, next_attempt: u32, fail_rate: f64) -> chrono::Duration {
        let seconds = base.num_seconds() as f64 * (1.0 + 0.5 * next_attempt as f64 + 4.0 * fail_rate);
        let capped = seconds.min(3600.0).max(0.0);
        chrono::Duration::seconds(capped as i64)
    }

    async fn sliding_window_count(&self, key: &str, window: chrono::Duration, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut conn = self.conn.clone();
        let floor = (now - window).timestamp_millis();
        let _: () = conn.zrembyscore(key, 0, floor).await?;
        let count: u64 = conn.zcard(key).await?;
        Ok(count)
    }

    async fn reserve(&self, key: &str, window: chrono::Duration, capacity: u64) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let count = self.sliding_window_count(key, window, now).await?;
        if count >= capacity {
            return Ok(false);
        }
        let member: u64 = rand::thread_rng().gen();
        let score = now.timestamp_millis();
        let _: () = conn.zadd(key, format!("{score}-{member}"), score).await?;
        let _: () = conn.expire(key, window.num_seconds()).await?;
        Ok(true)
    }

}

#[async_trait]
impl GovernorBackend for RateGovernor {
    async fn try_acquire(&self, domain: &str) -> anyhow::Result<bool> {
        if self.is_blocked(domain).await? {
            return Ok(false);
        }
        if !self.reserve("rate:global", self.cfg.email_global_rate_duration, self.cfg.email_global_rate_max).await? {
            return Ok(false);
        }
        let fail_rate = self.failure_rate(domain).await?;
        let capacity = Self::effective_capacity(self.cfg.email_rate_max, self.cfg.email_warmup_factor, fail_rate);
        self.reserve(&Self::domain_key(domain), self.cfg.email_rate_duration, capacity).await
    }

    async fn record_outcome(&self, domain: &str, success: bool) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let key = Self::stats_key(domain);
        let field = if success { "sent" } else { "failed" };
        let _: () = conn.hincr(&key, field, 1).await?;
        let _: () = conn.expire(&key, 24 * 3600).await?;
        Ok(())
    }

    async fn set_block(&self, domain: Option<&str>, ttl: chrono::Duration) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let key = Self::throttle_key(domain);
        let ms = ttl.num_milliseconds().max(1) as usize;
        let _: () = conn.set_ex(&key, 1, ms / 1000 + 1).await?;
        Ok(())
    }

    async fn is_blocked(&self, domain: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let domain_blocked: bool = conn.exists(Self::throttle_key(Some(domain))).await?;
        let global_blocked: bool = conn.exists(Self::throttle_key(None)).await?;
        Ok(domain_blocked || global_blocked)
    }

    async fn failure_rate(&self, domain: &str) -> anyhow::Result<f64> {
        let mut conn = self.conn.clone();
        let key = Self::stats_key(domain);
        let sent: Option<u64> = conn.hget(&key, "sent").await?;
        let failed: Option<u64> = conn.hget(&key, "failed").await?;
        let sent = sent.unwrap_or(0);
        let failed = failed.unwrap_or(0);
        let total = sent + failed;
        if total == 0 {
            Ok(0.0)
        } else {
            Ok(failed as f64 / total as f64)
        }
    }
}

/// Classifies a raw SMTP response into throttle vs. not, per spec sections
/// 4.2 and 7's exact code/phrase list. Also reports whether the response
/// should additionally trip the *global* block (a 421 or the phrase "rate
/// limit", per spec section 4.2).
pub fn classify_smtp_signal(code: Option<u16>, body: &str) -> Option<bool> {
    let lower = body.to_ascii_lowercase();
    let throttle_code = matches!(code, Some(421) | Some(450) | Some(451) | Some(452) | Some(429));
    let throttle_phrase = ["rate limit", "throttl", "too many", "blocked", "limit exceeded", "try again later"]
        .iter()
        .any(|p| lower.contains(p));
    if !(throttle_code || throttle_phrase) {
        return None;
    }
    let trips_global = code == Some(421) || lower.contains("rate limit");
    Some(trips_global)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_factor_table() {
        assert_eq!(RateGovernor::capacity_factor(0.2), 0.2);
        assert_eq!(RateGovernor::capacity_factor(0.15), 0.2);
        assert_eq!(RateGovernor::capacity_factor(0.1), 0.5);
        assert_eq!(RateGovernor::capacity_factor(0.05), 0.5);
        assert_eq!(RateGovernor::capacity_factor(0.0), 1.0);
    }

    #[test]
    fn effective_capacity_applies_warmup_and_factor() {
        assert_eq!(RateGovernor::effective_capacity(100, 0.5, 0.2), 10);
        assert_eq!(RateGovernor::effective_capacity(100, 1.0, 0.0), 100);
    }

    #[test]
    fn block_ttl_caps_at_one_hour() {
        let ttl = RateGovernor::block_ttl(chrono::Duration::minutes(30), 10, 1.0);
        assert_eq!(ttl, chrono::Duration::seconds(3600));
    }

    #[test]
    fn block_ttl_scales_with_attempt_and_fail_rate() {
        let base = chrono::Duration::seconds(60);
        let low = RateGovernor::block_ttl(base, 0, 0.0);
        let high = RateGovernor::block_ttl(base, 5, 0.2);
        assert!(high > low);
    }

    #[test]
    fn classifies_throttle_codes_and_global_trip() {
        assert_eq!(classify_smtp_signal(Some(421), "try later"), Some(true));
        assert_eq!(classify_smtp_signal(Some(450), "mailbox busy"), Some(false));
        assert_eq!(classify_smtp_signal(Some(250), "ok, rate limit notice"), Some(true));
        assert_eq!(classify_smtp_signal(Some(550), "no such user"), None);
    }
}
