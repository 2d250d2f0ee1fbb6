//! Config (spec section 6's environment variable list), extending the
//! teacher's `Config::from_env` pattern with the full surface the engine
//! needs: rate governor tunables, worker concurrency, reconciler interval,
//! public base URL. Each knob follows the teacher's own
//! `env::var(...).unwrap_or_else(...)` / `.expect(...)` style.

use std::env;

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,

    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from_email: String,
    pub smtp_from_name: String,

    pub public_base_url: String,
    pub webhook_secret: String,

    /// `MAX_ATTEMPTS` (default 3).
    pub max_attempts: i32,

    pub email_rate_max: u64,
    pub email_rate_duration: chrono::Duration,
    pub email_global_rate_max: u64,
    pub email_global_rate_duration: chrono::Duration,
    /// `EMAIL_WARMUP_FACTOR`, the global ramp knob in `(0, 1]`.
    pub email_warmup_factor: f64,
    pub email_failure_warn_rate: f64,
    pub email_failure_strict_rate: f64,
    pub email_domain_block_ttl: chrono::Duration,
    pub email_global_block_ttl: chrono::Duration,

    pub worker_concurrency: usize,
    pub reconciler_interval_ms: u64,

    /// Spec section 7's open-question resolution (recorded in DESIGN.md):
    /// whether a 550/553 permanent-recipient bounce marks the row `failed`
    /// immediately, bypassing the attempt cap.
    pub permanent_recipient_bypasses_attempts: bool,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| "default-secret-change-in-production".to_string()),

            smtp_host: env::var("SMTP_HOST").ok(),
            smtp_port: env::var("SMTP_PORT").ok().and_then(|p| p.parse().ok()),
            smtp_username: env::var("SMTP_USERNAME").ok(),
            smtp_password: env::var("SMTP_PASSWORD").ok(),
            smtp_from_email: env_or("SMTP_FROM_EMAIL", "campaigns@example.com"),
            smtp_from_name: env_or("SMTP_FROM_NAME", "Campaign Delivery Engine"),

            public_base_url: env_or("PUBLIC_BASE_URL", "http://localhost:8080"),
            webhook_secret: env_or("WEBHOOK_SHARED_SECRET", "change-me"),

            max_attempts: env_parse_or("MAX_ATTEMPTS", 3),

            email_rate_max: env_parse_or("EMAIL_RATE_MAX", 20u64),
            email_rate_duration: chrono::Duration::seconds(env_parse_or("EMAIL_RATE_DURATION", 60i64)),
            email_global_rate_max: env_parse_or("EMAIL_GLOBAL_RATE_MAX", 200u64),
            email_global_rate_duration: chrono::Duration::seconds(env_parse_or(
                "EMAIL_GLOBAL_RATE_DURATION",
                60i64,
            )),
            email_warmup_factor: env_parse_or("EMAIL_WARMUP_FACTOR", 1.0f64),
            email_failure_warn_rate: env_parse_or("EMAIL_FAILURE_WARN_RATE", 0.05f64),
            email_failure_strict_rate: env_parse_or("EMAIL_FAILURE_STRICT_RATE", 0.15f64),
            email_domain_block_ttl: chrono::Duration::seconds(env_parse_or(
                "EMAIL_DOMAIN_BLOCK_TTL",
                300i64,
            )),
            email_global_block_ttl: chrono::Duration::seconds(env_parse_or(
                "EMAIL_GLOBAL_BLOCK_TTL",
                300i64,
            )),

            worker_concurrency: env_parse_or("WORKER_CONCURRENCY", 5usize),
            reconciler_interval_ms: env_parse_or("RECONCILER_INTERVAL_MS", 60_000u64),

            permanent_recipient_bypasses_attempts: env_parse_or(
                "PERMANENT_RECIPIENT_BYPASSES_ATTEMPTS",
                true,
            ),
        }
    }
}
