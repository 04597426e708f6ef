use std::env;
use std::time::Duration;
use tracing::warn;

/// Runtime configuration, environment-variable driven. Every knob has a
/// default matching steady-state production behavior; malformed values fall
/// back to the default with a warning rather than aborting startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub poll_tick_seconds: u64,
    pub polls_per_tick: usize,
    pub poll_backoff_base: Duration,
    pub poll_backoff_cap: Duration,
    pub fuzzy_similarity_threshold: f64,
    pub strong_similarity_threshold: f64,
    pub min_shared_entities: usize,
    pub archive_age_hours: i64,
    pub breaking_window_minutes: i64,
    pub headline_thresholds: Vec<u32>,
    pub article_deadline_seconds: u64,
    pub lease_ttl_seconds: i64,
    /// When set, the pipeline persists to Postgres; otherwise it runs on the
    /// in-memory store.
    pub database_url: Option<String>,
    pub headline_model_url: Option<String>,
    pub headline_model_key: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_tick_seconds: 10,
            polls_per_tick: 5,
            poll_backoff_base: Duration::from_secs(30),
            poll_backoff_cap: Duration::from_secs(30 * 60),
            fuzzy_similarity_threshold: 0.70,
            strong_similarity_threshold: 0.80,
            min_shared_entities: 3,
            archive_age_hours: 24,
            breaking_window_minutes: 30,
            headline_thresholds: vec![3, 5, 10, 15],
            article_deadline_seconds: 10,
            lease_ttl_seconds: 60,
            database_url: None,
            headline_model_url: None,
            headline_model_key: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_tick_seconds: parse_var("POLL_TICK_SECONDS", defaults.poll_tick_seconds),
            polls_per_tick: parse_var("POLLS_PER_TICK", defaults.polls_per_tick),
            poll_backoff_base: Duration::from_secs(parse_var(
                "POLL_BACKOFF_BASE",
                defaults.poll_backoff_base.as_secs(),
            )),
            poll_backoff_cap: Duration::from_secs(parse_var(
                "POLL_BACKOFF_CAP",
                defaults.poll_backoff_cap.as_secs(),
            )),
            fuzzy_similarity_threshold: parse_var(
                "FUZZY_SIMILARITY_THRESHOLD",
                defaults.fuzzy_similarity_threshold,
            ),
            strong_similarity_threshold: parse_var(
                "STRONG_SIMILARITY_THRESHOLD",
                defaults.strong_similarity_threshold,
            ),
            min_shared_entities: parse_var("MIN_SHARED_ENTITIES", defaults.min_shared_entities),
            archive_age_hours: parse_var("ARCHIVE_AGE_HOURS", defaults.archive_age_hours),
            breaking_window_minutes: parse_var(
                "BREAKING_WINDOW_MINUTES",
                defaults.breaking_window_minutes,
            ),
            headline_thresholds: parse_thresholds(defaults.headline_thresholds),
            article_deadline_seconds: parse_var(
                "ARTICLE_DEADLINE_SECONDS",
                defaults.article_deadline_seconds,
            ),
            lease_ttl_seconds: parse_var("LEASE_TTL_SECONDS", defaults.lease_ttl_seconds),
            database_url: env::var("DATABASE_URL").ok(),
            headline_model_url: env::var("HEADLINE_MODEL_URL").ok(),
            headline_model_key: env::var("HEADLINE_MODEL_KEY").ok(),
        }
    }

    /// Per-fetch budget. One second under the tick so a slow feed cannot
    /// push a tick past its window.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_tick_seconds.saturating_sub(1).max(1))
    }

    /// Exponential backoff for a feed with `failures` consecutive failures:
    /// base doubling per failure, capped.
    pub fn poll_backoff(&self, failures: u32) -> Duration {
        let base = self.poll_backoff_base.as_secs().max(1);
        let exp = failures.saturating_sub(1).min(20);
        let secs = base.saturating_mul(1u64 << exp);
        Duration::from_secs(secs.min(self.poll_backoff_cap.as_secs()))
    }
}

fn parse_var<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Ignoring malformed {}={:?}, using default", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_thresholds(default: Vec<u32>) -> Vec<u32> {
    match env::var("HEADLINE_THRESHOLDS") {
        Ok(raw) => {
            let parsed: std::result::Result<Vec<u32>, _> = raw
                .split(',')
                .map(|p| p.trim().parse::<u32>())
                .collect();
            match parsed {
                Ok(mut v) if !v.is_empty() => {
                    v.sort_unstable();
                    v.dedup();
                    v
                }
                _ => {
                    warn!("Ignoring malformed HEADLINE_THRESHOLDS={:?}, using default", raw);
                    default
                }
            }
        }
        Err(_) => default,
    }
}
