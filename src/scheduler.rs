use crate::config::PipelineConfig;
use crate::entities::EntityExtractor;
use crate::fetcher::{FetchOutcome, Fetcher};
use crate::fingerprint;
use crate::normalize::{article_id, Normalizer};
use crate::parser::{self, ParsedEntry};
use crate::sources::FeedSpec;
use crate::store::DocumentStore;
use crate::types::{Article, FeedPollState, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Polls the roster on a short timer: every tick selects a handful of
/// eligible feeds and fetches them concurrently, producing an approximately
/// continuous article stream instead of minute-scale bursts.
pub struct IngestionScheduler {
    store: Arc<dyn DocumentStore>,
    config: PipelineConfig,
    fetcher: Fetcher,
    normalizer: Normalizer,
    extractor: EntityExtractor,
    roster: Vec<FeedSpec>,
}

impl IngestionScheduler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: PipelineConfig,
        roster: Vec<FeedSpec>,
    ) -> Result<Self> {
        let fetcher = Fetcher::new(config.fetch_timeout())?;
        Ok(Self {
            store,
            config,
            fetcher,
            normalizer: Normalizer::new(),
            extractor: EntityExtractor::new(),
            roster,
        })
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            feeds = self.roster.len(),
            tick_seconds = self.config.poll_tick_seconds,
            "Ingestion scheduler started"
        );
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.poll_tick_seconds,
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Ingestion scheduler shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }
            self.run_tick().await;
        }
    }

    /// One tick: pick up to `polls_per_tick` eligible feeds and poll them
    /// concurrently behind a semaphore of the same size.
    pub async fn run_tick(self: &Arc<Self>) {
        let now = Utc::now();
        let states = match self.store.list_feed_states().await {
            Ok(states) => states,
            Err(e) => {
                error!("Failed to load feed poll states: {}", e);
                return;
            }
        };
        let selected = select_eligible(&self.roster, states, now, self.config.polls_per_tick);
        if selected.is_empty() {
            return;
        }
        debug!("Tick polling {} feeds", selected.len());

        let semaphore = Arc::new(Semaphore::new(self.config.polls_per_tick));
        let mut polls = JoinSet::new();
        for (spec, state) in selected {
            let this = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            polls.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                this.poll_feed(spec, state).await;
            });
        }
        while polls.join_next().await.is_some() {}
    }

    async fn poll_feed(&self, spec: FeedSpec, mut state: FeedPollState) {
        let now = Utc::now();
        state.last_polled_at = Some(now);

        let outcome = self
            .fetcher
            .fetch(
                &spec.url,
                state.last_etag.as_deref(),
                state.last_modified.as_deref(),
            )
            .await;

        match outcome {
            Ok(FetchOutcome::NotModified) => {
                debug!(feed = %spec.slug, "Feed unchanged (304)");
                note_not_modified(&mut state, now, &self.config);
            }
            Ok(FetchOutcome::Fetched {
                body,
                etag,
                last_modified,
            }) => {
                let ingested = self.ingest_body(&spec, &body).await;
                note_success(&mut state, now, etag, last_modified, &self.config);
                info!(feed = %spec.slug, ingested, "Feed polled");
            }
            Ok(FetchOutcome::ClientError { status }) => {
                warn!(feed = %spec.slug, status, "Publisher error, parking feed for an hour");
                note_client_error(&mut state, now);
            }
            Ok(FetchOutcome::ServerError { status }) => {
                warn!(feed = %spec.slug, status, "Feed server error");
                note_failure(&mut state, now, &self.config);
            }
            Err(e) => {
                warn!(feed = %spec.slug, "Feed fetch failed: {}", e);
                note_failure(&mut state, now, &self.config);
            }
        }

        if let Err(e) = self.store.put_feed_state(state).await {
            error!(feed = %spec.slug, "Failed to persist poll state: {}", e);
        }
    }

    /// Parse a fetched body and upsert every acceptable entry. Entry-level
    /// problems skip the entry and keep the feed going.
    async fn ingest_body(&self, spec: &FeedSpec, body: &str) -> usize {
        let entries = match parser::parse_feed(body) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(feed = %spec.slug, "Malformed feed body: {}", e);
                return 0;
            }
        };

        let mut ingested = 0usize;
        for entry in entries {
            match self.ingest_entry(spec, entry).await {
                Ok(true) => ingested += 1,
                Ok(false) => {}
                Err(e) => warn!(feed = %spec.slug, "Failed to ingest entry: {}", e),
            }
        }
        ingested
    }

    async fn ingest_entry(&self, spec: &FeedSpec, entry: ParsedEntry) -> Result<bool> {
        let title = self.normalizer.strip_html(&entry.title);
        if let Some(reason) = self.normalizer.rejection_reason(&title, &entry.url) {
            debug!(feed = %spec.slug, url = %entry.url, reason, "Rejected entry");
            return Ok(false);
        }

        let description = self.normalizer.strip_html(&entry.description);
        let content = self.normalizer.strip_html(&entry.content);
        let entities = self
            .extractor
            .extract(&format!("{}. {}", title, description));
        let category = self.normalizer.categorize(&title, &description, &entry.url);
        let fingerprint = fingerprint::compute(&title, &entities);

        let now = Utc::now();
        let article = Article {
            id: article_id(&spec.slug, &entry.url),
            source: spec.slug.clone(),
            url: entry.url,
            title,
            description,
            content,
            published_at: entry.published_at,
            fetched_at: now,
            updated_at: now,
            entities,
            category,
            fingerprint,
            story_cluster_id: None,
        };
        self.store.upsert_article(article).await?;
        Ok(true)
    }
}

/// Feeds whose `next_eligible_at` has come, soonest first, capped at `limit`.
/// Roster entries with no poll state yet are eligible immediately.
pub fn select_eligible(
    roster: &[FeedSpec],
    states: Vec<FeedPollState>,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<(FeedSpec, FeedPollState)> {
    let mut by_feed: HashMap<String, FeedPollState> =
        states.into_iter().map(|s| (s.feed_id.clone(), s)).collect();

    let mut eligible: Vec<(FeedSpec, FeedPollState)> = roster
        .iter()
        .map(|spec| {
            let state = by_feed
                .remove(&spec.slug)
                .unwrap_or_else(|| FeedPollState::new(spec.slug.clone(), now));
            (spec.clone(), state)
        })
        .filter(|(_, state)| now >= state.next_eligible_at)
        .collect();

    eligible.sort_by(|a, b| a.1.next_eligible_at.cmp(&b.1.next_eligible_at));
    eligible.truncate(limit);
    eligible
}

fn note_not_modified(state: &mut FeedPollState, now: DateTime<Utc>, config: &PipelineConfig) {
    // Neither a failure nor new content; just come back after the base
    // interval.
    state.next_eligible_at = now + base_interval(config);
}

fn note_success(
    state: &mut FeedPollState,
    now: DateTime<Utc>,
    etag: Option<String>,
    last_modified: Option<String>,
    config: &PipelineConfig,
) {
    state.last_successful_at = Some(now);
    state.last_etag = etag;
    state.last_modified = last_modified;
    state.consecutive_failures = 0;
    state.next_eligible_at = now + base_interval(config);
}

/// Publisher-side errors are not worth hammering, but they are also not
/// feed failures to count against health: park the feed for an hour.
fn note_client_error(state: &mut FeedPollState, now: DateTime<Utc>) {
    state.next_eligible_at = now + ChronoDuration::hours(1);
}

fn note_failure(state: &mut FeedPollState, now: DateTime<Utc>, config: &PipelineConfig) {
    state.consecutive_failures += 1;
    let backoff = config.poll_backoff(state.consecutive_failures);
    state.next_eligible_at =
        now + ChronoDuration::from_std(backoff).unwrap_or_else(|_| ChronoDuration::hours(1));
}

fn base_interval(config: &PipelineConfig) -> ChronoDuration {
    ChronoDuration::from_std(config.poll_backoff_base)
        .unwrap_or_else(|_| ChronoDuration::seconds(30))
}
