use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named entity extracted from article text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Entity {
    pub text: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Person,
    Org,
    Location,
    Event,
    Other,
}

impl EntityType {
    /// Types that participate in fingerprints, similarity bonuses and
    /// topic-conflict checks.
    pub fn is_salient(self) -> bool {
        matches!(self, EntityType::Person | EntityType::Org | EntityType::Location)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Politics,
    World,
    Business,
    Tech,
    Sports,
    Health,
    Entertainment,
    Science,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Politics => "politics",
            Category::World => "world",
            Category::Business => "business",
            Category::Tech => "tech",
            Category::Sports => "sports",
            Category::Health => "health",
            Category::Entertainment => "entertainment",
            Category::Science => "science",
            Category::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Category {
        match s {
            "politics" => Category::Politics,
            "world" => Category::World,
            "business" => Category::Business,
            "tech" => Category::Tech,
            "sports" => Category::Sports,
            "health" => Category::Health,
            "entertainment" => Category::Entertainment,
            "science" => Category::Science,
            _ => Category::Other,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ingested RSS item. The id is a pure function of `(source, url)`, so
/// re-ingesting the same URL overwrites the record in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub source: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub content: String,
    pub published_at: Option<DateTime<Utc>>,
    /// First time this record was created. Immutable after first write.
    pub fetched_at: DateTime<Utc>,
    /// Time of the most recent upsert.
    pub updated_at: DateTime<Utc>,
    pub entities: Vec<Entity>,
    pub category: Category,
    pub fingerprint: String,
    /// Back-reference written by the clustering engine after assignment.
    pub story_cluster_id: Option<String>,
}

impl Article {
    /// Partition key. Derived from `fetched_at`, so it is stable across
    /// updates to the same record.
    pub fn fetched_date(&self) -> String {
        self.fetched_at.format("%Y-%m-%d").to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoryStatus {
    Monitoring,
    Developing,
    Breaking,
    Verified,
    Archived,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryStatus::Monitoring => "MONITORING",
            StoryStatus::Developing => "DEVELOPING",
            StoryStatus::Breaking => "BREAKING",
            StoryStatus::Verified => "VERIFIED",
            StoryStatus::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> StoryStatus {
        match s {
            "DEVELOPING" => StoryStatus::Developing,
            "BREAKING" => StoryStatus::Breaking,
            "VERIFIED" => StoryStatus::Verified,
            "ARCHIVED" => StoryStatus::Archived,
            _ => StoryStatus::Monitoring,
        }
    }
}

impl std::fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit entry appended on status and headline changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEvent {
    pub timestamp: DateTime<Utc>,
    pub event: String,
}

/// A grouping of articles describing one real-world event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryCluster {
    pub id: String,
    /// Current canonical headline. Re-synthesized at verification thresholds.
    pub title: String,
    /// Inherited from the seeding article; primary O(1) match key.
    pub fingerprint: String,
    pub category: Category,
    /// Ordered set of article ids. No duplicates.
    pub source_articles: Vec<String>,
    /// Cardinality of distinct `source` values across `source_articles`.
    /// This, not the article count, drives status.
    pub unique_source_count: u32,
    pub verification_level: u32,
    pub status: StoryStatus,
    pub first_seen: DateTime<Utc>,
    /// Moves only when a new source is added or the status changes.
    pub last_updated: DateTime<Utc>,
    pub breaking_detected_at: Option<DateTime<Utc>>,
    /// Opaque blob owned by the external summarization worker.
    pub summary: Option<serde_json::Value>,
    pub version_history: Vec<VersionEvent>,
    /// Optimistic-concurrency token, bumped by the store on every replace.
    #[serde(default)]
    pub version: u64,
}

impl StoryCluster {
    pub fn record_event(&mut self, now: DateTime<Utc>, event: impl Into<String>) {
        self.version_history.push(VersionEvent {
            timestamp: now,
            event: event.into(),
        });
    }
}

/// Per-feed polling cursor. Lives in its own collection, never co-located
/// with stories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPollState {
    pub feed_id: String,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_successful_at: Option<DateTime<Utc>>,
    pub last_etag: Option<String>,
    pub last_modified: Option<String>,
    pub consecutive_failures: u32,
    pub next_eligible_at: DateTime<Utc>,
}

impl FeedPollState {
    pub fn new(feed_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            feed_id: feed_id.into(),
            last_polled_at: None,
            last_successful_at: None,
            last_etag: None,
            last_modified: None,
            consecutive_failures: 0,
            next_eligible_at: now,
        }
    }
}

/// A time-bounded claim on a change-feed partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub partition: String,
    pub continuation: u64,
    pub owner: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feed parse error: {0}")]
    Parse(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("story not found: {id}")]
    StoryNotFound { id: String },

    #[error("optimistic concurrency conflict on {id}")]
    Conflict { id: String },

    #[error("lease lost on partition {partition}")]
    LeaseLost { partition: String },

    #[error("deadline exceeded: {0}")]
    Deadline(String),

    #[error("headline synthesis failed: {0}")]
    Synthesizer(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
