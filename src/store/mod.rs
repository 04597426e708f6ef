pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::types::{Article, Category, FeedPollState, Lease, Result, StoryCluster};
use async_trait::async_trait;

/// A page of the `raw_articles` change feed for one partition, in write
/// order. Ack is implicit: the consumer checkpoints `continuation` into its
/// lease once the batch is fully processed.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub articles: Vec<Article>,
    pub continuation: u64,
}

/// The document store the pipeline components communicate through. Three
/// collections (`raw_articles` partitioned by fetched date, `story_clusters`
/// partitioned by category, `feed_poll_states` on its own), an ordered
/// change feed over articles, and lease records for dividing change-feed
/// partitions among workers.
///
/// Story writes are optimistically concurrent: `replace_story` checks the
/// document version and fails with `Conflict` when another worker got there
/// first.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    // raw_articles

    /// Update-in-place upsert. If the id exists, all content fields are
    /// overwritten, `fetched_at` and any story back-reference are preserved,
    /// and `updated_at` advances. Every upsert appends to the change feed.
    async fn upsert_article(&self, article: Article) -> Result<Article>;
    async fn get_article(&self, id: &str) -> Result<Option<Article>>;
    async fn get_articles(&self, ids: &[String]) -> Result<Vec<Article>>;
    async fn set_article_story(&self, article_id: &str, story_id: &str) -> Result<()>;

    // story_clusters

    async fn insert_story(&self, story: StoryCluster) -> Result<()>;
    async fn get_story(&self, id: &str) -> Result<Option<StoryCluster>>;
    /// O(1) primary match path: `(category, fingerprint)`, non-archived only.
    async fn find_story_by_fingerprint(
        &self,
        category: Category,
        fingerprint: &str,
    ) -> Result<Option<StoryCluster>>;
    /// Most recently updated non-archived stories in a category, newest
    /// first. Feeds the fuzzy candidate set.
    async fn recent_stories(&self, category: Category, limit: usize) -> Result<Vec<StoryCluster>>;
    /// Version-checked replace. Returns the stored document with its bumped
    /// version, or `PipelineError::Conflict`.
    async fn replace_story(&self, story: &StoryCluster) -> Result<StoryCluster>;
    /// Summarization-worker surface: patches `summary` and appends to
    /// `version_history` without touching `last_updated`.
    async fn patch_story_summary(&self, id: &str, summary: serde_json::Value) -> Result<()>;
    /// All non-archived stories, for the periodic status sweep.
    async fn active_stories(&self) -> Result<Vec<StoryCluster>>;

    // feed_poll_states

    async fn list_feed_states(&self) -> Result<Vec<FeedPollState>>;
    async fn get_feed_state(&self, feed_id: &str) -> Result<Option<FeedPollState>>;
    async fn put_feed_state(&self, state: FeedPollState) -> Result<()>;

    // change feed + leases

    async fn article_partitions(&self) -> Result<Vec<String>>;
    async fn read_article_changes(
        &self,
        partition: &str,
        continuation: u64,
        limit: usize,
    ) -> Result<ChangeBatch>;

    /// Compare-and-set acquisition: succeeds when the lease is unowned,
    /// expired, or already ours.
    async fn acquire_lease(
        &self,
        partition: &str,
        owner: &str,
        ttl_seconds: i64,
    ) -> Result<Option<Lease>>;
    /// Returns false when the lease is no longer ours.
    async fn renew_lease(&self, partition: &str, owner: &str, ttl_seconds: i64) -> Result<bool>;
    /// Persist the continuation token. Returns false when the lease is no
    /// longer ours, in which case the batch must not be considered done.
    async fn checkpoint_lease(&self, partition: &str, owner: &str, continuation: u64)
        -> Result<bool>;
    async fn release_lease(&self, partition: &str, owner: &str) -> Result<()>;
}
