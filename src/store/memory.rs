use super::{ChangeBatch, DocumentStore};
use crate::types::{
    Article, Category, FeedPollState, Lease, PipelineError, Result, StoryCluster, StoryStatus,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Complete in-process implementation of the document store. Carries the
/// same semantics as the Postgres store (update-in-place upserts, versioned
/// story replace, per-partition change log, lease CAS), so the whole
/// pipeline runs and tests without a database.
#[derive(Default)]
pub struct MemoryStore {
    articles: RwLock<HashMap<String, Article>>,
    /// partition (fetched date) -> article ids in write order.
    article_changes: RwLock<BTreeMap<String, Vec<String>>>,
    stories: RwLock<HashMap<String, StoryCluster>>,
    feed_states: RwLock<HashMap<String, FeedPollState>>,
    leases: RwLock<HashMap<String, Lease>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn upsert_article(&self, mut article: Article) -> Result<Article> {
        let mut articles = self.articles.write().await;
        if let Some(existing) = articles.get(&article.id) {
            article.fetched_at = existing.fetched_at;
            if article.story_cluster_id.is_none() {
                article.story_cluster_id = existing.story_cluster_id.clone();
            }
        }
        let partition = article.fetched_date();
        articles.insert(article.id.clone(), article.clone());
        drop(articles);

        self.article_changes
            .write()
            .await
            .entry(partition)
            .or_default()
            .push(article.id.clone());
        Ok(article)
    }

    async fn get_article(&self, id: &str) -> Result<Option<Article>> {
        Ok(self.articles.read().await.get(id).cloned())
    }

    async fn get_articles(&self, ids: &[String]) -> Result<Vec<Article>> {
        let articles = self.articles.read().await;
        Ok(ids.iter().filter_map(|id| articles.get(id).cloned()).collect())
    }

    async fn set_article_story(&self, article_id: &str, story_id: &str) -> Result<()> {
        let mut articles = self.articles.write().await;
        if let Some(article) = articles.get_mut(article_id) {
            article.story_cluster_id = Some(story_id.to_string());
        }
        Ok(())
    }

    async fn insert_story(&self, mut story: StoryCluster) -> Result<()> {
        story.version = 1;
        self.stories.write().await.insert(story.id.clone(), story);
        Ok(())
    }

    async fn get_story(&self, id: &str) -> Result<Option<StoryCluster>> {
        Ok(self.stories.read().await.get(id).cloned())
    }

    async fn find_story_by_fingerprint(
        &self,
        category: Category,
        fingerprint: &str,
    ) -> Result<Option<StoryCluster>> {
        if fingerprint.is_empty() {
            return Ok(None);
        }
        let stories = self.stories.read().await;
        Ok(stories
            .values()
            .filter(|s| {
                s.category == category
                    && s.fingerprint == fingerprint
                    && s.status != StoryStatus::Archived
            })
            .max_by_key(|s| s.last_updated)
            .cloned())
    }

    async fn recent_stories(&self, category: Category, limit: usize) -> Result<Vec<StoryCluster>> {
        let stories = self.stories.read().await;
        let mut matching: Vec<StoryCluster> = stories
            .values()
            .filter(|s| s.category == category && s.status != StoryStatus::Archived)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn replace_story(&self, story: &StoryCluster) -> Result<StoryCluster> {
        let mut stories = self.stories.write().await;
        let current = stories
            .get(&story.id)
            .ok_or_else(|| PipelineError::StoryNotFound { id: story.id.clone() })?;
        if current.version != story.version {
            return Err(PipelineError::Conflict { id: story.id.clone() });
        }
        let mut updated = story.clone();
        updated.version += 1;
        stories.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    async fn patch_story_summary(&self, id: &str, summary: serde_json::Value) -> Result<()> {
        let mut stories = self.stories.write().await;
        let story = stories
            .get_mut(id)
            .ok_or_else(|| PipelineError::StoryNotFound { id: id.to_string() })?;
        story.summary = Some(summary);
        story.record_event(Utc::now(), "summary_updated");
        story.version += 1;
        Ok(())
    }

    async fn active_stories(&self) -> Result<Vec<StoryCluster>> {
        let stories = self.stories.read().await;
        Ok(stories
            .values()
            .filter(|s| s.status != StoryStatus::Archived)
            .cloned()
            .collect())
    }

    async fn list_feed_states(&self) -> Result<Vec<FeedPollState>> {
        Ok(self.feed_states.read().await.values().cloned().collect())
    }

    async fn get_feed_state(&self, feed_id: &str) -> Result<Option<FeedPollState>> {
        Ok(self.feed_states.read().await.get(feed_id).cloned())
    }

    async fn put_feed_state(&self, state: FeedPollState) -> Result<()> {
        self.feed_states
            .write()
            .await
            .insert(state.feed_id.clone(), state);
        Ok(())
    }

    async fn article_partitions(&self) -> Result<Vec<String>> {
        Ok(self.article_changes.read().await.keys().cloned().collect())
    }

    async fn read_article_changes(
        &self,
        partition: &str,
        continuation: u64,
        limit: usize,
    ) -> Result<ChangeBatch> {
        let changes = self.article_changes.read().await;
        let log = changes.get(partition).map(|v| v.as_slice()).unwrap_or(&[]);
        let start = (continuation as usize).min(log.len());
        let end = (start + limit).min(log.len());
        let ids: Vec<String> = log[start..end].to_vec();
        drop(changes);

        let articles = self.get_articles(&ids).await?;
        Ok(ChangeBatch {
            articles,
            continuation: end as u64,
        })
    }

    async fn acquire_lease(
        &self,
        partition: &str,
        owner: &str,
        ttl_seconds: i64,
    ) -> Result<Option<Lease>> {
        let now = Utc::now();
        let mut leases = self.leases.write().await;
        let lease = leases.entry(partition.to_string()).or_insert_with(|| Lease {
            partition: partition.to_string(),
            continuation: 0,
            owner: None,
            expires_at: None,
        });

        let available = match (&lease.owner, lease.expires_at) {
            (None, _) => true,
            (Some(current), _) if current.as_str() == owner => true,
            (_, Some(expires)) => expires <= now,
            (_, None) => true,
        };
        if !available {
            return Ok(None);
        }
        lease.owner = Some(owner.to_string());
        lease.expires_at = Some(now + Duration::seconds(ttl_seconds));
        Ok(Some(lease.clone()))
    }

    async fn renew_lease(&self, partition: &str, owner: &str, ttl_seconds: i64) -> Result<bool> {
        let now = Utc::now();
        let mut leases = self.leases.write().await;
        match leases.get_mut(partition) {
            Some(lease)
                if lease.owner.as_deref() == Some(owner)
                    && lease.expires_at.map(|e| e > now).unwrap_or(false) =>
            {
                lease.expires_at = Some(now + Duration::seconds(ttl_seconds));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn checkpoint_lease(
        &self,
        partition: &str,
        owner: &str,
        continuation: u64,
    ) -> Result<bool> {
        let mut leases = self.leases.write().await;
        match leases.get_mut(partition) {
            Some(lease) if lease.owner.as_deref() == Some(owner) => {
                lease.continuation = continuation;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, partition: &str, owner: &str) -> Result<()> {
        let mut leases = self.leases.write().await;
        if let Some(lease) = leases.get_mut(partition) {
            if lease.owner.as_deref() == Some(owner) {
                lease.owner = None;
                lease.expires_at = None;
            }
        }
        Ok(())
    }
}
