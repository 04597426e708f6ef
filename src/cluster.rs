use crate::config::PipelineConfig;
use crate::entities::EntityExtractor;
use crate::headline::{self, HeadlineSynthesizer};
use crate::similarity;
use crate::status::{self, Evaluation};
use crate::store::DocumentStore;
use crate::types::{Article, PipelineError, Result, StoryCluster, StoryStatus};
use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

const FUZZY_CANDIDATE_LIMIT: usize = 500;
const REPLACE_ATTEMPTS: usize = 3;

/// Assigns each arriving article to an existing story or seeds a new one,
/// and drives story status and headline evolution. Fed by the change feed,
/// so every write path is idempotent against redelivery.
pub struct ClusteringEngine {
    store: Arc<dyn DocumentStore>,
    config: PipelineConfig,
    synthesizer: Arc<dyn HeadlineSynthesizer>,
    extractor: EntityExtractor,
    /// article id -> source slug, so recomputing unique source counts does
    /// not re-fetch the same articles on every attach.
    source_cache: RwLock<HashMap<String, String>>,
}

impl ClusteringEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: PipelineConfig,
        synthesizer: Arc<dyn HeadlineSynthesizer>,
    ) -> Self {
        Self {
            store,
            config,
            synthesizer,
            extractor: EntityExtractor::new(),
            source_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Process one change-feed batch. A slow article is abandoned at the
    /// deadline to protect throughput; any other failure aborts the batch so
    /// the un-checkpointed events are redelivered.
    pub async fn process_batch(&self, articles: &[Article]) -> Result<()> {
        let deadline = std::time::Duration::from_secs(self.config.article_deadline_seconds);
        for article in articles {
            let result = match tokio::time::timeout(deadline, self.process_article(article)).await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Deadline(format!(
                    "article {} exceeded the {}s processing deadline",
                    article.id, self.config.article_deadline_seconds
                ))),
            };
            match result {
                Ok(()) => {}
                // Over-deadline articles are dropped, not retried, so one
                // slow article cannot stall the partition.
                Err(e @ PipelineError::Deadline(_)) => error!(article_id = %article.id, "{}", e),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn process_article(&self, article: &Article) -> Result<()> {
        self.source_cache
            .write()
            .await
            .insert(article.id.clone(), article.source.clone());

        // Redelivered article that already landed: attach is a no-op append,
        // which keeps replay cheap and convergent.
        if let Some(story_id) = &article.story_cluster_id {
            if self.store.get_story(story_id).await?.is_some() {
                return self.attach_to_story(story_id, article).await;
            }
        }

        if let Some(story) = self.fingerprint_match(article).await? {
            debug!(article_id = %article.id, story_id = %story.id, "Fingerprint match");
            return self.attach_to_story(&story.id, article).await;
        }

        if let Some(story) = self.fuzzy_match(article).await? {
            debug!(article_id = %article.id, story_id = %story.id, "Fuzzy match");
            return self.attach_to_story(&story.id, article).await;
        }

        self.create_story(article).await
    }

    /// Step 1: O(1) lookup by `(category, fingerprint)`. Stories past the
    /// archive age must not absorb new articles even if not yet swept.
    async fn fingerprint_match(&self, article: &Article) -> Result<Option<StoryCluster>> {
        if article.fingerprint.is_empty() {
            return Ok(None);
        }
        let found = self
            .store
            .find_story_by_fingerprint(article.category, &article.fingerprint)
            .await?;
        Ok(found.filter(|s| self.is_active(s, Utc::now())))
    }

    /// Steps 2 and 3: score recent same-category stories, drop conflicted
    /// and under-corroborated candidates, take the best survivor.
    async fn fuzzy_match(&self, article: &Article) -> Result<Option<StoryCluster>> {
        let now = Utc::now();
        let candidates = self
            .store
            .recent_stories(article.category, FUZZY_CANDIDATE_LIMIT)
            .await?;

        let mut best: Option<(f64, StoryCluster)> = None;
        for story in candidates {
            if !self.is_active(&story, now) {
                continue;
            }
            let story_entities = self.extractor.extract(&story.title);
            let score = similarity::title_similarity(
                &article.title,
                &article.entities,
                &story.title,
                &story_entities,
            );
            if score < self.config.fuzzy_similarity_threshold {
                continue;
            }
            if similarity::topic_conflict(
                &article.title,
                &article.entities,
                &story.title,
                &story_entities,
            ) {
                debug!(article_id = %article.id, story_id = %story.id, "Topic conflict, candidate rejected");
                continue;
            }
            let shared =
                similarity::shared_salient_entities(&article.entities, &story_entities);
            if score < self.config.strong_similarity_threshold
                && shared < self.config.min_shared_entities
            {
                continue;
            }
            let better = match &best {
                Some((best_score, _)) => score > *best_score,
                None => true,
            };
            if better {
                best = Some((score, story));
            }
        }
        Ok(best.map(|(_, story)| story))
    }

    /// Step 4: idempotent append, source-count recompute, status and
    /// headline evolution, all under optimistic concurrency.
    async fn attach_to_story(&self, story_id: &str, article: &Article) -> Result<()> {
        for attempt in 1..=REPLACE_ATTEMPTS {
            let mut story = self
                .store
                .get_story(story_id)
                .await?
                .ok_or_else(|| PipelineError::StoryNotFound { id: story_id.to_string() })?;

            if story.source_articles.iter().any(|id| id == &article.id) {
                self.store.set_article_story(&article.id, &story.id).await?;
                return Ok(());
            }

            // The pre-append cardinality must be captured before the append;
            // reading it afterwards would make every arrival look flat.
            let prev_count = self.unique_sources(&story.source_articles).await? as u32;
            story.source_articles.push(article.id.clone());
            let new_count = self.unique_sources(&story.source_articles).await? as u32;
            let is_gaining = new_count > prev_count;

            let now = Utc::now();
            let last_activity = story.last_updated;
            story.unique_source_count = new_count;
            story.verification_level = new_count;
            if is_gaining {
                story.last_updated = now;
                story.record_event(now, format!("source_added:{}", article.source));
            }

            let was_breaking = story.status == StoryStatus::Breaking;
            let eval = Evaluation {
                prev_count,
                new_count,
                is_gaining,
                last_activity,
                now,
            };
            if let Some(target) = status::evaluate(&self.config, &story, &eval) {
                status::apply_transition(&mut story, target, now);
            }
            let entered_breaking = !was_breaking && story.status == StoryStatus::Breaking;

            let at_threshold = self.config.headline_thresholds.contains(&new_count);
            if at_threshold || entered_breaking {
                let titles = self.recent_source_titles(&story).await?;
                headline::evolve_headline(self.synthesizer.as_ref(), &mut story, &titles, now)
                    .await;
            }

            match self.store.replace_story(&story).await {
                Ok(_) => {
                    self.store.set_article_story(&article.id, &story.id).await?;
                    info!(
                        article_id = %article.id,
                        story_id = %story.id,
                        prev_count,
                        new_count,
                        is_gaining,
                        status = %story.status,
                        "Attached article to story"
                    );
                    return Ok(());
                }
                Err(PipelineError::Conflict { .. }) if attempt < REPLACE_ATTEMPTS => {
                    warn!(
                        story_id = %story.id,
                        attempt,
                        "Concurrent story update, re-reading and retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(PipelineError::Conflict { id: story_id.to_string() })
    }

    /// Step 5: seed a fresh story from this article.
    async fn create_story(&self, article: &Article) -> Result<()> {
        let now = Utc::now();
        let story = StoryCluster {
            id: new_story_id(now),
            title: article.title.clone(),
            fingerprint: article.fingerprint.clone(),
            category: article.category,
            source_articles: vec![article.id.clone()],
            unique_source_count: 1,
            verification_level: 1,
            status: StoryStatus::Monitoring,
            first_seen: now,
            last_updated: now,
            breaking_detected_at: None,
            summary: None,
            version_history: vec![crate::types::VersionEvent {
                timestamp: now,
                event: format!("created:{}", article.source),
            }],
            version: 0,
        };
        self.store.insert_story(story.clone()).await?;
        self.store.set_article_story(&article.id, &story.id).await?;
        info!(
            article_id = %article.id,
            story_id = %story.id,
            category = %story.category,
            "Created new story"
        );
        Ok(())
    }

    fn is_active(&self, story: &StoryCluster, now: DateTime<Utc>) -> bool {
        story.status != StoryStatus::Archived
            && now - story.last_updated <= Duration::hours(self.config.archive_age_hours)
    }

    /// Distinct source slugs across the referenced articles, resolved through
    /// the side cache.
    async fn unique_sources(&self, article_ids: &[String]) -> Result<usize> {
        let mut sources: HashSet<String> = HashSet::new();
        let mut missing: Vec<String> = Vec::new();
        {
            let cache = self.source_cache.read().await;
            for id in article_ids {
                match cache.get(id) {
                    Some(source) => {
                        sources.insert(source.clone());
                    }
                    None => missing.push(id.clone()),
                }
            }
        }
        if !missing.is_empty() {
            let fetched = self.store.get_articles(&missing).await?;
            let mut cache = self.source_cache.write().await;
            for article in fetched {
                sources.insert(article.source.clone());
                cache.insert(article.id, article.source);
            }
        }
        Ok(sources.len())
    }

    async fn recent_source_titles(&self, story: &StoryCluster) -> Result<Vec<String>> {
        let recent: Vec<String> = story
            .source_articles
            .iter()
            .rev()
            .take(10)
            .rev()
            .cloned()
            .collect();
        let articles = self.store.get_articles(&recent).await?;
        Ok(articles.into_iter().map(|a| a.title).collect())
    }
}

fn new_story_id(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("story_{}_{}", now.format("%Y%m%d_%H%M%S"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headline::MockHeadlineSynthesizer;
    use crate::normalize::article_id;
    use crate::store::MemoryStore;
    use crate::types::{Category, Entity, EntityType};

    fn engine(store: Arc<MemoryStore>) -> ClusteringEngine {
        ClusteringEngine::new(
            store,
            PipelineConfig::default(),
            Arc::new(MockHeadlineSynthesizer::new()),
        )
    }

    fn article(source: &str, url: &str, title: &str, entities: Vec<Entity>) -> Article {
        let now = Utc::now();
        let extractor = EntityExtractor::new();
        let merged = if entities.is_empty() {
            extractor.extract(title)
        } else {
            entities
        };
        Article {
            id: article_id(source, url),
            source: source.to_string(),
            url: url.to_string(),
            title: title.to_string(),
            description: String::new(),
            content: String::new(),
            published_at: None,
            fetched_at: now,
            updated_at: now,
            fingerprint: crate::fingerprint::compute(title, &merged),
            entities: merged,
            category: Category::World,
            story_cluster_id: None,
        }
    }

    #[tokio::test]
    async fn same_fingerprint_lands_in_one_story() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());

        let a = store
            .upsert_article(article("ap", "https://ap.example/1", "Gaza ceasefire begins", vec![]))
            .await
            .unwrap();
        let b = store
            .upsert_article(article(
                "reuters",
                "https://reuters.example/2",
                "Gaza ceasefire starts",
                vec![],
            ))
            .await
            .unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);

        engine.process_article(&a).await.unwrap();
        engine.process_article(&b).await.unwrap();

        let stories = store.active_stories().await.unwrap();
        assert_eq!(stories.len(), 1);
        let story = &stories[0];
        assert_eq!(story.unique_source_count, 2);
        assert_eq!(story.verification_level, 2);
        assert_eq!(story.status, StoryStatus::Developing);
    }

    #[tokio::test]
    async fn is_gaining_reflects_distinct_sources_not_article_count() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());

        let first = store
            .upsert_article(article("ap", "https://ap.example/1", "Gaza ceasefire begins", vec![]))
            .await
            .unwrap();
        engine.process_article(&first).await.unwrap();
        let story_id = store.active_stories().await.unwrap()[0].id.clone();
        let before = store.get_story(&story_id).await.unwrap().unwrap();

        // Second article from the same source: count must stay flat and
        // last_updated must not move.
        let repeat = store
            .upsert_article(article("ap", "https://ap.example/2", "Gaza ceasefire starts", vec![]))
            .await
            .unwrap();
        engine.process_article(&repeat).await.unwrap();
        let flat = store.get_story(&story_id).await.unwrap().unwrap();
        assert_eq!(flat.source_articles.len(), 2);
        assert_eq!(flat.unique_source_count, 1);
        assert_eq!(flat.last_updated, before.last_updated);

        // A genuinely new source gains.
        let fresh = store
            .upsert_article(article(
                "bbc",
                "https://bbc.example/3",
                "Gaza ceasefire begins",
                vec![],
            ))
            .await
            .unwrap();
        engine.process_article(&fresh).await.unwrap();
        let gained = store.get_story(&story_id).await.unwrap().unwrap();
        assert_eq!(gained.unique_source_count, 2);
        assert!(gained.last_updated > flat.last_updated);
    }

    #[tokio::test]
    async fn repeat_source_at_a_threshold_still_resynthesizes_headline() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());

        let wires = [
            ("ap", "https://ap.example/1", "Gaza ceasefire begins across the region today"),
            ("reuters", "https://reuters.example/2", "Gaza ceasefire starts across the region today"),
            ("bbc", "https://bbc.example/3", "Gaza ceasefire holds across the region today"),
        ];
        for (source, url, title) in wires {
            let a = store.upsert_article(article(source, url, title, vec![])).await.unwrap();
            engine.process_article(&a).await.unwrap();
        }

        let story = store.active_stories().await.unwrap().remove(0);
        assert_eq!(story.unique_source_count, 3);
        assert_eq!(headline_changes(&story), 1);
        let last_updated_before = story.last_updated;

        // A second AP article keeps the count pinned at the 3-source
        // threshold: no gain, no last_updated movement, but the evolver
        // still runs and picks up the newest framing.
        let repeat = store
            .upsert_article(article(
                "ap",
                "https://ap.example/4",
                "Gaza ceasefire persists across the region today",
                vec![],
            ))
            .await
            .unwrap();
        engine.process_article(&repeat).await.unwrap();

        let story = store.active_stories().await.unwrap().remove(0);
        assert_eq!(story.unique_source_count, 3);
        assert_eq!(story.last_updated, last_updated_before);
        assert_eq!(story.title, "Gaza ceasefire persists across the region today");
        assert_eq!(headline_changes(&story), 2);
    }

    fn headline_changes(story: &StoryCluster) -> usize {
        story
            .version_history
            .iter()
            .filter(|e| e.event == "headline_changed")
            .count()
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());

        let a = store
            .upsert_article(article("ap", "https://ap.example/1", "Gaza ceasefire begins", vec![]))
            .await
            .unwrap();
        engine.process_article(&a).await.unwrap();
        // The stored article now carries its back-reference; replay it twice.
        let delivered = store.get_article(&a.id).await.unwrap().unwrap();
        engine.process_article(&delivered).await.unwrap();
        engine.process_article(&delivered).await.unwrap();

        let stories = store.active_stories().await.unwrap();
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].source_articles.len(), 1);
        assert_eq!(stories[0].unique_source_count, 1);
    }

    #[tokio::test]
    async fn conflicting_topics_fork_into_two_stories() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());

        let russia = store
            .upsert_article(article(
                "ap",
                "https://ap.example/r",
                "Russia launches missiles overnight",
                vec![Entity {
                    text: "Russia".to_string(),
                    entity_type: EntityType::Location,
                }],
            ))
            .await
            .unwrap();
        let israel = store
            .upsert_article(article(
                "bbc",
                "https://bbc.example/i",
                "Israel launches operation overnight",
                vec![Entity {
                    text: "Israel".to_string(),
                    entity_type: EntityType::Location,
                }],
            ))
            .await
            .unwrap();

        engine.process_article(&russia).await.unwrap();
        engine.process_article(&israel).await.unwrap();

        assert_eq!(store.active_stories().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn aged_story_is_not_revived() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());

        let a = store
            .upsert_article(article("ap", "https://ap.example/1", "Gaza ceasefire begins", vec![]))
            .await
            .unwrap();
        engine.process_article(&a).await.unwrap();

        // Age the story past the archive threshold.
        let mut story = store.active_stories().await.unwrap().remove(0);
        story.last_updated = Utc::now() - Duration::hours(25);
        story.first_seen = story.last_updated;
        store.replace_story(&story).await.unwrap();

        let late = store
            .upsert_article(article(
                "bbc",
                "https://bbc.example/2",
                "Gaza ceasefire starts",
                vec![],
            ))
            .await
            .unwrap();
        engine.process_article(&late).await.unwrap();

        let stories = store.active_stories().await.unwrap();
        assert_eq!(stories.len(), 2);
        let revived = stories.iter().find(|s| s.id == story.id).unwrap();
        assert_eq!(revived.source_articles.len(), 1);
    }
}
