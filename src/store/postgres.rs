use super::{ChangeBatch, DocumentStore};
use crate::types::{
    Article, Category, FeedPollState, Lease, PipelineError, Result, StoryCluster, StoryStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;

/// Postgres-backed document store. Collections map to tables one-to-one; the
/// change feed is a per-partition sequence table appended inside the upsert
/// transaction; leases are conditional updates, so acquisition is a
/// compare-and-set.
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let db = PgPool::connect(database_url).await?;
        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .map_err(|e| PipelineError::General(format!("migration failed: {}", e)))?;
        info!("Connected to Postgres document store");
        Ok(Self { db })
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn upsert_article(&self, article: Article) -> Result<Article> {
        let mut tx = self.db.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO raw_articles
                (id, source, url, title, description, content, published_at,
                 fetched_at, updated_at, entities, category, fingerprint,
                 story_cluster_id, fetched_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                source = EXCLUDED.source,
                url = EXCLUDED.url,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                content = EXCLUDED.content,
                published_at = EXCLUDED.published_at,
                updated_at = EXCLUDED.updated_at,
                entities = EXCLUDED.entities,
                category = EXCLUDED.category,
                fingerprint = EXCLUDED.fingerprint
            RETURNING *
            "#,
        )
        .bind(&article.id)
        .bind(&article.source)
        .bind(&article.url)
        .bind(&article.title)
        .bind(&article.description)
        .bind(&article.content)
        .bind(article.published_at)
        .bind(article.fetched_at)
        .bind(article.updated_at)
        .bind(serde_json::to_value(&article.entities)?)
        .bind(article.category.as_str())
        .bind(&article.fingerprint)
        .bind(&article.story_cluster_id)
        .bind(article.fetched_date())
        .fetch_one(&mut *tx)
        .await?;

        let stored = article_from_row(&row)?;

        sqlx::query("INSERT INTO article_change_log (partition_key, article_id) VALUES ($1, $2)")
            .bind(stored.fetched_date())
            .bind(&stored.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn get_article(&self, id: &str) -> Result<Option<Article>> {
        let row = sqlx::query("SELECT * FROM raw_articles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.map(|r| article_from_row(&r)).transpose()
    }

    async fn get_articles(&self, ids: &[String]) -> Result<Vec<Article>> {
        let rows = sqlx::query("SELECT * FROM raw_articles WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(article_from_row).collect()
    }

    async fn set_article_story(&self, article_id: &str, story_id: &str) -> Result<()> {
        sqlx::query("UPDATE raw_articles SET story_cluster_id = $1 WHERE id = $2")
            .bind(story_id)
            .bind(article_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_story(&self, story: StoryCluster) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO story_clusters
                (id, title, fingerprint, category, source_articles,
                 unique_source_count, verification_level, status, first_seen,
                 last_updated, breaking_detected_at, summary, version_history,
                 version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 1)
            "#,
        )
        .bind(&story.id)
        .bind(&story.title)
        .bind(&story.fingerprint)
        .bind(story.category.as_str())
        .bind(serde_json::to_value(&story.source_articles)?)
        .bind(story.unique_source_count as i32)
        .bind(story.verification_level as i32)
        .bind(story.status.as_str())
        .bind(story.first_seen)
        .bind(story.last_updated)
        .bind(story.breaking_detected_at)
        .bind(&story.summary)
        .bind(serde_json::to_value(&story.version_history)?)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_story(&self, id: &str) -> Result<Option<StoryCluster>> {
        let row = sqlx::query("SELECT * FROM story_clusters WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.map(|r| story_from_row(&r)).transpose()
    }

    async fn find_story_by_fingerprint(
        &self,
        category: Category,
        fingerprint: &str,
    ) -> Result<Option<StoryCluster>> {
        if fingerprint.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(
            r#"
            SELECT * FROM story_clusters
            WHERE category = $1 AND fingerprint = $2 AND status != 'ARCHIVED'
            ORDER BY last_updated DESC
            LIMIT 1
            "#,
        )
        .bind(category.as_str())
        .bind(fingerprint)
        .fetch_optional(&self.db)
        .await?;
        row.map(|r| story_from_row(&r)).transpose()
    }

    async fn recent_stories(&self, category: Category, limit: usize) -> Result<Vec<StoryCluster>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM story_clusters
            WHERE category = $1 AND status != 'ARCHIVED'
            ORDER BY last_updated DESC
            LIMIT $2
            "#,
        )
        .bind(category.as_str())
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(story_from_row).collect()
    }

    async fn replace_story(&self, story: &StoryCluster) -> Result<StoryCluster> {
        let row = sqlx::query(
            r#"
            UPDATE story_clusters SET
                title = $3,
                fingerprint = $4,
                source_articles = $5,
                unique_source_count = $6,
                verification_level = $7,
                status = $8,
                last_updated = $9,
                breaking_detected_at = $10,
                version_history = $11,
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING *
            "#,
        )
        .bind(&story.id)
        .bind(story.version as i64)
        .bind(&story.title)
        .bind(&story.fingerprint)
        .bind(serde_json::to_value(&story.source_articles)?)
        .bind(story.unique_source_count as i32)
        .bind(story.verification_level as i32)
        .bind(story.status.as_str())
        .bind(story.last_updated)
        .bind(story.breaking_detected_at)
        .bind(serde_json::to_value(&story.version_history)?)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(r) => story_from_row(&r),
            None => {
                let exists = sqlx::query("SELECT 1 FROM story_clusters WHERE id = $1")
                    .bind(&story.id)
                    .fetch_optional(&self.db)
                    .await?;
                if exists.is_some() {
                    Err(PipelineError::Conflict { id: story.id.clone() })
                } else {
                    Err(PipelineError::StoryNotFound { id: story.id.clone() })
                }
            }
        }
    }

    async fn patch_story_summary(&self, id: &str, summary: serde_json::Value) -> Result<()> {
        let event = serde_json::json!([{
            "timestamp": Utc::now(),
            "event": "summary_updated",
        }]);
        let result = sqlx::query(
            r#"
            UPDATE story_clusters SET
                summary = $2,
                version_history = version_history || $3::jsonb,
                version = version + 1
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&summary)
        .bind(&event)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::StoryNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn active_stories(&self) -> Result<Vec<StoryCluster>> {
        let rows = sqlx::query("SELECT * FROM story_clusters WHERE status != 'ARCHIVED'")
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(story_from_row).collect()
    }

    async fn list_feed_states(&self) -> Result<Vec<FeedPollState>> {
        let rows = sqlx::query("SELECT * FROM feed_poll_states")
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(feed_state_from_row).collect()
    }

    async fn get_feed_state(&self, feed_id: &str) -> Result<Option<FeedPollState>> {
        let row = sqlx::query("SELECT * FROM feed_poll_states WHERE feed_id = $1")
            .bind(feed_id)
            .fetch_optional(&self.db)
            .await?;
        row.map(|r| feed_state_from_row(&r)).transpose()
    }

    async fn put_feed_state(&self, state: FeedPollState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feed_poll_states
                (feed_id, last_polled_at, last_successful_at, last_etag,
                 last_modified, consecutive_failures, next_eligible_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (feed_id) DO UPDATE SET
                last_polled_at = EXCLUDED.last_polled_at,
                last_successful_at = EXCLUDED.last_successful_at,
                last_etag = EXCLUDED.last_etag,
                last_modified = EXCLUDED.last_modified,
                consecutive_failures = EXCLUDED.consecutive_failures,
                next_eligible_at = EXCLUDED.next_eligible_at
            "#,
        )
        .bind(&state.feed_id)
        .bind(state.last_polled_at)
        .bind(state.last_successful_at)
        .bind(&state.last_etag)
        .bind(&state.last_modified)
        .bind(state.consecutive_failures as i32)
        .bind(state.next_eligible_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn article_partitions(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT partition_key FROM article_change_log ORDER BY partition_key",
        )
        .fetch_all(&self.db)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("partition_key").map_err(Into::into))
            .collect()
    }

    async fn read_article_changes(
        &self,
        partition: &str,
        continuation: u64,
        limit: usize,
    ) -> Result<ChangeBatch> {
        let rows = sqlx::query(
            r#"
            SELECT seq, article_id FROM article_change_log
            WHERE partition_key = $1 AND seq > $2
            ORDER BY seq ASC
            LIMIT $3
            "#,
        )
        .bind(partition)
        .bind(continuation as i64)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;

        let mut next = continuation;
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            next = row.try_get::<i64, _>("seq")? as u64;
            ids.push(row.try_get::<String, _>("article_id")?);
        }

        // Deliver current document state in log order.
        let fetched = self.get_articles(&ids).await?;
        let mut articles = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(article) = fetched.iter().find(|a| &a.id == id) {
                articles.push(article.clone());
            }
        }

        Ok(ChangeBatch {
            articles,
            continuation: next,
        })
    }

    async fn acquire_lease(
        &self,
        partition: &str,
        owner: &str,
        ttl_seconds: i64,
    ) -> Result<Option<Lease>> {
        let expires_at = Utc::now() + Duration::seconds(ttl_seconds);
        let row = sqlx::query(
            r#"
            INSERT INTO change_feed_leases (partition_key, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (partition_key) DO UPDATE SET
                owner = EXCLUDED.owner,
                expires_at = EXCLUDED.expires_at
            WHERE change_feed_leases.owner IS NULL
               OR change_feed_leases.owner = EXCLUDED.owner
               OR change_feed_leases.expires_at <= now()
            RETURNING partition_key, owner, expires_at, continuation
            "#,
        )
        .bind(partition)
        .bind(owner)
        .bind(expires_at)
        .fetch_optional(&self.db)
        .await?;

        row.map(|r| lease_from_row(&r)).transpose()
    }

    async fn renew_lease(&self, partition: &str, owner: &str, ttl_seconds: i64) -> Result<bool> {
        let expires_at = Utc::now() + Duration::seconds(ttl_seconds);
        let result = sqlx::query(
            r#"
            UPDATE change_feed_leases SET expires_at = $3
            WHERE partition_key = $1 AND owner = $2 AND expires_at > now()
            "#,
        )
        .bind(partition)
        .bind(owner)
        .bind(expires_at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn checkpoint_lease(
        &self,
        partition: &str,
        owner: &str,
        continuation: u64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE change_feed_leases SET continuation = $3
            WHERE partition_key = $1 AND owner = $2
            "#,
        )
        .bind(partition)
        .bind(owner)
        .bind(continuation as i64)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, partition: &str, owner: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE change_feed_leases SET owner = NULL, expires_at = NULL
            WHERE partition_key = $1 AND owner = $2
            "#,
        )
        .bind(partition)
        .bind(owner)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

fn article_from_row(row: &PgRow) -> Result<Article> {
    let entities_json: serde_json::Value = row.try_get("entities")?;
    Ok(Article {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        content: row.try_get("content")?,
        published_at: row.try_get::<Option<DateTime<Utc>>, _>("published_at")?,
        fetched_at: row.try_get("fetched_at")?,
        updated_at: row.try_get("updated_at")?,
        entities: serde_json::from_value(entities_json)?,
        category: Category::parse(row.try_get::<String, _>("category")?.as_str()),
        fingerprint: row.try_get("fingerprint")?,
        story_cluster_id: row.try_get("story_cluster_id")?,
    })
}

fn story_from_row(row: &PgRow) -> Result<StoryCluster> {
    let source_articles: serde_json::Value = row.try_get("source_articles")?;
    let version_history: serde_json::Value = row.try_get("version_history")?;
    Ok(StoryCluster {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        fingerprint: row.try_get("fingerprint")?,
        category: Category::parse(row.try_get::<String, _>("category")?.as_str()),
        source_articles: serde_json::from_value(source_articles)?,
        unique_source_count: row.try_get::<i32, _>("unique_source_count")? as u32,
        verification_level: row.try_get::<i32, _>("verification_level")? as u32,
        status: StoryStatus::parse(row.try_get::<String, _>("status")?.as_str()),
        first_seen: row.try_get("first_seen")?,
        last_updated: row.try_get("last_updated")?,
        breaking_detected_at: row.try_get::<Option<DateTime<Utc>>, _>("breaking_detected_at")?,
        summary: row.try_get::<Option<serde_json::Value>, _>("summary")?,
        version_history: serde_json::from_value(version_history)?,
        version: row.try_get::<i64, _>("version")? as u64,
    })
}

fn feed_state_from_row(row: &PgRow) -> Result<FeedPollState> {
    Ok(FeedPollState {
        feed_id: row.try_get("feed_id")?,
        last_polled_at: row.try_get::<Option<DateTime<Utc>>, _>("last_polled_at")?,
        last_successful_at: row.try_get::<Option<DateTime<Utc>>, _>("last_successful_at")?,
        last_etag: row.try_get("last_etag")?,
        last_modified: row.try_get("last_modified")?,
        consecutive_failures: row.try_get::<i32, _>("consecutive_failures")? as u32,
        next_eligible_at: row.try_get("next_eligible_at")?,
    })
}

fn lease_from_row(row: &PgRow) -> Result<Lease> {
    Ok(Lease {
        partition: row.try_get("partition_key")?,
        continuation: row.try_get::<i64, _>("continuation")? as u64,
        owner: row.try_get("owner")?,
        expires_at: row.try_get::<Option<DateTime<Utc>>, _>("expires_at")?,
    })
}
