//! End-to-end scenarios against the in-memory document store: ingestion
//! upserts flow through the change feed into the clustering engine, and
//! story state evolves the way the read side expects.

use chrono::{Duration, Utc};
use newsreel::entities::EntityExtractor;
use newsreel::headline::MockHeadlineSynthesizer;
use newsreel::normalize::article_id;
use newsreel::{
    fingerprint, status, Article, Category, ClusteringEngine, DocumentStore, MemoryStore,
    PipelineConfig, StoryStatus,
};
use std::sync::Arc;

fn make_article(source: &str, url: &str, title: &str) -> Article {
    let extractor = EntityExtractor::new();
    let entities = extractor.extract(title);
    let now = Utc::now();
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
        fingerprint: fingerprint::compute(title, &entities),
        entities,
        category: Category::World,
        story_cluster_id: None,
    }
}

fn engine(store: &Arc<MemoryStore>) -> ClusteringEngine {
    ClusteringEngine::new(
        store.clone() as Arc<dyn DocumentStore>,
        PipelineConfig::default(),
        Arc::new(MockHeadlineSynthesizer::new()),
    )
}

/// Deliver everything currently on the change feed to the engine, the way a
/// lease-holding worker would.
async fn drain_feed(store: &Arc<MemoryStore>, engine: &ClusteringEngine) {
    for partition in store.article_partitions().await.unwrap() {
        let mut continuation = 0u64;
        loop {
            let batch = store
                .read_article_changes(&partition, continuation, 100)
                .await
                .unwrap();
            if batch.articles.is_empty() {
                break;
            }
            engine.process_batch(&batch.articles).await.unwrap();
            continuation = batch.continuation;
        }
    }
}

#[tokio::test]
async fn reingesting_a_url_overwrites_in_place() {
    let store = Arc::new(MemoryStore::new());

    let first = store
        .upsert_article(make_article(
            "ap",
            "https://ap.example/ceasefire",
            "Gaza ceasefire begins at dawn",
        ))
        .await
        .unwrap();

    // The publisher revises the piece; same URL, new title, later clock.
    let mut revised = make_article(
        "ap",
        "https://ap.example/ceasefire",
        "Gaza ceasefire begins after final talks",
    );
    revised.updated_at = first.updated_at + Duration::minutes(7);
    revised.fetched_at = revised.updated_at;
    let second = store.upsert_article(revised).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.title, "Gaza ceasefire begins after final talks");
    assert_eq!(second.fetched_at, first.fetched_at);
    assert!(second.updated_at > first.updated_at);

    // Still one row.
    let stored = store.get_article(&first.id).await.unwrap().unwrap();
    assert_eq!(stored.title, second.title);
}

#[tokio::test]
async fn corroborating_sources_share_a_story_via_fingerprint() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(&store);

    store
        .upsert_article(make_article(
            "ap",
            "https://ap.example/1",
            "Gaza ceasefire begins",
        ))
        .await
        .unwrap();
    store
        .upsert_article(make_article(
            "reuters",
            "https://reuters.example/2",
            "Gaza ceasefire starts",
        ))
        .await
        .unwrap();

    drain_feed(&store, &engine).await;

    let stories = store.active_stories().await.unwrap();
    assert_eq!(stories.len(), 1);
    let story = &stories[0];
    assert_eq!(story.unique_source_count, 2);
    assert_eq!(story.verification_level, 2);
    assert_eq!(story.status, StoryStatus::Developing);

    // Both articles carry the back-reference.
    for id in &story.source_articles {
        let article = store.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.story_cluster_id.as_deref(), Some(story.id.as_str()));
    }
}

#[tokio::test]
async fn shared_entities_lift_a_reworded_headline_into_the_story() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(&store);

    let seed = make_article(
        "ap",
        "https://ap.example/deal",
        "Israel and Hamas reach Gaza ceasefire deal",
    );
    let reworded = make_article(
        "bbc",
        "https://bbc.example/deal",
        "Ceasefire agreement reached between Israel and Hamas in Gaza",
    );
    // Different wording, different fingerprints: only the fuzzy path can
    // join these.
    assert_ne!(seed.fingerprint, reworded.fingerprint);

    store.upsert_article(seed).await.unwrap();
    store.upsert_article(reworded).await.unwrap();
    drain_feed(&store, &engine).await;

    let stories = store.active_stories().await.unwrap();
    assert_eq!(stories.len(), 1, "{:?}", stories.iter().map(|s| &s.title).collect::<Vec<_>>());
    assert_eq!(stories[0].unique_source_count, 2);
}

#[tokio::test]
async fn lexical_overlap_does_not_merge_conflicting_topics() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(&store);

    store
        .upsert_article(make_article(
            "ap",
            "https://ap.example/ru",
            "Russia launches major overnight missile barrage on northern cities",
        ))
        .await
        .unwrap();
    store
        .upsert_article(make_article(
            "bbc",
            "https://bbc.example/il",
            "Israel launches major overnight missile barrage on northern cities",
        ))
        .await
        .unwrap();

    drain_feed(&store, &engine).await;

    let stories = store.active_stories().await.unwrap();
    assert_eq!(stories.len(), 2);
}

#[tokio::test]
async fn third_source_breaks_and_fourth_gains_without_rethreshold() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(&store);

    // Reworded headlines from three agencies; all share a fingerprint, and
    // the mock synthesizer echoes the newest source title at thresholds.
    let wires = [
        ("ap", "Gaza ceasefire begins across the region today"),
        ("reuters", "Gaza ceasefire starts across the region today"),
        ("bbc", "Gaza ceasefire holds across the region today"),
    ];
    for (source, title) in wires {
        store
            .upsert_article(make_article(
                source,
                &format!("https://{}.example/story", source),
                title,
            ))
            .await
            .unwrap();
    }
    drain_feed(&store, &engine).await;

    let story = store.active_stories().await.unwrap().remove(0);
    assert_eq!(story.status, StoryStatus::Breaking);
    assert!(story.breaking_detected_at.is_some());
    let headline_changes = story
        .version_history
        .iter()
        .filter(|e| e.event == "headline_changed")
        .count();
    assert_eq!(headline_changes, 1, "headline synthesized at the 3-source threshold");
    let last_updated_at_three = story.last_updated;

    // Fourth distinct source ten minutes into the story's life: still
    // breaking, last_updated advances, no extra headline event until the
    // next threshold.
    store
        .upsert_article(make_article(
            "guardian",
            "https://guardian.example/story",
            "Gaza ceasefire remains across the region today",
        ))
        .await
        .unwrap();
    drain_feed(&store, &engine).await;

    let story = store.active_stories().await.unwrap().remove(0);
    assert_eq!(story.status, StoryStatus::Breaking);
    assert_eq!(story.unique_source_count, 4);
    assert!(story.last_updated >= last_updated_at_three);
    assert!(story
        .version_history
        .iter()
        .any(|e| e.event.starts_with("source_added:guardian")));
    let headline_changes = story
        .version_history
        .iter()
        .filter(|e| e.event == "headline_changed")
        .count();
    assert_eq!(headline_changes, 1);
}

#[tokio::test]
async fn replaying_the_change_feed_converges_to_the_same_stories() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(&store);

    for (source, title) in [
        ("ap", "Gaza ceasefire begins"),
        ("reuters", "Gaza ceasefire starts"),
        ("bbc", "Gaza ceasefire begins"),
    ] {
        store
            .upsert_article(make_article(
                source,
                &format!("https://{}.example/x", source),
                title,
            ))
            .await
            .unwrap();
    }

    // A worker crashes mid-batch: the prefix is delivered, never
    // checkpointed, and the whole window is delivered again.
    let partition = store.article_partitions().await.unwrap().remove(0);
    let prefix = store.read_article_changes(&partition, 0, 2).await.unwrap();
    engine.process_batch(&prefix.articles).await.unwrap();
    drain_feed(&store, &engine).await;
    drain_feed(&store, &engine).await;

    let stories = store.active_stories().await.unwrap();
    assert_eq!(stories.len(), 1);
    let story = &stories[0];
    assert_eq!(story.source_articles.len(), 3);
    assert_eq!(story.unique_source_count, 3);

    let mut deduped = story.source_articles.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(deduped.len(), story.source_articles.len());
}

#[tokio::test]
async fn aged_stories_archive_and_late_articles_fork() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(&store);
    let config = PipelineConfig::default();

    store
        .upsert_article(make_article(
            "ap",
            "https://ap.example/old",
            "Gaza ceasefire begins",
        ))
        .await
        .unwrap();
    drain_feed(&store, &engine).await;

    // Quiet for 25 hours.
    let mut story = store.active_stories().await.unwrap().remove(0);
    let original_id = story.id.clone();
    story.last_updated = Utc::now() - Duration::hours(25);
    store.replace_story(&story).await.unwrap();

    let archived = status::sweep_once(store.as_ref(), &config).await.unwrap();
    assert_eq!(archived, 1);
    let swept = store.get_story(&original_id).await.unwrap().unwrap();
    assert_eq!(swept.status, StoryStatus::Archived);

    // A matching article arriving later seeds a fresh story instead of
    // reviving the archived one.
    store
        .upsert_article(make_article(
            "bbc",
            "https://bbc.example/late",
            "Gaza ceasefire starts",
        ))
        .await
        .unwrap();
    drain_feed(&store, &engine).await;

    let active = store.active_stories().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_ne!(active[0].id, original_id);
    let untouched = store.get_story(&original_id).await.unwrap().unwrap();
    assert_eq!(untouched.source_articles.len(), 1);
}

#[tokio::test]
async fn summarizer_patch_never_moves_last_updated() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(&store);

    store
        .upsert_article(make_article(
            "ap",
            "https://ap.example/1",
            "Gaza ceasefire begins",
        ))
        .await
        .unwrap();
    drain_feed(&store, &engine).await;

    let before = store.active_stories().await.unwrap().remove(0);
    store
        .patch_story_summary(
            &before.id,
            serde_json::json!({"text": "Multiple agencies report a ceasefire taking hold."}),
        )
        .await
        .unwrap();

    let after = store.get_story(&before.id).await.unwrap().unwrap();
    assert_eq!(after.last_updated, before.last_updated);
    assert_eq!(after.status, before.status);
    assert!(after.summary.is_some());
    assert!(after
        .version_history
        .iter()
        .any(|e| e.event == "summary_updated"));
}
