use crate::types::{PipelineError, Result, StoryCluster};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_SOURCE_TITLES: usize = 10;
const MIN_HEADLINE_WORDS: usize = 6;
const MAX_HEADLINE_WORDS: usize = 20;
const COMPLETION_TOKEN_BUDGET: u32 = 100;
const SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(15);

/// The narrow contract with the headline collaborator: current title plus up
/// to ten source titles in, one synthesized headline out.
#[async_trait]
pub trait HeadlineSynthesizer: Send + Sync {
    async fn synthesize(&self, current_title: &str, source_titles: &[String]) -> Result<String>;
}

/// Ask the synthesizer for a fresher headline and apply it if it survives
/// validation. Any failure keeps the existing title. Returns whether the
/// title changed.
pub async fn evolve_headline(
    synthesizer: &dyn HeadlineSynthesizer,
    story: &mut StoryCluster,
    source_titles: &[String],
    now: DateTime<Utc>,
) -> bool {
    let titles: Vec<String> = source_titles.iter().take(MAX_SOURCE_TITLES).cloned().collect();

    let candidate = match synthesizer.synthesize(&story.title, &titles).await {
        Ok(candidate) => candidate,
        Err(e) => {
            warn!(story_id = %story.id, "Headline synthesis failed, keeping title: {}", e);
            return false;
        }
    };

    match validate_headline(&candidate, &story.title) {
        Some(headline) => {
            info!(story_id = %story.id, from = %story.title, to = %headline, "Headline evolved");
            story.title = headline;
            story.record_event(now, "headline_changed");
            true
        }
        None => {
            debug!(story_id = %story.id, candidate = %candidate, "Rejected synthesized headline");
            false
        }
    }
}

/// Word count 6-20, no placeholder markers, not an echo of the current title.
pub fn validate_headline(candidate: &str, current_title: &str) -> Option<String> {
    let cleaned = candidate.trim().trim_matches('"').trim();
    if cleaned.is_empty() {
        return None;
    }
    let words = cleaned.split_whitespace().count();
    if !(MIN_HEADLINE_WORDS..=MAX_HEADLINE_WORDS).contains(&words) {
        return None;
    }
    let lower = cleaned.to_lowercase();
    const PLACEHOLDERS: &[&str] = &["{", "}", "[", "]", "<", ">", "todo", "n/a", "placeholder", "headline:"];
    if PLACEHOLDERS.iter().any(|p| lower.contains(p)) {
        return None;
    }
    if lower == current_title.trim().to_lowercase() {
        return None;
    }
    Some(cleaned.to_string())
}

/// Calls a chat-completions endpoint with a 100-token budget. The model is
/// asked for the latest, most specific framing the source set agrees on.
pub struct ModelHeadlineSynthesizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl ModelHeadlineSynthesizer {
    pub fn new(endpoint: String, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SYNTHESIS_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl HeadlineSynthesizer for ModelHeadlineSynthesizer {
    async fn synthesize(&self, current_title: &str, source_titles: &[String]) -> Result<String> {
        let source_list = source_titles
            .iter()
            .map(|t| format!("- {}", t))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Current headline: {}\n\nSource headlines:\n{}\n\nWrite one headline of 8-15 words \
             capturing the latest, most specific framing the sources agree on. Reply with the \
             headline only.",
            current_title, source_list
        );

        let mut request = self.client.post(&self.endpoint).json(&json!({
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": COMPLETION_TOKEN_BUDGET,
            "temperature": 0.2,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(PipelineError::Synthesizer(format!(
                "endpoint returned HTTP {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response.json().await?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| PipelineError::Synthesizer("no completion in response".to_string()))
    }
}

/// Deterministic synthesizer for tests and database-less runs: echoes the
/// most recent source title, which is exactly the "latest framing" a model
/// would be asked for.
#[derive(Default)]
pub struct MockHeadlineSynthesizer {
    canned: Option<String>,
}

impl MockHeadlineSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            canned: Some(response.into()),
        }
    }
}

#[async_trait]
impl HeadlineSynthesizer for MockHeadlineSynthesizer {
    async fn synthesize(&self, current_title: &str, source_titles: &[String]) -> Result<String> {
        if let Some(canned) = &self.canned {
            return Ok(canned.clone());
        }
        Ok(source_titles
            .last()
            .cloned()
            .unwrap_or_else(|| current_title.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, StoryStatus};

    fn story() -> StoryCluster {
        let now = Utc::now();
        StoryCluster {
            id: "story_20250304_120000_abc123".to_string(),
            title: "Ceasefire begins across the region".to_string(),
            fingerprint: "ceasefire_gaza".to_string(),
            category: Category::World,
            source_articles: vec![],
            unique_source_count: 3,
            verification_level: 3,
            status: StoryStatus::Breaking,
            first_seen: now,
            last_updated: now,
            breaking_detected_at: Some(now),
            summary: None,
            version_history: vec![],
            version: 1,
        }
    }

    #[test]
    fn validation_enforces_word_count() {
        assert!(validate_headline("Too short to pass", "x").is_none());
        assert!(validate_headline(
            "Ceasefire holds as aid convoys enter the region for a second day",
            "x"
        )
        .is_some());
        let rambling = "word ".repeat(21);
        assert!(validate_headline(&rambling, "x").is_none());
    }

    #[test]
    fn validation_rejects_placeholders_and_echoes() {
        assert!(validate_headline("[HEADLINE] goes right here in this spot", "x").is_none());
        assert!(validate_headline(
            "Ceasefire begins across the region",
            "ceasefire begins across the region"
        )
        .is_none());
    }

    #[tokio::test]
    async fn failed_synthesis_keeps_existing_title() {
        struct Failing;
        #[async_trait]
        impl HeadlineSynthesizer for Failing {
            async fn synthesize(&self, _: &str, _: &[String]) -> Result<String> {
                Err(PipelineError::Synthesizer("timeout".to_string()))
            }
        }

        let mut s = story();
        let before = s.title.clone();
        let changed = evolve_headline(&Failing, &mut s, &[], Utc::now()).await;
        assert!(!changed);
        assert_eq!(s.title, before);
        assert!(s.version_history.is_empty());
    }

    #[tokio::test]
    async fn accepted_headline_records_a_history_event() {
        let synth = MockHeadlineSynthesizer::with_response(
            "Aid convoys enter as ceasefire holds for a second day",
        );
        let mut s = story();
        let changed = evolve_headline(&synth, &mut s, &[], Utc::now()).await;
        assert!(changed);
        assert_eq!(s.title, "Aid convoys enter as ceasefire holds for a second day");
        assert_eq!(s.version_history.len(), 1);
        assert_eq!(s.version_history[0].event, "headline_changed");
    }

    #[tokio::test]
    async fn invalid_candidate_is_rejected_without_mutation() {
        let synth = MockHeadlineSynthesizer::with_response("Too short");
        let mut s = story();
        let changed = evolve_headline(&synth, &mut s, &[], Utc::now()).await;
        assert!(!changed);
        assert!(s.version_history.is_empty());
    }
}
