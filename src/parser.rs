use crate::types::{PipelineError, Result};
use chrono::{DateTime, Utc};
use feed_rs::parser;
use std::collections::HashSet;
use tracing::debug;

/// One entry pulled out of an RSS/Atom response, before normalization.
#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub url: String,
    pub title: String,
    pub description: String,
    pub content: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Parse an RSS/Atom body into entries. Entries without a link or title are
/// skipped; duplicate URLs within one response are collapsed to the first.
pub fn parse_feed(body: &str) -> Result<Vec<ParsedEntry>> {
    let feed = parser::parse(body.as_bytes())
        .map_err(|e| PipelineError::Parse(format!("failed to parse feed: {}", e)))?;

    let mut entries = Vec::new();
    let mut seen_urls: HashSet<String> = HashSet::new();

    for entry in feed.entries {
        let url = match entry.links.first() {
            Some(link) => link.href.clone(),
            None => continue,
        };
        if !seen_urls.insert(url.clone()) {
            debug!("Skipping duplicate entry URL within response: {}", url);
            continue;
        }

        let title = match entry.title {
            Some(t) if !t.content.trim().is_empty() => t.content,
            _ => continue,
        };

        let description = entry.summary.map(|s| s.content).unwrap_or_default();
        // Prefer full content over the summary when the publisher ships both.
        let content = entry
            .content
            .and_then(|c| c.body)
            .unwrap_or_else(|| description.clone());
        let published_at = entry
            .published
            .or(entry.updated)
            .map(|dt| dt.with_timezone(&Utc));

        entries.push(ParsedEntry {
            url,
            title,
            description,
            content,
            published_at,
        });
    }

    debug!("Parsed feed with {} entries", entries.len());
    Ok(entries)
}
