use crate::types::Entity;
use std::collections::BTreeSet;

/// Tokens the fingerprint ignores beyond ordinary stopwords: the verbs
/// headlines swap freely between rewrites of the same event.
const NEWS_VERBS: &[&str] = &[
    "announces", "announced", "announce", "says", "said", "reports", "reported",
    "unveils", "unveiled", "warns", "warned", "begins", "began", "starts",
    "started", "ends", "ended", "claims", "claimed", "confirms", "confirmed",
    "denies", "denied", "reveals", "revealed", "launches", "launched", "urges",
    "urged", "vows", "vowed", "declares", "declared", "accuses", "accused",
    "seeks", "sought", "calls", "called", "faces", "tells", "told",
];

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of",
    "with", "by", "is", "are", "was", "were", "be", "been", "has", "have", "had",
    "will", "would", "could", "should", "this", "that", "these", "those", "its",
    "as", "after", "before", "over", "under", "amid", "into", "from", "about",
    "against", "between", "during", "while", "new", "more", "than",
];

/// Lowercase alphanumeric tokens. Shared by fingerprinting and title
/// similarity so both see the same token stream.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Ordered, underscore-joined triple summarizing an article. Two articles
/// about the same event generally share it; different wording is caught by
/// the fuzzy path instead. May be empty when the title carries no signal.
pub fn compute(title: &str, entities: &[Entity]) -> String {
    let mut merged: BTreeSet<String> = BTreeSet::new();

    let mut kept = 0usize;
    for token in tokenize(title) {
        if STOPWORDS.contains(&token.as_str()) || NEWS_VERBS.contains(&token.as_str()) {
            continue;
        }
        if token.len() > 4 {
            merged.insert(token);
            kept += 1;
            if kept == 5 {
                break;
            }
        }
    }

    for entity in entities {
        if entity.entity_type.is_salient() {
            merged.insert(entity.text.to_lowercase().replace(' ', "_"));
        }
    }

    merged.into_iter().take(3).collect::<Vec<_>>().join("_")
}
