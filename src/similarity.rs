use crate::fingerprint::tokenize;
use crate::types::{Entity, EntityType};
use std::collections::HashSet;

pub const ENTITY_BONUS: f64 = 0.1;

/// Jaccard index over tokenized titles plus a bonus per shared salient
/// entity, capped at 1.0.
pub fn title_similarity(
    article_title: &str,
    article_entities: &[Entity],
    story_title: &str,
    story_entities: &[Entity],
) -> f64 {
    let a: HashSet<String> = tokenize(article_title).into_iter().collect();
    let b: HashSet<String> = tokenize(story_title).into_iter().collect();
    let shared = shared_salient_entities(article_entities, story_entities);
    (jaccard(&a, &b) + ENTITY_BONUS * shared as f64).min(1.0)
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Count of distinct PERSON/ORG/LOCATION entity texts present on both sides,
/// case-insensitive.
pub fn shared_salient_entities(a: &[Entity], b: &[Entity]) -> usize {
    let left: HashSet<String> = salient_texts(a);
    let right: HashSet<String> = salient_texts(b);
    left.intersection(&right).count()
}

fn salient_texts(entities: &[Entity]) -> HashSet<String> {
    entities
        .iter()
        .filter(|e| e.entity_type.is_salient())
        .map(|e| e.text.to_lowercase())
        .collect()
}

/// Two sides talk past each other when their dominant LOCATION (or, failing
/// that, PERSON) entities disagree and neither is even mentioned in the other
/// side's title. A lexical overlap like a shared verb is not enough to bind
/// an article about one place to a story about another.
pub fn topic_conflict(
    article_title: &str,
    article_entities: &[Entity],
    story_title: &str,
    story_entities: &[Entity],
) -> bool {
    for entity_type in [EntityType::Location, EntityType::Person] {
        let article_dominant = dominant(article_entities, entity_type);
        let story_dominant = dominant(story_entities, entity_type);
        if let (Some(a), Some(s)) = (article_dominant, story_dominant) {
            if a != s
                && !story_title.to_lowercase().contains(&a)
                && !article_title.to_lowercase().contains(&s)
            {
                return true;
            }
        }
    }
    false
}

fn dominant(entities: &[Entity], entity_type: EntityType) -> Option<String> {
    entities
        .iter()
        .find(|e| e.entity_type == entity_type)
        .map(|e| e.text.to_lowercase())
}
