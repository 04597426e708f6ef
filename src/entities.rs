use crate::types::{Entity, EntityType};
use regex::Regex;
use std::collections::HashSet;

const MAX_ENTITIES: usize = 20;

/// Rule-based named-entity extraction: capitalized n-grams filtered against a
/// stopword list, classified by keyword maps. Deterministic, no external
/// calls, cheap enough to run on every ingested entry.
pub struct EntityExtractor {
    honorific_re: Regex,
    stopwords: HashSet<&'static str>,
    locations: HashSet<&'static str>,
    known_orgs: HashSet<&'static str>,
    org_markers: HashSet<&'static str>,
    event_markers: HashSet<&'static str>,
}

impl EntityExtractor {
    pub fn new() -> Self {
        let honorific_re = Regex::new(
            r"\b(?:President|Vice President|Prime Minister|Chancellor|Senator|Governor|Minister|Secretary|General|Justice|Mayor|King|Queen|Pope|Dr\.|Mr\.|Ms\.|Mrs\.)\s+([A-Z][A-Za-z'\-]+(?:\s+[A-Z][A-Za-z'\-]+)?)",
        )
        .expect("static regex");

        Self {
            honorific_re,
            stopwords: STOPWORDS.iter().copied().collect(),
            locations: LOCATIONS.iter().copied().collect(),
            known_orgs: KNOWN_ORGS.iter().copied().collect(),
            org_markers: ORG_MARKERS.iter().copied().collect(),
            event_markers: EVENT_MARKERS.iter().copied().collect(),
        }
    }

    /// Extract entities from free text (typically title + description).
    /// Results are deduplicated case-insensitively, first occurrence wins.
    pub fn extract(&self, text: &str) -> Vec<Entity> {
        let mut entities: Vec<Entity> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        // Honorific-introduced people first: "President Jane Doe".
        let mut person_names: HashSet<String> = HashSet::new();
        for caps in self.honorific_re.captures_iter(text) {
            let name = caps[1].trim().to_string();
            person_names.insert(name.to_lowercase());
            push_unique(&mut entities, &mut seen, name, EntityType::Person);
        }

        for phrase in self.capitalized_ngrams(text) {
            let entity_type = self.classify(&phrase, &person_names);
            push_unique(&mut entities, &mut seen, phrase, entity_type);
            if entities.len() >= MAX_ENTITIES {
                break;
            }
        }

        entities.truncate(MAX_ENTITIES);
        entities
    }

    /// Runs of consecutive capitalized words, broken on stopwords and
    /// punctuation, up to three words per phrase.
    fn capitalized_ngrams(&self, text: &str) -> Vec<String> {
        let mut phrases = Vec::new();
        let mut run: Vec<&str> = Vec::new();

        for raw in text.split_whitespace() {
            let word = raw.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'' && c != '-');
            let capitalized = word
                .chars()
                .next()
                .map(|c| c.is_uppercase())
                .unwrap_or(false);
            let is_stopword = self.stopwords.contains(word.to_lowercase().as_str());
            let breaks_run =
                raw.ends_with(|c: char| matches!(c, ',' | '.' | ':' | ';' | '!' | '?'));

            if capitalized && !is_stopword && word.len() > 1 {
                run.push(word);
                if run.len() == 3 || breaks_run {
                    phrases.push(run.join(" "));
                    run.clear();
                }
            } else {
                if !run.is_empty() {
                    phrases.push(run.join(" "));
                    run.clear();
                }
            }
        }
        if !run.is_empty() {
            phrases.push(run.join(" "));
        }
        phrases
    }

    fn classify(&self, phrase: &str, person_names: &HashSet<String>) -> EntityType {
        let lower = phrase.to_lowercase();
        if person_names.contains(&lower)
            || person_names.iter().any(|name| name.ends_with(&lower))
        {
            return EntityType::Person;
        }
        if self.locations.contains(lower.as_str())
            || lower
                .split_whitespace()
                .any(|w| self.locations.contains(w))
        {
            return EntityType::Location;
        }
        if self.known_orgs.contains(lower.as_str())
            || lower
                .split_whitespace()
                .any(|w| self.org_markers.contains(w))
        {
            return EntityType::Org;
        }
        if lower
            .split_whitespace()
            .last()
            .map(|w| self.event_markers.contains(w))
            .unwrap_or(false)
        {
            return EntityType::Event;
        }
        EntityType::Other
    }
}

impl Default for EntityExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn push_unique(
    entities: &mut Vec<Entity>,
    seen: &mut HashSet<String>,
    text: String,
    entity_type: EntityType,
) {
    if seen.insert(text.to_lowercase()) {
        entities.push(Entity { text, entity_type });
    }
}

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "is", "are", "was", "were", "be", "been", "has", "have", "had", "will", "would", "could",
    "should", "this", "that", "these", "those", "it", "its", "as", "after", "before", "over",
    "under", "amid", "into", "from", "about", "against", "between", "during", "how", "why",
    "what", "when", "where", "who", "which", "while", "breaking", "live", "update", "updates",
    "exclusive", "watch", "opinion", "analysis",
];

const LOCATIONS: &[&str] = &[
    "ukraine", "russia", "gaza", "israel", "china", "taiwan", "iran", "iraq", "syria",
    "afghanistan", "india", "pakistan", "france", "germany", "britain", "uk", "england",
    "scotland", "wales", "ireland", "london", "paris", "berlin", "moscow", "kyiv",
    "washington", "beijing", "tokyo", "japan", "korea", "north korea", "south korea",
    "brazil", "mexico", "canada", "australia", "egypt", "turkey", "lebanon", "yemen",
    "sudan", "ethiopia", "nigeria", "kenya", "united states", "america", "europe",
    "new york", "california", "texas", "florida", "jerusalem", "tel aviv", "rafah",
    "gaza city", "donetsk", "crimea", "poland", "hungary", "spain", "italy", "greece",
    "netherlands", "sweden", "norway", "finland", "switzerland", "austria", "belgium",
    "venezuela", "argentina", "colombia", "chile", "cuba", "haiti", "indonesia",
    "philippines", "vietnam", "thailand", "myanmar", "bangladesh", "saudi arabia",
    "qatar", "dubai", "libya", "morocco", "algeria", "tunisia", "somalia", "congo",
];

const KNOWN_ORGS: &[&str] = &[
    "united nations", "nato", "european union", "white house", "pentagon", "kremlin",
    "congress", "senate", "parliament", "supreme court", "federal reserve", "world bank",
    "red cross", "fbi", "cia", "nasa", "who", "imf", "opec", "interpol", "hamas",
    "hezbollah", "taliban", "security council", "google",
    "apple", "microsoft", "amazon", "meta", "tesla", "boeing", "openai", "pfizer",
];

const ORG_MARKERS: &[&str] = &[
    "inc", "corp", "ltd", "company", "ministry", "department", "university", "agency",
    "commission", "committee", "council", "bank", "police", "party", "court", "union",
    "airlines", "motors", "group", "institute", "association", "authority",
];

const EVENT_MARKERS: &[&str] = &[
    "cup", "olympics", "games", "summit", "festival", "election", "open",
    "championship", "conference", "awards",
];
