use crate::types::Category;
use regex::Regex;

/// Deterministic article id: `<source_slug>_<md5(url)[:12]>`. No timestamp,
/// so re-ingesting the same URL always lands on the same record.
pub fn article_id(source: &str, url: &str) -> String {
    let digest = format!("{:x}", md5::compute(url.as_bytes()));
    format!("{}_{}", source, &digest[..12])
}

/// Cleans publisher text and applies the category / spam heuristics.
/// Holds its compiled regexes, so build one and reuse it.
pub struct Normalizer {
    tag_re: Regex,
    whitespace_re: Regex,
    spam_url_patterns: Vec<&'static str>,
    spam_domains: Vec<&'static str>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            tag_re: Regex::new(r"<[^>]*>").expect("static regex"),
            whitespace_re: Regex::new(r"\s+").expect("static regex"),
            spam_url_patterns: vec![
                "/good-food/",
                "/restaurants/",
                "/recipes/",
                "/coupons/",
                "/horoscope",
            ],
            spam_domains: vec![
                "prnewswire.com",
                "globenewswire.com",
                "streetinsider.com",
            ],
        }
    }

    /// Strip tags, decode the common HTML entities, collapse whitespace.
    pub fn strip_html(&self, text: &str) -> String {
        let stripped = self.tag_re.replace_all(text, " ");
        let decoded = decode_entities(&stripped);
        self.whitespace_re.replace_all(decoded.trim(), " ").to_string()
    }

    /// Returns the rejection reason for entries that should not be ingested:
    /// short titles and restaurant-listing/low-signal URLs.
    pub fn rejection_reason(&self, title: &str, url: &str) -> Option<&'static str> {
        if title.chars().count() < 10 {
            return Some("title too short");
        }
        let url_lower = url.to_lowercase();
        if self.spam_url_patterns.iter().any(|p| url_lower.contains(p)) {
            return Some("spam url pattern");
        }
        if self.spam_domains.iter().any(|d| url_lower.contains(d)) {
            return Some("low-signal domain");
        }
        None
    }

    /// Keyword-set scoring over title+description+url. Highest score wins;
    /// no signal at all lands in `other`.
    pub fn categorize(&self, title: &str, description: &str, url: &str) -> Category {
        let text = format!("{} {}", title, description).to_lowercase();
        let url_lower = url.to_lowercase();

        let mut best = (Category::Other, 0usize);
        for (category, keywords, url_hints) in category_rules() {
            let mut score = keywords.iter().filter(|k| text.contains(*k)).count();
            score += url_hints.iter().filter(|h| url_lower.contains(*h)).count() * 2;
            if score > best.1 {
                best = (category, score);
            }
        }
        best.0
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn category_rules() -> Vec<(Category, &'static [&'static str], &'static [&'static str])> {
    vec![
        (
            Category::Politics,
            &[
                "election", "senate", "congress", "parliament", "president", "minister",
                "governor", "campaign", "legislation", "policy", "vote", "ballot",
                "democrat", "republican", "coalition",
            ][..],
            &["/politics/", "/election"][..],
        ),
        (
            Category::World,
            &[
                "war", "ceasefire", "troops", "diplomat", "embassy", "refugee",
                "sanctions", "treaty", "border", "united nations", "airstrike", "summit",
            ][..],
            &["/world/", "/international/"][..],
        ),
        (
            Category::Business,
            &[
                "market", "stocks", "economy", "earnings", "inflation", "revenue",
                "investor", "merger", "shares", "bank", "trade deal", "ipo",
            ][..],
            &["/business/", "/money/", "/economy/"][..],
        ),
        (
            Category::Tech,
            &[
                "software", "startup", "artificial intelligence", "chip", "cyber",
                "smartphone", "app ", "silicon valley", "social media", "robot",
                "data breach", "semiconductor",
            ][..],
            &["/tech", "/technology/"][..],
        ),
        (
            Category::Sports,
            &[
                "league", "tournament", "championship", "coach", "stadium", "olympic",
                "playoff", "world cup", "goal", "quarterback", "grand slam", "medal",
            ][..],
            &["/sport", "/sports/"][..],
        ),
        (
            Category::Health,
            &[
                "hospital", "vaccine", "virus", "disease", "cancer", "outbreak",
                "patients", "mental health", "drug", "epidemic", "fda", "clinical",
            ][..],
            &["/health/", "/medicine/"][..],
        ),
        (
            Category::Entertainment,
            &[
                "film", "movie", "album", "celebrity", "festival", "box office",
                "premiere", "concert", "actor", "actress", "grammy", "oscar",
            ][..],
            &["/entertainment/", "/culture/", "/arts/"][..],
        ),
        (
            Category::Science,
            &[
                "research", "study finds", "scientists", "climate", "spacecraft",
                "nasa", "telescope", "species", "fossil", "physics", "genome",
                "asteroid",
            ][..],
            &["/science/", "/space/", "/environment/"][..],
        ),
    ]
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&rsquo;", "'")
        .replace("&lsquo;", "'")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&mdash;", "-")
        .replace("&ndash;", "-")
        .replace("&hellip;", "...")
}
