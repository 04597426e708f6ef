use std::env;
use tracing::warn;

/// One entry in the polling roster. The slug keys articles and poll state;
/// the display name is what read-side clients show.
#[derive(Debug, Clone)]
pub struct FeedSpec {
    pub slug: String,
    pub display_name: String,
    pub url: String,
}

impl FeedSpec {
    pub fn new(slug: &str, display_name: &str, url: &str) -> Self {
        Self {
            slug: slug.to_string(),
            display_name: display_name.to_string(),
            url: url.to_string(),
        }
    }
}

/// The built-in roster. Overridable with `FEED_ROSTER`, a comma-separated
/// list of `slug=url` pairs; unknown slugs get a title-cased display name.
pub fn feed_roster() -> Vec<FeedSpec> {
    match env::var("FEED_ROSTER") {
        Ok(raw) => parse_roster(&raw),
        Err(_) => default_roster(),
    }
}

pub fn display_name_for(slug: &str) -> String {
    for spec in default_roster() {
        if spec.slug == slug {
            return spec.display_name;
        }
    }
    title_case(slug)
}

fn parse_roster(raw: &str) -> Vec<FeedSpec> {
    let mut roster = Vec::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((slug, url)) if !slug.is_empty() && !url.is_empty() => {
                roster.push(FeedSpec::new(slug.trim(), &display_name_for(slug.trim()), url.trim()));
            }
            _ => warn!("Ignoring malformed FEED_ROSTER entry {:?}", pair),
        }
    }
    if roster.is_empty() {
        warn!("FEED_ROSTER produced no feeds, falling back to built-in roster");
        return default_roster();
    }
    roster
}

fn default_roster() -> Vec<FeedSpec> {
    vec![
        FeedSpec::new("ap", "Associated Press", "https://feedx.net/rss/ap.xml"),
        FeedSpec::new("bbc", "BBC News", "https://feeds.bbci.co.uk/news/rss.xml"),
        FeedSpec::new(
            "bbc-world",
            "BBC World",
            "https://feeds.bbci.co.uk/news/world/rss.xml",
        ),
        FeedSpec::new("cnn", "CNN", "http://rss.cnn.com/rss/edition.rss"),
        FeedSpec::new("npr", "NPR", "https://feeds.npr.org/1001/rss.xml"),
        FeedSpec::new(
            "guardian",
            "The Guardian",
            "https://www.theguardian.com/world/rss",
        ),
        FeedSpec::new(
            "reuters",
            "Reuters",
            "https://www.reutersagency.com/feed/?best-topics=top-news",
        ),
        FeedSpec::new(
            "aljazeera",
            "Al Jazeera",
            "https://www.aljazeera.com/xml/rss/all.xml",
        ),
        FeedSpec::new(
            "nyt",
            "The New York Times",
            "https://rss.nytimes.com/services/xml/rss/nyt/HomePage.xml",
        ),
        FeedSpec::new(
            "washpost",
            "The Washington Post",
            "https://feeds.washingtonpost.com/rss/world",
        ),
        FeedSpec::new("sky", "Sky News", "https://feeds.skynews.com/feeds/rss/home.xml"),
        FeedSpec::new(
            "abc-au",
            "ABC News Australia",
            "https://www.abc.net.au/news/feed/51120/rss.xml",
        ),
        FeedSpec::new("dw", "Deutsche Welle", "https://rss.dw.com/rdf/rss-en-all"),
        FeedSpec::new(
            "france24",
            "France 24",
            "https://www.france24.com/en/rss",
        ),
        FeedSpec::new(
            "cbc",
            "CBC News",
            "https://www.cbc.ca/webfeed/rss/rss-topstories",
        ),
    ]
}

fn title_case(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|p| !p.is_empty())
        .map(|p| {
            let mut chars = p.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_roster_has_unique_slugs() {
        let roster = default_roster();
        let mut slugs: Vec<_> = roster.iter().map(|f| f.slug.as_str()).collect();
        slugs.sort_unstable();
        let before = slugs.len();
        slugs.dedup();
        assert_eq!(before, slugs.len());
    }

    #[test]
    fn parses_roster_pairs() {
        let roster = parse_roster("ap=https://a.example/rss, bbc=https://b.example/rss");
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].slug, "ap");
        assert_eq!(roster[0].display_name, "Associated Press");
        assert_eq!(roster[1].url, "https://b.example/rss");
    }

    #[test]
    fn unknown_slug_gets_title_cased_name() {
        assert_eq!(display_name_for("morning-brew"), "Morning Brew");
    }
}
