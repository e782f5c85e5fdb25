//! Heuristic enrichment of fetched entries.
//!
//! Everything here is a pure function of its inputs (the current time is
//! always passed in), so the same entry enriched twice at the same instant
//! yields the same item.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::fetcher::RawEntry;
use crate::sources::FeedSource;

const POSITIVE_WORDS: &[&str] = &[
    "growth", "profit", "profits", "gain", "gains", "rise", "rises", "bull", "bullish", "up",
    "surge", "surges", "boost", "positive", "strong", "high", "increase", "soar", "soars",
    "rally", "rallies",
];

const NEGATIVE_WORDS: &[&str] = &[
    "loss", "losses", "fall", "falls", "bear", "bearish", "down", "decline", "declines", "drop",
    "drops", "crash", "weak", "low", "decrease", "plunge", "plunges", "recession", "crisis",
];

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "is", "are", "was", "were", "will", "would", "could", "should", "may", "might", "can",
    "this", "that", "these", "those", "has", "have", "had", "from", "into", "after", "over",
    "said", "says", "their", "about", "than", "they", "what", "when", "which", "been", "more",
    "also", "its", "your", "here",
];

/// NIFTY 50 constituents.
const TRACKED_TERMS: &[&str] = &[
    "RELIANCE", "TCS", "HDFCBANK", "INFY", "HINDUNILVR", "ICICIBANK", "ITC", "KOTAKBANK",
    "HCLTECH", "SBIN", "BHARTIARTL", "LTIM", "BAJFINANCE", "ADANIENT", "ASIANPAINT",
    "HINDALCO", "TITAN", "NTPC", "POWERGRID", "ULTRACEMCO", "M&M", "SUNPHARMA", "TATAMOTORS",
    "NESTLEIND", "BAJAJ-AUTO", "ADANIPORTS", "ADANIPOWER", "TATASTEEL", "JSWSTEEL",
    "BAJAJFINSV", "TECHM", "WIPRO", "HDFCLIFE", "GRASIM", "DIVISLAB", "APOLLOHOSP",
    "EICHERMOT", "BRITANNIA", "COALINDIA", "UPL", "TATACONSUM", "CIPLA", "SBILIFE", "MARUTI",
    "HDFC", "AXISBANK", "ONGC", "INDUSINDBK", "DRREDDY",
];

const TRUSTED_SOURCES: &[&str] = &[
    "LM",
    "BS_MARKETS",
    "BS_NEWS",
    "BS_COMMODITIES",
    "BS_IPO",
    "BS_STOCK_MARKET",
    "BS_CRYPTO",
];

const WORDS_PER_MINUTE: usize = 200;
const DESCRIPTION_LIMIT: usize = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        };
        f.write_str(label)
    }
}

impl FromStr for Sentiment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positive" => Ok(Sentiment::Positive),
            "neutral" => Ok(Sentiment::Neutral),
            "negative" => Ok(Sentiment::Negative),
            other => Err(format!("unknown sentiment label: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriorityWeights {
    pub domain_tag: i32,
    pub positive: i32,
    pub negative: i32,
    pub within_1h: i32,
    pub within_6h: i32,
    pub within_24h: i32,
    pub trusted_source: i32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            domain_tag: 30,
            positive: 20,
            negative: 15,
            within_1h: 25,
            within_6h: 15,
            within_24h: 10,
            trusted_source: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub positive_words: Vec<String>,
    pub negative_words: Vec<String>,
    pub stopwords: Vec<String>,
    /// Scores beyond +/- this value are labelled positive/negative
    pub sentiment_threshold: f64,
    pub keyword_cap: usize,
    /// Matched case-insensitively, first match in list order wins
    pub tracked_terms: Vec<String>,
    pub trusted_sources: Vec<String>,
    pub weights: PriorityWeights,
}

fn owned(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            positive_words: owned(POSITIVE_WORDS),
            negative_words: owned(NEGATIVE_WORDS),
            stopwords: owned(STOPWORDS),
            sentiment_threshold: 0.1,
            keyword_cap: 5,
            tracked_terms: owned(TRACKED_TERMS),
            trusted_sources: owned(TRUSTED_SOURCES),
            weights: PriorityWeights::default(),
        }
    }
}

/// An enriched entry as held by the item store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub published_at: DateTime<Utc>,
    pub category: String,
    pub source_id: String,
    pub source_name: String,
    pub source_color: Option<String>,
    pub sentiment_score: f64,
    pub sentiment: Sentiment,
    pub keywords: Vec<String>,
    pub summary: String,
    pub domain_tag: Option<String>,
    pub priority: i32,
    pub reading_time: u32,
    pub age: String,
}

impl Item {
    pub fn has_domain_tag(&self) -> bool {
        self.domain_tag.is_some()
    }
}

pub struct Enricher {
    config: EnrichConfig,
    positive: HashSet<String>,
    negative: HashSet<String>,
    stopwords: HashSet<String>,
    tracked_upper: Vec<(String, String)>,
}

impl Enricher {
    pub fn new(config: EnrichConfig) -> Self {
        let lower = |words: &[String]| -> HashSet<String> {
            words.iter().map(|w| w.to_lowercase()).collect()
        };
        let tracked_upper = config
            .tracked_terms
            .iter()
            .map(|t| (t.to_uppercase(), t.clone()))
            .collect();

        Self {
            positive: lower(&config.positive_words),
            negative: lower(&config.negative_words),
            stopwords: lower(&config.stopwords),
            tracked_upper,
            config,
        }
    }

    pub fn enrich(&self, entry: &RawEntry, source: &FeedSource, now: DateTime<Utc>) -> Item {
        let plain_description = strip_markup(&entry.description);
        let full_text = format!("{} {}", entry.title, plain_description);

        let (sentiment_score, sentiment) = self.sentiment(&full_text);
        let domain_tag = self.domain_tag(&entry.title, &plain_description);
        let priority = self.priority(
            domain_tag.is_some(),
            sentiment_score,
            entry.published_at,
            &source.id,
            now,
        );

        let category = entry
            .category
            .clone()
            .or_else(|| source.category.clone())
            .unwrap_or_else(|| "General".to_string());

        Item {
            id: item_id(&entry.guid, &entry.link, &entry.title),
            title: entry.title.clone(),
            link: entry.link.clone(),
            description: clean_description(&entry.description),
            published_at: entry.published_at,
            category,
            source_id: source.id.clone(),
            source_name: source.name.clone(),
            source_color: source.color.clone(),
            sentiment_score,
            sentiment,
            keywords: self.keywords(&full_text),
            summary: summarize(&plain_description),
            domain_tag,
            priority,
            reading_time: reading_time(&full_text),
            age: time_ago(entry.published_at, now),
        }
    }

    /// Lexicon score: `(positive hits - negative hits) / word count`.
    pub fn sentiment(&self, text: &str) -> (f64, Sentiment) {
        let lowered = text.to_lowercase();
        let mut word_count = 0usize;
        let mut balance = 0i64;

        for word in lowered.split_whitespace() {
            word_count += 1;
            let token = word.trim_matches(|c: char| !c.is_alphabetic());
            if self.positive.contains(token) {
                balance += 1;
            } else if self.negative.contains(token) {
                balance -= 1;
            }
        }

        if word_count == 0 {
            return (0.0, Sentiment::Neutral);
        }

        let score = balance as f64 / word_count as f64;
        let threshold = self.config.sentiment_threshold;
        let label = if score > threshold {
            Sentiment::Positive
        } else if score < -threshold {
            Sentiment::Negative
        } else {
            Sentiment::Neutral
        };
        (score, label)
    }

    /// First alphabetic non-stopword tokens longer than three characters, repeats kept.
    pub fn keywords(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let mut keywords: Vec<String> = Vec::new();

        for word in lowered.split_whitespace() {
            if keywords.len() >= self.config.keyword_cap {
                break;
            }
            let token = word.trim_matches(|c: char| !c.is_alphabetic());
            if token.chars().count() <= 3
                || !token.chars().all(char::is_alphabetic)
                || self.stopwords.contains(token)
            {
                continue;
            }
            keywords.push(token.to_string());
        }

        keywords
    }

    /// First tracked term found in the title, else the first found in the description.
    pub fn domain_tag(&self, title: &str, description: &str) -> Option<String> {
        self.find_term(title).or_else(|| self.find_term(description))
    }

    fn find_term(&self, text: &str) -> Option<String> {
        let upper = text.to_uppercase();
        self.tracked_upper
            .iter()
            .find(|(needle, _)| upper.contains(needle.as_str()))
            .map(|(_, term)| term.clone())
    }

    pub fn priority(
        &self,
        has_domain_tag: bool,
        sentiment_score: f64,
        published_at: DateTime<Utc>,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> i32 {
        let w = &self.config.weights;
        let threshold = self.config.sentiment_threshold;
        let mut priority = 0;

        if has_domain_tag {
            priority += w.domain_tag;
        }

        if sentiment_score > threshold {
            priority += w.positive;
        } else if sentiment_score < -threshold {
            priority += w.negative;
        }

        let age = now - published_at;
        if age < Duration::hours(1) {
            priority += w.within_1h;
        } else if age < Duration::hours(6) {
            priority += w.within_6h;
        } else if age < Duration::hours(24) {
            priority += w.within_24h;
        }

        if self.config.trusted_sources.iter().any(|s| s == source_id) {
            priority += w.trusted_source;
        }

        priority
    }
}

/// Stable identity from the first non-empty of link, guid and title.
pub fn item_id(guid: &str, link: &str, title: &str) -> String {
    let basis = [link, guid, title]
        .into_iter()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or_default();

    let digest = format!("{:x}", Sha256::digest(basis.as_bytes()));
    digest[..16].to_string()
}

/// First sentence when the text has more than two, otherwise the whole text.
pub fn summarize(description: &str) -> String {
    let sentences: Vec<&str> = description.split('.').collect();
    if sentences.len() > 2 {
        format!("{}.", sentences[0].trim())
    } else {
        description.to_string()
    }
}

/// Remove CDATA markers and markup tags, then collapse whitespace.
pub fn strip_markup(text: &str) -> String {
    let text = text.replace("<![CDATA[", "").replace("]]>", "");

    let mut plain = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                plain.push(' ');
            }
            _ if !in_tag => plain.push(c),
            _ => {}
        }
    }

    plain.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cleaned description capped at `limit` characters.
pub fn clean_description(description: &str) -> String {
    truncate(&strip_markup(description), DESCRIPTION_LIMIT)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{}...", cut.trim_end())
}

pub fn reading_time(text: &str) -> u32 {
    let words = text.split_whitespace().count();
    words.div_ceil(WORDS_PER_MINUTE) as u32
}

pub fn time_ago(published_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now - published_at;
    if elapsed < Duration::minutes(1) {
        "Just now".to_string()
    } else if elapsed < Duration::hours(1) {
        format!("{}m ago", elapsed.num_minutes())
    } else if elapsed < Duration::hours(24) {
        format!("{}h ago", elapsed.num_hours())
    } else {
        format!("{}d ago", elapsed.num_days())
    }
}
