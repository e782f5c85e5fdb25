use std::collections::{BTreeMap, HashMap};

use chrono::FixedOffset;
use serde::Serialize;

use crate::enrich::{Item, Sentiment};

const TOP_KEYWORDS: usize = 10;
const TRENDING_TOPICS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordCount {
    pub keyword: String,
    pub count: usize,
}

/// Share of items per sentiment label, in percent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentimentDistribution {
    pub positive: f64,
    pub neutral: f64,
    pub negative: f64,
    pub overall: Sentiment,
}

impl Default for SentimentDistribution {
    fn default() -> Self {
        Self {
            positive: 0.0,
            neutral: 0.0,
            negative: 0.0,
            overall: Sentiment::Neutral,
        }
    }
}

/// Figures derived from the full item set of one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Analytics {
    pub total_items: usize,
    pub source_counts: BTreeMap<String, usize>,
    pub category_counts: BTreeMap<String, usize>,
    /// Keyed by two-digit hour of publication in the display offset
    pub hourly_counts: BTreeMap<String, usize>,
    pub mean_sentiment: f64,
    pub top_keywords: Vec<KeywordCount>,
    pub trending_topics: Vec<String>,
    pub domain_tag_mentions: usize,
    /// Heuristic in [0, 1]; not statistically validated
    pub source_reliability: BTreeMap<String, f64>,
    pub sentiment: SentimentDistribution,
}

pub fn compute(items: &[Item], display_offset: FixedOffset) -> Analytics {
    let mut analytics = Analytics {
        total_items: items.len(),
        ..Analytics::default()
    };

    let mut keyword_counts: HashMap<&str, usize> = HashMap::new();
    let mut reliability_sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    let mut total_sentiment = 0.0;

    for item in items {
        *analytics
            .source_counts
            .entry(item.source_id.clone())
            .or_default() += 1;

        *analytics
            .category_counts
            .entry(item.category.clone())
            .or_default() += 1;

        let hour = item
            .published_at
            .with_timezone(&display_offset)
            .format("%H")
            .to_string();
        *analytics.hourly_counts.entry(hour).or_default() += 1;

        for keyword in &item.keywords {
            *keyword_counts.entry(keyword.as_str()).or_default() += 1;
        }

        total_sentiment += item.sentiment_score;

        if item.has_domain_tag() {
            analytics.domain_tag_mentions += 1;
        }

        let reliability = (0.5 + item.sentiment_score * 0.2 + item.keywords.len() as f64 * 0.1)
            .clamp(0.0, 1.0);
        let entry = reliability_sums
            .entry(item.source_id.clone())
            .or_insert((0.0, 0));
        entry.0 += reliability;
        entry.1 += 1;
    }

    if !items.is_empty() {
        analytics.mean_sentiment = total_sentiment / items.len() as f64;
    }

    analytics.source_reliability = reliability_sums
        .into_iter()
        .map(|(source, (sum, n))| (source, sum / n as f64))
        .collect();

    let mut ranked: Vec<(&str, usize)> = keyword_counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    analytics.top_keywords = ranked
        .into_iter()
        .take(TOP_KEYWORDS)
        .map(|(keyword, count)| KeywordCount {
            keyword: keyword.to_string(),
            count,
        })
        .collect();

    analytics.trending_topics = analytics
        .top_keywords
        .iter()
        .take(TRENDING_TOPICS)
        .map(|k| k.keyword.clone())
        .collect();

    analytics.sentiment = sentiment_distribution(items);
    analytics
}

pub fn sentiment_distribution(items: &[Item]) -> SentimentDistribution {
    if items.is_empty() {
        return SentimentDistribution::default();
    }

    let count = |label: Sentiment| items.iter().filter(|i| i.sentiment == label).count();
    let (positive, neutral, negative) = (
        count(Sentiment::Positive),
        count(Sentiment::Neutral),
        count(Sentiment::Negative),
    );

    let overall = if positive > negative && positive > neutral {
        Sentiment::Positive
    } else if negative > positive && negative > neutral {
        Sentiment::Negative
    } else {
        Sentiment::Neutral
    };

    let total = items.len() as f64;
    SentimentDistribution {
        positive: positive as f64 / total * 100.0,
        neutral: neutral as f64 / total * 100.0,
        negative: negative as f64 / total * 100.0,
        overall,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn item(source: &str, category: &str, score: f64, keywords: &[&str], at: &str) -> Item {
        let sentiment = if score > 0.1 {
            Sentiment::Positive
        } else if score < -0.1 {
            Sentiment::Negative
        } else {
            Sentiment::Neutral
        };
        Item {
            id: format!("{}-{}", source, at),
            title: "t".to_string(),
            link: "https://example.com".to_string(),
            description: String::new(),
            published_at: DateTime::parse_from_rfc3339(at).unwrap().with_timezone(&Utc),
            category: category.to_string(),
            source_id: source.to_string(),
            source_name: source.to_string(),
            source_color: None,
            sentiment_score: score,
            sentiment,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            summary: String::new(),
            domain_tag: None,
            priority: 0,
            reading_time: 1,
            age: String::new(),
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn test_empty_items() {
        let analytics = compute(&[], utc());
        assert_eq!(analytics.total_items, 0);
        assert_eq!(analytics.mean_sentiment, 0.0);
        assert!(analytics.top_keywords.is_empty());
        assert_eq!(analytics.sentiment.overall, Sentiment::Neutral);
    }

    #[test]
    fn test_counts_per_source_category_and_hour() {
        let items = vec![
            item("LM", "Markets", 0.0, &[], "2024-12-09T10:15:00Z"),
            item("LM", "Markets", 0.0, &[], "2024-12-09T10:45:00Z"),
            item("ZP", "General", 0.0, &[], "2024-12-09T23:30:00Z"),
        ];

        let analytics = compute(&items, utc());
        assert_eq!(analytics.total_items, 3);
        assert_eq!(analytics.source_counts["LM"], 2);
        assert_eq!(analytics.source_counts["ZP"], 1);
        assert_eq!(analytics.category_counts["Markets"], 2);
        assert_eq!(analytics.hourly_counts["10"], 2);
        assert_eq!(analytics.hourly_counts["23"], 1);
    }

    #[test]
    fn test_hours_follow_display_offset() {
        let items = vec![item("LM", "Markets", 0.0, &[], "2024-12-09T23:30:00Z")];
        let ist = FixedOffset::east_opt(330 * 60).unwrap();
        let analytics = compute(&items, ist);
        assert_eq!(analytics.hourly_counts["05"], 1);
    }

    #[test]
    fn test_keyword_ranking_and_trending() {
        let items = vec![
            item("A", "G", 0.0, &["nifty", "rupee", "banks"], "2024-12-09T10:00:00Z"),
            item("A", "G", 0.0, &["nifty", "banks"], "2024-12-09T10:00:00Z"),
            item("B", "G", 0.0, &["nifty", "crude"], "2024-12-09T10:00:00Z"),
        ];

        let analytics = compute(&items, utc());
        assert_eq!(
            analytics.top_keywords[0],
            KeywordCount {
                keyword: "nifty".to_string(),
                count: 3
            }
        );
        assert_eq!(analytics.top_keywords[1].keyword, "banks");
        // ties broken alphabetically
        assert_eq!(analytics.top_keywords[2].keyword, "crude");
        assert_eq!(analytics.top_keywords[3].keyword, "rupee");
        assert_eq!(analytics.trending_topics, vec!["nifty", "banks", "crude", "rupee"]);
    }

    #[test]
    fn test_mean_sentiment_and_distribution() {
        let items = vec![
            item("A", "G", 0.5, &[], "2024-12-09T10:00:00Z"),
            item("A", "G", 0.3, &[], "2024-12-09T10:00:00Z"),
            item("A", "G", -0.2, &[], "2024-12-09T10:00:00Z"),
            item("A", "G", 0.0, &[], "2024-12-09T10:00:00Z"),
        ];

        let analytics = compute(&items, utc());
        assert!((analytics.mean_sentiment - 0.15).abs() < 1e-9);
        assert_eq!(analytics.sentiment.positive, 50.0);
        assert_eq!(analytics.sentiment.negative, 25.0);
        assert_eq!(analytics.sentiment.neutral, 25.0);
        assert_eq!(analytics.sentiment.overall, Sentiment::Positive);
    }

    #[test]
    fn test_overall_is_neutral_on_tie() {
        let items = vec![
            item("A", "G", 0.5, &[], "2024-12-09T10:00:00Z"),
            item("A", "G", -0.5, &[], "2024-12-09T10:00:00Z"),
        ];
        assert_eq!(sentiment_distribution(&items).overall, Sentiment::Neutral);
    }

    #[test]
    fn test_reliability_is_mean_and_clamped() {
        let items = vec![
            item("A", "G", 0.0, &["one", "two", "three", "four", "five", "six"], "2024-12-09T10:00:00Z"),
            item("A", "G", 0.0, &[], "2024-12-09T10:00:00Z"),
            item("B", "G", -5.0, &[], "2024-12-09T10:00:00Z"),
        ];

        let analytics = compute(&items, utc());
        assert!((analytics.source_reliability["A"] - 0.75).abs() < 1e-9);
        assert_eq!(analytics.source_reliability["B"], 0.0);
    }

    #[test]
    fn test_domain_tag_mentions() {
        let mut tagged = item("A", "G", 0.0, &[], "2024-12-09T10:00:00Z");
        tagged.domain_tag = Some("INFY".to_string());
        let items = vec![tagged, item("A", "G", 0.0, &[], "2024-12-09T10:00:00Z")];
        assert_eq!(compute(&items, utc()).domain_tag_mentions, 1);
    }
}
