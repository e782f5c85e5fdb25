use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use feed_rs::parser;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::Settings;
use crate::sources::FeedSource;

const FEED_ACCEPT: &str = "application/rss+xml, application/atom+xml, application/xml, text/xml";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status code: {0}")]
    Status(StatusCode),
    #[error("unparsable feed document: {0}")]
    Parse(#[from] parser::ParseFeedError),
}

/// One feed entry as the source published it, before enrichment.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub guid: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub category: Option<String>,
    /// Timestamp text exactly as it appeared in the document, when present
    pub published_raw: Option<String>,
    pub published_at: DateTime<Utc>,
    /// True when no layout matched and `published_at` is the fetch time
    pub published_fallback: bool,
}

/// Timestamp layouts seen across providers, tried in order.
#[derive(Debug, Clone, Copy)]
enum Layout {
    Rfc2822,
    Rfc3339,
    /// A layout with no zone; read in the fallback offset
    Naive(&'static str),
}

const LAYOUTS: &[Layout] = &[
    Layout::Rfc2822,
    Layout::Rfc3339,
    Layout::Naive("%d-%b-%Y %H:%M:%S"),
    Layout::Naive("%d-%b-%Y %H:%M"),
    Layout::Naive("%Y-%m-%d %H:%M:%S"),
    Layout::Naive("%Y-%m-%dT%H:%M:%S"),
    Layout::Naive("%a, %d %b %Y %H:%M:%S"),
];

// Zone names that chrono's RFC 2822 parser doesn't know, in minutes east of UTC.
const ZONE_NAMES: &[(&str, i32)] = &[("IST", 330), ("UTC", 0), ("GMT", 0), ("UT", 0)];

pub struct Fetcher {
    client: Client,
    max_items: usize,
    fallback_offset: FixedOffset,
}

impl Fetcher {
    pub fn new(settings: &Settings) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(settings.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            max_items: settings.max_items_per_source,
            fallback_offset: settings.display_offset,
        })
    }

    pub async fn fetch(&self, source: &FeedSource) -> Result<Vec<RawEntry>, FetchError> {
        info!("Fetching feed: {} ({})", source.name, source.url);

        let response = self
            .client
            .get(&source.url)
            .header(ACCEPT, FEED_ACCEPT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let bytes = response.bytes().await?;
        let entries = self.parse_entries(&bytes, Utc::now())?;

        info!("Parsed {} entries from feed '{}'", entries.len(), source.id);
        Ok(entries)
    }

    /// Parse a feed document into at most `max_items` entries, in document order.
    pub fn parse_entries(&self, bytes: &[u8], now: DateTime<Utc>) -> Result<Vec<RawEntry>, FetchError> {
        // feed_rs drops pubDate text it can't parse, so keep the raw strings too
        let raw_dates = Self::extract_dates_from_xml(bytes);

        let parsed = parser::parse(bytes)?;

        let mut entries = Vec::new();
        for entry in parsed.entries {
            if entries.len() >= self.max_items {
                debug!("Reached per-source limit of {} entries", self.max_items);
                break;
            }

            let title = entry
                .title
                .as_ref()
                .map(|t| t.content.trim().to_string())
                .unwrap_or_default();

            if title.is_empty() {
                continue;
            }

            let link = entry
                .links
                .first()
                .map(|l| l.href.trim().to_string())
                .unwrap_or_default();

            if link.is_empty() {
                warn!("Skipping entry with no link: {}", title);
                continue;
            }

            let description = entry
                .summary
                .as_ref()
                .map(|t| t.content.clone())
                .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
                .unwrap_or_default();

            let category = entry
                .categories
                .first()
                .map(|c| c.term.trim().to_string())
                .filter(|c| !c.is_empty());

            let published_raw = raw_dates.get(&link).cloned();
            let parsed_by_feed = entry.published.or(entry.updated);
            let (published_at, published_fallback) = normalize_published(
                published_raw.as_deref(),
                parsed_by_feed,
                self.fallback_offset,
                now,
            );

            if published_fallback {
                warn!(
                    "Could not parse publish time {:?} for '{}', using fetch time",
                    published_raw, link
                );
            }

            entries.push(RawEntry {
                guid: entry.id,
                title,
                link,
                description: description.trim().to_string(),
                category,
                published_raw,
                published_at,
                published_fallback,
            });
        }

        Ok(entries)
    }

    /// Collect `<pubDate>` text per `<link>` from raw RSS, keyed by link.
    pub fn extract_dates_from_xml(xml_bytes: &[u8]) -> HashMap<String, String> {
        let mut dates = HashMap::new();
        let xml_str = match std::str::from_utf8(xml_bytes) {
            Ok(s) => s,
            Err(_) => return dates,
        };

        for item_block in xml_str.split("<item>").skip(1) {
            let item_end = item_block.find("</item>").unwrap_or(item_block.len());
            let item = &item_block[..item_end];

            let link = Self::extract_xml_element(item, "link");
            let published = Self::extract_xml_element(item, "pubDate");

            if let (Some(link), Some(published)) = (link, published) {
                if !published.is_empty() {
                    dates.insert(link, published);
                }
            }
        }

        dates
    }

    pub fn extract_xml_element(xml: &str, tag: &str) -> Option<String> {
        let start_tag = format!("<{}>", tag);
        let end_tag = format!("</{}>", tag);

        let start = xml.find(&start_tag)? + start_tag.len();
        let end = xml[start..].find(&end_tag)? + start;

        let value = xml[start..end].trim();
        let value = value
            .strip_prefix("<![CDATA[")
            .and_then(|v| v.strip_suffix("]]>"))
            .unwrap_or(value);

        Some(value.trim().to_string())
    }
}

/// Resolve an entry's publish time: the raw text against the known layouts,
/// then whatever the feed parser understood, then `now`. The flag reports
/// whether the final fallback was used.
pub fn normalize_published(
    raw: Option<&str>,
    parsed_by_feed: Option<DateTime<Utc>>,
    fallback_offset: FixedOffset,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, bool) {
    if let Some(at) = raw.and_then(|r| parse_timestamp(r, fallback_offset)) {
        return (at, false);
    }
    match parsed_by_feed {
        Some(at) => (at, false),
        None => (now, true),
    }
}

pub fn parse_timestamp(raw: &str, fallback_offset: FixedOffset) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("0000-00-00") {
        return None;
    }

    // chrono reads unknown RFC 2822 zone names as UTC, so resolve names first
    if let Some((rest, offset)) = split_zone_name(raw) {
        if let Some(at) = parse_with_layouts(rest, offset) {
            return Some(at);
        }
    }

    parse_with_layouts(raw, fallback_offset)
}

/// "02-Jan-2006 15:04:05 IST" -> ("02-Jan-2006 15:04:05", +05:30)
fn split_zone_name(raw: &str) -> Option<(&str, FixedOffset)> {
    let (rest, zone) = raw.rsplit_once(' ')?;
    let minutes = ZONE_NAMES
        .iter()
        .find(|(name, _)| zone.eq_ignore_ascii_case(name))
        .map(|(_, minutes)| *minutes)?;
    Some((rest.trim(), FixedOffset::east_opt(minutes * 60)?))
}

fn parse_with_layouts(raw: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    LAYOUTS.iter().find_map(|layout| match layout {
        Layout::Rfc2822 => DateTime::parse_from_rfc2822(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Layout::Rfc3339 => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Layout::Naive(format) => NaiveDateTime::parse_from_str(raw, format)
            .ok()
            .and_then(|naive| offset.from_local_datetime(&naive).single())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(330 * 60).unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn test_fetcher(max_items: usize) -> Fetcher {
        let settings = Settings {
            max_items_per_source: max_items,
            ..Settings::default()
        };
        Fetcher::new(&settings).unwrap()
    }

    mod parse_timestamp_tests {
        use super::*;

        #[test]
        fn test_rfc2822_with_numeric_offset() {
            let at = parse_timestamp("Mon, 09 Dec 2024 12:00:00 +0530", ist()).unwrap();
            assert_eq!(at, utc("2024-12-09T06:30:00Z"));
        }

        #[test]
        fn test_rfc2822_with_gmt() {
            let at = parse_timestamp("Mon, 9 Dec 2024 12:00:00 GMT", ist()).unwrap();
            assert_eq!(at, utc("2024-12-09T12:00:00Z"));
        }

        #[test]
        fn test_rfc3339() {
            let at = parse_timestamp("2024-12-09T12:00:00-05:00", ist()).unwrap();
            assert_eq!(at, utc("2024-12-09T17:00:00Z"));
        }

        #[test]
        fn test_business_standard_layout_uses_fallback_zone() {
            let at = parse_timestamp("09-Dec-2024 12:00:00", ist()).unwrap();
            assert_eq!(at, utc("2024-12-09T06:30:00Z"));
        }

        #[test]
        fn test_layout_without_seconds() {
            let at = parse_timestamp("09-Dec-2024 12:00", ist()).unwrap();
            assert_eq!(at, utc("2024-12-09T06:30:00Z"));
        }

        #[test]
        fn test_named_zone_after_naive_layout() {
            let at = parse_timestamp("09-Dec-2024 12:00:00 IST", FixedOffset::east_opt(0).unwrap())
                .unwrap();
            assert_eq!(at, utc("2024-12-09T06:30:00Z"));
        }

        #[test]
        fn test_named_zone_after_rfc2822_date() {
            let at = parse_timestamp("Mon, 09 Dec 2024 12:00:00 IST", FixedOffset::east_opt(0).unwrap())
                .unwrap();
            assert_eq!(at, utc("2024-12-09T06:30:00Z"));
        }

        #[test]
        fn test_sql_style_layout() {
            let at = parse_timestamp("2024-12-09 12:00:00", FixedOffset::east_opt(0).unwrap())
                .unwrap();
            assert_eq!(at, utc("2024-12-09T12:00:00Z"));
        }

        #[test]
        fn test_garbage_and_empty_fail() {
            assert!(parse_timestamp("yesterday-ish", ist()).is_none());
            assert!(parse_timestamp("", ist()).is_none());
            assert!(parse_timestamp("0000-00-00 00:00:00", ist()).is_none());
            assert!(parse_timestamp("09-Dec-2024 12:00:00 XYZ", ist()).is_none());
        }
    }

    mod normalize_published_tests {
        use super::*;

        #[test]
        fn test_raw_text_wins() {
            let now = utc("2024-12-10T00:00:00Z");
            let feed = Some(utc("2024-01-01T00:00:00Z"));
            let (at, fallback) =
                normalize_published(Some("Mon, 09 Dec 2024 12:00:00 GMT"), feed, ist(), now);
            assert_eq!(at, utc("2024-12-09T12:00:00Z"));
            assert!(!fallback);
        }

        #[test]
        fn test_feed_parser_value_used_when_raw_unparsable() {
            let now = utc("2024-12-10T00:00:00Z");
            let feed = Some(utc("2024-12-09T08:00:00Z"));
            let (at, fallback) = normalize_published(Some("garbled"), feed, ist(), now);
            assert_eq!(at, utc("2024-12-09T08:00:00Z"));
            assert!(!fallback);
        }

        #[test]
        fn test_falls_back_to_now_and_flags_it() {
            let now = utc("2024-12-10T00:00:00Z");
            let (at, fallback) = normalize_published(Some("garbled"), None, ist(), now);
            assert_eq!(at, now);
            assert!(fallback);

            let (at, fallback) = normalize_published(None, None, ist(), now);
            assert_eq!(at, now);
            assert!(fallback);
        }
    }

    mod extract_tests {
        use super::*;

        #[test]
        fn test_extract_cdata_element() {
            let xml = "<pubDate><![CDATA[09-Dec-2024 12:00:00]]></pubDate>";
            let result = Fetcher::extract_xml_element(xml, "pubDate");
            assert_eq!(result, Some("09-Dec-2024 12:00:00".to_string()));
        }

        #[test]
        fn test_extract_element_not_found() {
            let xml = "<title>Hello</title>";
            assert_eq!(Fetcher::extract_xml_element(xml, "link"), None);
        }

        #[test]
        fn test_extract_element_no_closing_tag() {
            let xml = "<pubDate>Mon, 09 Dec 2024";
            assert_eq!(Fetcher::extract_xml_element(xml, "pubDate"), None);
        }

        #[test]
        fn test_extract_dates_per_item() {
            let xml = r#"
                <rss><channel>
                    <item>
                        <link>https://a.example.com/1</link>
                        <pubDate>09-Dec-2024 12:00:00</pubDate>
                    </item>
                    <item>
                        <link>https://a.example.com/2</link>
                    </item>
                    <item>
                        <link>https://a.example.com/3</link>
                        <pubDate></pubDate>
                    </item>
                </channel></rss>
            "#;

            let dates = Fetcher::extract_dates_from_xml(xml.as_bytes());
            assert_eq!(dates.len(), 1);
            assert_eq!(
                dates.get("https://a.example.com/1"),
                Some(&"09-Dec-2024 12:00:00".to_string())
            );
        }

        #[test]
        fn test_extract_dates_invalid_utf8() {
            let invalid_bytes = vec![0xFF, 0xFE, 0x00, 0x01];
            assert!(Fetcher::extract_dates_from_xml(&invalid_bytes).is_empty());
        }
    }

    mod parse_entries_tests {
        use super::*;

        const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
            <rss version="2.0">
                <channel>
                    <title>Markets</title>
                    <link>https://markets.example.com</link>
                    <description>Market news</description>
                    <item>
                        <title>Sensex surges on strong earnings</title>
                        <link>https://markets.example.com/1</link>
                        <guid>markets-1</guid>
                        <description><![CDATA[<p>Stocks <b>rallied</b>.</p>]]></description>
                        <category>Markets</category>
                        <pubDate>09-Dec-2024 12:00:00</pubDate>
                    </item>
                    <item>
                        <title></title>
                        <link>https://markets.example.com/empty</link>
                    </item>
                    <item>
                        <title>No link here</title>
                    </item>
                    <item>
                        <title>Rupee steady</title>
                        <link>https://markets.example.com/2</link>
                        <pubDate>sometime soon</pubDate>
                    </item>
                    <item>
                        <title>Third story</title>
                        <link>https://markets.example.com/3</link>
                        <pubDate>Mon, 09 Dec 2024 10:00:00 GMT</pubDate>
                    </item>
                </channel>
            </rss>
        "#;

        #[test]
        fn test_skips_untitled_and_linkless_entries() {
            let now = utc("2024-12-10T00:00:00Z");
            let entries = test_fetcher(10).parse_entries(RSS.as_bytes(), now).unwrap();

            let titles: Vec<&str> = entries.iter().map(|e| e.title.as_str()).collect();
            assert_eq!(titles, vec!["Sensex surges on strong earnings", "Rupee steady", "Third story"]);
        }

        #[test]
        fn test_maps_fields_and_normalizes_time() {
            let now = utc("2024-12-10T00:00:00Z");
            let entries = test_fetcher(10).parse_entries(RSS.as_bytes(), now).unwrap();

            let first = &entries[0];
            assert_eq!(first.link, "https://markets.example.com/1");
            assert_eq!(first.category.as_deref(), Some("Markets"));
            assert!(first.description.contains("rallied"));
            assert_eq!(first.published_raw.as_deref(), Some("09-Dec-2024 12:00:00"));
            assert_eq!(first.published_at, utc("2024-12-09T06:30:00Z"));
            assert!(!first.published_fallback);

            let third = &entries[2];
            assert_eq!(third.published_at, utc("2024-12-09T10:00:00Z"));
        }

        #[test]
        fn test_unparsable_time_falls_back_to_now() {
            let now = utc("2024-12-10T00:00:00Z");
            let entries = test_fetcher(10).parse_entries(RSS.as_bytes(), now).unwrap();

            let second = &entries[1];
            assert!(second.published_fallback);
            assert_eq!(second.published_at, now);
            assert!(now - second.published_at < Duration::seconds(1));
        }

        #[test]
        fn test_respects_per_source_limit() {
            let now = utc("2024-12-10T00:00:00Z");
            let entries = test_fetcher(2).parse_entries(RSS.as_bytes(), now).unwrap();
            assert_eq!(entries.len(), 2);
        }

        #[test]
        fn test_invalid_document_is_an_error() {
            let result = test_fetcher(10).parse_entries(b"<html>not a feed", Utc::now());
            assert!(matches!(result, Err(FetchError::Parse(_))));
        }
    }
}
