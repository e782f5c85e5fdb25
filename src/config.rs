use std::path::Path;
use std::time::Duration;

use chrono::FixedOffset;
use serde::Deserialize;

use crate::engine::{Settings, DEFAULT_USER_AGENT};
use crate::enrich::{EnrichConfig, PriorityWeights};
use crate::sources::FeedSource;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Refresh interval in minutes
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// Retention sweep interval in minutes
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
    /// Outbound fetch ceiling across all sources, requests per minute
    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: u32,
    #[serde(default = "default_retention_cap")]
    pub retention_cap: usize,
    #[serde(default = "default_freshness_horizon_hours")]
    pub freshness_horizon_hours: u64,
    #[serde(default = "default_max_items_per_source")]
    pub max_items_per_source: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_sweep_secs")]
    pub cache_sweep_secs: u64,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Offset applied to timestamps that carry no zone, and used for display
    #[serde(default = "default_display_utc_offset_minutes")]
    pub display_utc_offset_minutes: i32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub scoring: ScoringConfig,
    pub feeds: Vec<FeedConfig>,
}

fn default_refresh_interval() -> u64 {
    5
}

fn default_sweep_interval() -> u64 {
    1
}

fn default_rate_limit_rpm() -> u32 {
    60
}

fn default_retention_cap() -> usize {
    150
}

fn default_freshness_horizon_hours() -> u64 {
    24
}

fn default_max_items_per_source() -> usize {
    10
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_cycle_timeout_secs() -> u64 {
    240
}

fn default_cache_ttl_secs() -> u64 {
    600
}

fn default_cache_sweep_secs() -> u64 {
    60
}

fn default_subscriber_buffer() -> usize {
    8
}

fn default_display_utc_offset_minutes() -> i32 {
    330
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Heuristic weights and word lists used by the enricher. Every field falls
/// back to the built-in defaults when omitted.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ScoringConfig {
    pub sentiment_threshold: Option<f64>,
    pub keyword_cap: Option<usize>,
    pub domain_tag: Option<i32>,
    pub positive: Option<i32>,
    pub negative: Option<i32>,
    pub within_1h: Option<i32>,
    pub within_6h: Option<i32>,
    pub within_24h: Option<i32>,
    pub trusted_source: Option<i32>,
    pub trusted_sources: Option<Vec<String>>,
    pub tracked_terms: Option<Vec<String>>,
}

impl ScoringConfig {
    pub fn to_enrich_config(&self) -> EnrichConfig {
        let defaults = EnrichConfig::default();
        let w = PriorityWeights::default();

        EnrichConfig {
            sentiment_threshold: self
                .sentiment_threshold
                .unwrap_or(defaults.sentiment_threshold),
            keyword_cap: self.keyword_cap.unwrap_or(defaults.keyword_cap),
            weights: PriorityWeights {
                domain_tag: self.domain_tag.unwrap_or(w.domain_tag),
                positive: self.positive.unwrap_or(w.positive),
                negative: self.negative.unwrap_or(w.negative),
                within_1h: self.within_1h.unwrap_or(w.within_1h),
                within_6h: self.within_6h.unwrap_or(w.within_6h),
                within_24h: self.within_24h.unwrap_or(w.within_24h),
                trusted_source: self.trusted_source.unwrap_or(w.trusted_source),
            },
            trusted_sources: self
                .trusted_sources
                .clone()
                .unwrap_or(defaults.trusted_sources),
            tracked_terms: self
                .tracked_terms
                .clone()
                .unwrap_or(defaults.tracked_terms),
            ..defaults
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn settings(&self) -> anyhow::Result<Settings> {
        let display_offset = FixedOffset::east_opt(self.display_utc_offset_minutes * 60)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "display_utc_offset_minutes out of range: {}",
                    self.display_utc_offset_minutes
                )
            })?;

        let hours = i64::try_from(self.freshness_horizon_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "freshness_horizon_hours out of range: {}",
                    self.freshness_horizon_hours
                )
            })?;

        let settings = Settings {
            refresh_interval: minutes("refresh_interval", self.refresh_interval)?,
            sweep_interval: minutes("sweep_interval", self.sweep_interval)?,
            rate_limit_rpm: self.rate_limit_rpm,
            retention_cap: self.retention_cap,
            freshness_horizon: hours,
            max_items_per_source: self.max_items_per_source,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            cycle_timeout: Duration::from_secs(self.cycle_timeout_secs),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            cache_sweep_interval: Duration::from_secs(self.cache_sweep_secs),
            subscriber_buffer: self.subscriber_buffer,
            display_offset,
            user_agent: self.user_agent.clone(),
            enrich: self.scoring.to_enrich_config(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn sources(&self) -> Vec<FeedSource> {
        self.feeds.iter().map(FeedSource::from_config).collect()
    }
}

fn minutes(field: &str, value: u64) -> anyhow::Result<Duration> {
    value
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow::anyhow!("{} out of range: {}", field, value))
}
