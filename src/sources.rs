use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::FeedConfig;

/// A configured feed endpoint plus the outcome of its most recent fetch.
#[derive(Debug, Clone, Serialize)]
pub struct FeedSource {
    pub id: String,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub color: Option<String>,
    pub category: Option<String>,
    pub last_fetched: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub success_count: u64,
    pub error_count: u64,
    pub last_item_count: usize,
}

impl FeedSource {
    pub fn new(id: &str, name: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            enabled: true,
            color: None,
            category: None,
            last_fetched: None,
            last_error: None,
            success_count: 0,
            error_count: 0,
            last_item_count: 0,
        }
    }

    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            enabled: config.enabled,
            color: config.color.clone(),
            category: config.category.clone(),
            ..Self::new(&config.id, &config.name, &config.url)
        }
    }
}

/// Fixed set of sources, created at startup. Only the aggregation cycle
/// writes fetch outcomes back; sources are never added or removed at runtime.
pub struct SourceRegistry {
    sources: RwLock<Vec<FeedSource>>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<FeedSource>) -> Self {
        Self {
            sources: RwLock::new(sources),
        }
    }

    pub async fn all(&self) -> Vec<FeedSource> {
        self.sources.read().await.clone()
    }

    pub async fn enabled(&self) -> Vec<FeedSource> {
        self.sources
            .read()
            .await
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<FeedSource> {
        self.sources.read().await.iter().find(|s| s.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sources.read().await.len()
    }

    pub(crate) async fn record_success(&self, id: &str, item_count: usize, at: DateTime<Utc>) {
        let mut sources = self.sources.write().await;
        if let Some(source) = sources.iter_mut().find(|s| s.id == id) {
            source.last_fetched = Some(at);
            source.last_error = None;
            source.success_count += 1;
            source.last_item_count = item_count;
        }
    }

    pub(crate) async fn record_failure(&self, id: &str, error: &str, at: DateTime<Utc>) {
        let mut sources = self.sources.write().await;
        if let Some(source) = sources.iter_mut().find(|s| s.id == id) {
            source.last_fetched = Some(at);
            source.last_error = Some(error.to_string());
            source.error_count += 1;
            source.last_item_count = 0;
        }
    }
}
