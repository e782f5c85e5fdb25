//! The aggregation cycle and the read surface handed to the transport layer.
//!
//! One [`Engine`] owns every piece of shared state: the source registry, the
//! rate governor, the item store, the distribution hub and the filter cache.
//! Nothing else mutates them.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::analytics;
use crate::cache::TtlCache;
use crate::enrich::{EnrichConfig, Enricher, Item, Sentiment};
use crate::fetcher::{FetchError, Fetcher, RawEntry};
use crate::governor::RateGovernor;
use crate::hub::{Hub, SubscriberId, Subscription};
use crate::sources::{FeedSource, SourceRegistry};
use crate::store::{ItemStore, Snapshot};

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";

const DEFAULT_DISPLAY_OFFSET_SECS: i32 = 330 * 60;

/// Runtime parameters of the engine. How they were supplied is not its concern.
#[derive(Debug, Clone)]
pub struct Settings {
    pub refresh_interval: Duration,
    pub sweep_interval: Duration,
    pub rate_limit_rpm: u32,
    pub retention_cap: usize,
    pub freshness_horizon: chrono::Duration,
    pub max_items_per_source: usize,
    pub request_timeout: Duration,
    /// Fan-in deadline; results arriving later are dropped
    pub cycle_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub subscriber_buffer: usize,
    /// Used for zone-less timestamps and for the hourly histogram
    pub display_offset: FixedOffset,
    pub user_agent: String,
    pub enrich: EnrichConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            rate_limit_rpm: 60,
            retention_cap: 150,
            freshness_horizon: chrono::Duration::hours(24),
            max_items_per_source: 10,
            request_timeout: Duration::from_secs(15),
            cycle_timeout: Duration::from_secs(240),
            cache_ttl: Duration::from_secs(600),
            cache_sweep_interval: Duration::from_secs(60),
            subscriber_buffer: 8,
            display_offset: FixedOffset::east_opt(DEFAULT_DISPLAY_OFFSET_SECS)
                .unwrap_or_else(|| Utc.fix()),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            enrich: EnrichConfig::default(),
        }
    }
}

impl Settings {
    /// Periodic tasks cannot tick on a zero interval.
    pub fn validate(&self) -> anyhow::Result<()> {
        let intervals = [
            ("refresh_interval", self.refresh_interval),
            ("sweep_interval", self.sweep_interval),
            ("cache_sweep_interval", self.cache_sweep_interval),
        ];
        for (name, every) in intervals {
            if every.is_zero() {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    FetchingAll,
    Enriching,
    Ranking,
    Publishing,
}

/// Outcome of one aggregation cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub generation: u64,
    pub sources_ok: usize,
    pub sources_failed: usize,
    /// Sources with no result before the fan-in deadline
    pub sources_timed_out: usize,
    pub entries_fetched: usize,
    pub stale_dropped: usize,
    pub items_published: usize,
    /// False when a newer cycle had already published
    pub published: bool,
    pub subscribers_reached: usize,
}

/// Criteria for [`Engine::filter`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct FilterCriteria {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub source: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub sentiment: Option<Sentiment>,
    #[serde(default)]
    pub domain_only: bool,
}

impl FilterCriteria {
    pub fn matches(&self, item: &Item) -> bool {
        self.source.as_deref().map_or(true, |s| item.source_id == s)
            && self
                .category
                .as_deref()
                .map_or(true, |c| item.category.eq_ignore_ascii_case(c))
            && self.sentiment.map_or(true, |s| item.sentiment == s)
            && (!self.domain_only || item.has_domain_tag())
    }
}

// Query strings send `source=` for "any"
fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(de::Error::custom),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub items: usize,
    pub retention_cap: usize,
    pub sources: usize,
    pub enabled_sources: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub generation: u64,
    pub phase: CyclePhase,
    /// A manual refresh is running
    pub refreshing: bool,
    pub governor_tokens: u32,
    pub governor_rate: u32,
    pub evicted_total: u64,
    pub subscribers: usize,
    pub cached_filters: usize,
}

type FilterKey = (FilterCriteria, u64);

pub struct Engine {
    settings: Settings,
    registry: SourceRegistry,
    governor: Arc<RateGovernor>,
    fetcher: Arc<Fetcher>,
    enricher: Enricher,
    store: ItemStore,
    hub: Hub,
    filter_cache: Arc<TtlCache<FilterKey, Arc<Vec<Item>>>>,
    /// Newest snapshot revision the filter cache holds entries for
    filter_revision: AtomicU64,
    generation: AtomicU64,
    phase: RwLock<CyclePhase>,
    refreshing: AtomicBool,
}

impl Engine {
    pub fn new(settings: Settings, sources: Vec<FeedSource>) -> anyhow::Result<Self> {
        settings.validate()?;
        let fetcher = Fetcher::new(&settings)?;

        Ok(Self {
            registry: SourceRegistry::new(sources),
            governor: Arc::new(RateGovernor::per_minute(settings.rate_limit_rpm)),
            fetcher: Arc::new(fetcher),
            enricher: Enricher::new(settings.enrich.clone()),
            store: ItemStore::new(settings.display_offset),
            hub: Hub::new(settings.subscriber_buffer),
            filter_cache: Arc::new(TtlCache::new()),
            filter_revision: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            phase: RwLock::new(CyclePhase::Idle),
            refreshing: AtomicBool::new(false),
            settings,
        })
    }

    pub async fn phase(&self) -> CyclePhase {
        *self.phase.read().await
    }

    async fn set_phase(&self, phase: CyclePhase) {
        *self.phase.write().await = phase;
    }

    /// Fetch every enabled source, enrich, rank and publish one snapshot.
    pub async fn run_cycle(&self) -> CycleReport {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let sources = self.registry.enabled().await;
        let mut report = CycleReport {
            generation,
            ..CycleReport::default()
        };

        info!("Starting cycle {} over {} sources", generation, sources.len());
        self.set_phase(CyclePhase::FetchingAll).await;
        let results = self.fetch_all(&sources).await;

        self.set_phase(CyclePhase::Enriching).await;
        let now = Utc::now();
        let mut items = Vec::new();
        for (source, result) in sources.iter().zip(results) {
            match result {
                Some(Ok(entries)) => {
                    report.sources_ok += 1;
                    report.entries_fetched += entries.len();
                    self.registry
                        .record_success(&source.id, entries.len(), now)
                        .await;

                    for entry in &entries {
                        if now - entry.published_at > self.settings.freshness_horizon {
                            report.stale_dropped += 1;
                            continue;
                        }
                        items.push(self.enricher.enrich(entry, source, now));
                    }
                }
                Some(Err(e)) => {
                    report.sources_failed += 1;
                    error!("Failed to fetch feed '{}': {}", source.id, e);
                    self.registry
                        .record_failure(&source.id, &e.to_string(), now)
                        .await;
                }
                None => {
                    report.sources_timed_out += 1;
                    warn!("No result from feed '{}' before the cycle deadline", source.id);
                    self.registry
                        .record_failure(&source.id, "no response before cycle deadline", now)
                        .await;
                }
            }
        }

        self.set_phase(CyclePhase::Ranking).await;
        let items = rank(items, self.settings.retention_cap);
        let analytics = analytics::compute(&items, self.settings.display_offset);

        self.set_phase(CyclePhase::Publishing).await;
        report.items_published = items.len();
        if let Some(snapshot) = self
            .store
            .replace(generation, items, analytics, Utc::now())
            .await
        {
            report.published = true;
            report.subscribers_reached = self.hub.broadcast(snapshot).await;
        } else {
            report.items_published = 0;
        }

        self.set_phase(CyclePhase::Idle).await;
        info!(
            "Cycle {} complete: {} ok, {} failed, {} timed out, {} items published",
            generation,
            report.sources_ok,
            report.sources_failed,
            report.sources_timed_out,
            report.items_published
        );
        report
    }

    /// One task per source; results come back over a channel in completion
    /// order and are returned in source order. `None` marks a source that
    /// missed the deadline.
    async fn fetch_all(
        &self,
        sources: &[FeedSource],
    ) -> Vec<Option<Result<Vec<RawEntry>, FetchError>>> {
        let deadline = Instant::now() + self.settings.cycle_timeout;
        let (tx, mut rx) = mpsc::channel(sources.len().max(1));

        for (index, source) in sources.iter().enumerate() {
            let tx = tx.clone();
            let governor = self.governor.clone();
            let fetcher = self.fetcher.clone();
            let source = source.clone();
            tokio::spawn(async move {
                governor.acquire().await;
                let result = fetcher.fetch(&source).await;
                // The receiver is gone once the deadline passed
                let _ = tx.send((index, result)).await;
            });
        }
        drop(tx);

        let mut results: Vec<Option<Result<Vec<RawEntry>, FetchError>>> =
            sources.iter().map(|_| None).collect();
        let mut received = 0;
        while received < sources.len() {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some((index, result))) => {
                    results[index] = Some(result);
                    received += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Cycle deadline reached with {} of {} sources reported",
                        received,
                        sources.len()
                    );
                    break;
                }
            }
        }

        results
    }

    pub async fn get_snapshot(&self) -> Arc<Snapshot> {
        self.store.snapshot().await
    }

    /// Items of the current snapshot matching `criteria`, in snapshot order.
    ///
    /// Results are cached per snapshot revision. The first lookup against a
    /// newer revision drops every entry computed from older ones.
    pub async fn filter(&self, criteria: &FilterCriteria) -> Arc<Vec<Item>> {
        let snapshot = self.store.snapshot().await;
        let revision = snapshot.revision;
        let key = (criteria.clone(), revision);

        if let Some(hit) = self.filter_cache.get(&key).await {
            return hit;
        }

        let matched: Arc<Vec<Item>> = Arc::new(
            snapshot
                .items
                .iter()
                .filter(|item| criteria.matches(item))
                .cloned()
                .collect(),
        );
        let cached = self.filter_revision.fetch_max(revision, Ordering::SeqCst);
        if cached < revision {
            self.filter_cache.clear().await;
        }
        // A reader still holding an older snapshot does not cache its result
        if cached <= revision {
            self.filter_cache
                .set(key, matched.clone(), self.settings.cache_ttl)
                .await;
        }
        matched
    }

    pub async fn subscribe(&self) -> Subscription {
        let current = self.store.snapshot().await;
        self.hub.subscribe(current).await
    }

    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.hub.unsubscribe(id).await
    }

    pub async fn sources(&self) -> Vec<FeedSource> {
        self.registry.all().await
    }

    pub async fn source(&self, id: &str) -> Option<FeedSource> {
        self.registry.get(id).await
    }

    /// Evict items past the freshness horizon from the current snapshot.
    pub async fn sweep(&self) -> usize {
        self.store
            .sweep(self.settings.freshness_horizon, Utc::now())
            .await
    }

    pub async fn status(&self) -> Status {
        let snapshot = self.store.snapshot().await;
        Status {
            items: snapshot.items.len(),
            retention_cap: self.settings.retention_cap,
            sources: self.registry.len().await,
            enabled_sources: self.registry.enabled().await.len(),
            last_updated: snapshot.last_updated,
            generation: snapshot.generation,
            phase: self.phase().await,
            refreshing: self.is_refreshing(),
            governor_tokens: self.governor.tokens(),
            governor_rate: self.governor.rate(),
            evicted_total: self.store.evicted_total(),
            subscribers: self.hub.subscriber_count().await,
            cached_filters: self.filter_cache.len().await,
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Start a cycle outside the timer. Returns `None` while an earlier
    /// manual refresh is still running. Timer cycles are not held back by it.
    pub fn trigger_refresh(self: &Arc<Self>) -> Option<JoinHandle<CycleReport>> {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            info!("Refresh already in progress, skipping");
            return None;
        }

        let engine = self.clone();
        Some(tokio::spawn(async move {
            info!("Manual refresh requested");
            let report = engine.run_cycle().await;
            engine.refreshing.store(false, Ordering::SeqCst);
            report
        }))
    }

    /// Refresh timer, retention sweeper and filter cache sweeper.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            start_background_refresh(self.clone()),
            start_retention_sweeper(self.clone()),
            self.filter_cache
                .clone()
                .start_sweeper(self.settings.cache_sweep_interval),
        ]
    }
}

/// Order by priority, then recency, then id; keep the first `cap`.
pub fn rank(mut items: Vec<Item>, cap: usize) -> Vec<Item> {
    items.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.published_at.cmp(&a.published_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    items.truncate(cap);
    items
}

/// Run one cycle now, then one per refresh interval. A slow cycle does not
/// hold back the next tick.
pub fn start_background_refresh(engine: Arc<Engine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Running initial aggregation cycle");
        engine.run_cycle().await;

        let mut ticker = interval(engine.settings.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            info!("Starting scheduled aggregation cycle");
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.run_cycle().await;
            });
        }
    })
}

pub fn start_retention_sweeper(engine: Arc<Engine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(engine.settings.sweep_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            engine.sweep().await;
        }
    })
}
