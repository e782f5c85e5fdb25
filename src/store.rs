use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::analytics::{self, Analytics};
use crate::enrich::{time_ago, Item};

/// The published (items, analytics, timestamp) triple. Readers share it
/// through an `Arc` and never see a half-built one.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub items: Vec<Item>,
    pub analytics: Analytics,
    pub last_updated: Option<DateTime<Utc>>,
    /// Cycle that produced the item list; 0 before the first publish
    pub generation: u64,
    /// Bumped on every publish and every sweep
    pub revision: u64,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            analytics: Analytics::default(),
            last_updated: None,
            generation: 0,
            revision: 0,
        }
    }
}

pub struct ItemStore {
    current: RwLock<Arc<Snapshot>>,
    evicted_total: AtomicU64,
    display_offset: FixedOffset,
}

impl ItemStore {
    pub fn new(display_offset: FixedOffset) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::empty())),
            evicted_total: AtomicU64::new(0),
            display_offset,
        }
    }

    pub async fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().await.clone()
    }

    /// Publish a new snapshot for `generation`. Returns `None` without
    /// touching the store when a newer generation is already published.
    pub(crate) async fn replace(
        &self,
        generation: u64,
        items: Vec<Item>,
        analytics: Analytics,
        at: DateTime<Utc>,
    ) -> Option<Arc<Snapshot>> {
        let mut current = self.current.write().await;
        if generation < current.generation {
            warn!(
                "Discarding results of cycle {}, cycle {} already published",
                generation, current.generation
            );
            return None;
        }

        let snapshot = Arc::new(Snapshot {
            items,
            analytics,
            last_updated: Some(at),
            generation,
            revision: current.revision + 1,
        });
        *current = snapshot.clone();
        Some(snapshot)
    }

    /// Drop items older than `horizon` from the current snapshot and refresh
    /// the age strings of the rest. Returns how many items were evicted.
    pub(crate) async fn sweep(&self, horizon: Duration, now: DateTime<Utc>) -> usize {
        let mut current = self.current.write().await;

        let before = current.items.len();
        let items: Vec<Item> = current
            .items
            .iter()
            .filter(|item| now - item.published_at <= horizon)
            .cloned()
            .map(|mut item| {
                item.age = time_ago(item.published_at, now);
                item
            })
            .collect();
        let evicted = before - items.len();

        let analytics = if evicted > 0 {
            analytics::compute(&items, self.display_offset)
        } else {
            current.analytics.clone()
        };

        let (last_updated, generation, revision) =
            (current.last_updated, current.generation, current.revision + 1);
        *current = Arc::new(Snapshot {
            items,
            analytics,
            last_updated,
            generation,
            revision,
        });

        if evicted > 0 {
            self.evicted_total.fetch_add(evicted as u64, Ordering::Relaxed);
            info!("Evicted {} stale items", evicted);
        }
        evicted
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::Relaxed)
    }
}
