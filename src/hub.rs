//! Push fan-out of published snapshots to live subscribers.
//!
//! Each subscriber owns a small bounded queue. Delivery never waits: a
//! subscriber whose queue is full or whose receiver is gone is dropped on the
//! spot and everyone else still gets the snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::Snapshot;

pub type SubscriberId = u64;

pub struct Subscription {
    pub id: SubscriberId,
    receiver: mpsc::Receiver<Arc<Snapshot>>,
}

impl Subscription {
    /// Next pushed snapshot; `None` once the hub has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<Snapshot>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Snapshot>> {
        self.receiver.try_recv().ok()
    }
}

struct HubState {
    subscribers: HashMap<SubscriberId, mpsc::Sender<Arc<Snapshot>>>,
    latest: Option<Arc<Snapshot>>,
    next_id: SubscriberId,
}

pub struct Hub {
    state: Mutex<HubState>,
    buffer: usize,
}

impl Hub {
    pub fn new(buffer: usize) -> Self {
        Self {
            state: Mutex::new(HubState {
                subscribers: HashMap::new(),
                latest: None,
                next_id: 1,
            }),
            buffer: buffer.max(1),
        }
    }

    /// Register a subscriber and queue one snapshot for it right away: the
    /// newer of `current` and the last broadcast.
    pub async fn subscribe(&self, current: Arc<Snapshot>) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let mut state = self.state.lock().await;

        let initial = match &state.latest {
            Some(latest) if latest.generation > current.generation => latest.clone(),
            _ => current,
        };
        // A fresh queue always has room for one
        let _ = sender.try_send(initial);

        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(id, sender);
        info!("Subscriber {} connected, {} live", id, state.subscribers.len());

        Subscription { id, receiver }
    }

    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.subscribers.remove(&id).is_some();
        if removed {
            info!("Subscriber {} disconnected, {} live", id, state.subscribers.len());
        }
        removed
    }

    /// Push `snapshot` to every subscriber. Returns how many received it.
    pub async fn broadcast(&self, snapshot: Arc<Snapshot>) -> usize {
        let mut state = self.state.lock().await;

        if let Some(latest) = &state.latest {
            if latest.generation > snapshot.generation {
                debug!(
                    "Skipping broadcast of cycle {}, cycle {} already sent",
                    snapshot.generation, latest.generation
                );
                return 0;
            }
        }
        state.latest = Some(snapshot.clone());

        let mut dropped = Vec::new();
        for (id, sender) in &state.subscribers {
            match sender.try_send(snapshot.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {} is not keeping up, dropping it", id);
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {} went away", id);
                    dropped.push(*id);
                }
            }
        }

        for id in &dropped {
            state.subscribers.remove(id);
        }

        state.subscribers.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(generation: u64) -> Arc<Snapshot> {
        Arc::new(Snapshot {
            generation,
            ..Snapshot::empty()
        })
    }

    #[tokio::test]
    async fn test_new_subscriber_gets_current_snapshot_immediately() {
        let hub = Hub::new(4);
        let mut sub = hub.subscribe(snapshot(7)).await;

        let first = sub.try_recv().unwrap();
        assert_eq!(first.generation, 7);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_prefers_newer_broadcast() {
        let hub = Hub::new(4);
        hub.broadcast(snapshot(5)).await;

        let mut sub = hub.subscribe(snapshot(4)).await;
        assert_eq!(sub.try_recv().unwrap().generation, 5);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let hub = Hub::new(4);
        let mut a = hub.subscribe(snapshot(0)).await;
        let mut b = hub.subscribe(snapshot(0)).await;
        a.try_recv();
        b.try_recv();

        let delivered = hub.broadcast(snapshot(1)).await;

        assert_eq!(delivered, 2);
        assert_eq!(a.recv().await.unwrap().generation, 1);
        assert_eq!(b.recv().await.unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_removed() {
        let hub = Hub::new(4);
        let mut alive = hub.subscribe(snapshot(0)).await;
        let gone = hub.subscribe(snapshot(0)).await;
        drop(gone);

        let delivered = hub.broadcast(snapshot(1)).await;

        assert_eq!(delivered, 1);
        assert_eq!(hub.subscriber_count().await, 1);
        alive.try_recv();
        assert_eq!(alive.try_recv().unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped_without_blocking_others() {
        let hub = Hub::new(1);
        let _slow = hub.subscribe(snapshot(0)).await; // never reads
        let mut fast = hub.subscribe(snapshot(0)).await;
        fast.try_recv();

        let delivered = hub.broadcast(snapshot(1)).await;

        assert_eq!(delivered, 1);
        assert_eq!(fast.try_recv().unwrap().generation, 1);
        assert_eq!(hub.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_sees_end_of_stream() {
        let hub = Hub::new(1);
        let mut slow = hub.subscribe(snapshot(0)).await;
        hub.broadcast(snapshot(1)).await;

        assert_eq!(slow.recv().await.unwrap().generation, 0);
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let hub = Hub::new(4);
        let sub = hub.subscribe(snapshot(0)).await;

        assert!(hub.unsubscribe(sub.id).await);
        assert!(!hub.unsubscribe(sub.id).await);
        assert_eq!(hub.broadcast(snapshot(1)).await, 0);
    }

    #[tokio::test]
    async fn test_older_broadcast_is_skipped() {
        let hub = Hub::new(4);
        let mut sub = hub.subscribe(snapshot(0)).await;
        sub.try_recv();

        hub.broadcast(snapshot(3)).await;
        assert_eq!(hub.broadcast(snapshot(2)).await, 0);

        assert_eq!(sub.try_recv().unwrap().generation, 3);
        assert!(sub.try_recv().is_none());
    }
}
