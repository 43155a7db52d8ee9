//! Watch subscriptions: the events / cancel / errors triple.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::node::{WatchEvent, is_within, normalize};

/// Events buffered per subscriber before it is considered too slow.
pub const DEFAULT_WATCH_BUFFER: usize = 1024;

/// A live subscription to every change under a prefix.
///
/// `events` closes when the watch is cancelled or fails; a failure is
/// delivered on `errors` first.
#[derive(Debug)]
pub struct Watch {
    pub events: mpsc::Receiver<WatchEvent>,
    pub errors: mpsc::Receiver<StoreError>,
    pub cancel: WatchCancel,
}

/// Stops a watch. Dropping it does not cancel.
#[derive(Debug, Clone)]
pub struct WatchCancel {
    id: u64,
    registry: Weak<Mutex<Subscribers>>,
}

impl WatchCancel {
    pub fn cancel(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut subs = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if subs.remove(self.id) {
                debug!(id = self.id, "watch cancelled");
            }
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    prefix: String,
    events: mpsc::Sender<WatchEvent>,
    errors: mpsc::Sender<StoreError>,
}

#[derive(Debug, Default)]
struct Subscribers {
    next_id: u64,
    list: Vec<Subscriber>,
}

impl Subscribers {
    fn remove(&mut self, id: u64) -> bool {
        let before = self.list.len();
        self.list.retain(|s| s.id != id);
        self.list.len() != before
    }
}

/// Fan-out of committed changes to subscribers.
#[derive(Debug, Clone)]
pub(crate) struct WatchRegistry {
    inner: Arc<Mutex<Subscribers>>,
    buffer: usize,
}

impl WatchRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Subscribers::default())),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self, prefix: &str) -> Watch {
        let (event_tx, event_rx) = mpsc::channel(self.buffer);
        let (error_tx, error_rx) = mpsc::channel(1);

        let mut subs = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        subs.next_id += 1;
        let id = subs.next_id;
        subs.list.push(Subscriber {
            id,
            prefix: normalize(prefix).to_string(),
            events: event_tx,
            errors: error_tx,
        });
        debug!(id, prefix, "watch registered");

        Watch {
            events: event_rx,
            errors: error_rx,
            cancel: WatchCancel {
                id,
                registry: Arc::downgrade(&self.inner),
            },
        }
    }

    /// Deliver one commit's changes in order.
    ///
    /// A subscriber whose buffer is full is dropped and told why; one whose
    /// receiver is gone is silently forgotten.
    pub fn publish(&self, changes: &[WatchEvent]) {
        if changes.is_empty() {
            return;
        }
        let mut subs = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        subs.list.retain(|sub| {
            for event in changes.iter().filter(|e| is_within(e.key(), &sub.prefix)) {
                match sub.events.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(id = sub.id, prefix = %sub.prefix, "watch fell behind, dropping");
                        let _ = sub.errors.try_send(StoreError::WatchDropped(sub.prefix.clone()));
                        return false;
                    }
                    Err(TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .list
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::StoreNode;

    fn create(key: &str) -> WatchEvent {
        WatchEvent::Create(StoreNode::new(key, b"v".to_vec()))
    }

    #[tokio::test]
    async fn delivers_only_matching_prefix() {
        let registry = WatchRegistry::new(8);
        let mut watch = registry.subscribe("/v1/task");

        registry.publish(&[create("/v1/task/t1"), create("/v1/cell/c1"), create("/v1/task/t2")]);

        assert_eq!(watch.events.recv().await.unwrap().key(), "/v1/task/t1");
        assert_eq!(watch.events.recv().await.unwrap().key(), "/v1/task/t2");
        assert!(watch.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_closes_events() {
        let registry = WatchRegistry::new(8);
        let mut watch = registry.subscribe("/v1");
        watch.cancel.cancel();

        registry.publish(&[create("/v1/task/t1")]);
        assert!(watch.events.recv().await.is_none());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn full_buffer_drops_subscription_with_error() {
        let registry = WatchRegistry::new(1);
        let mut watch = registry.subscribe("/v1");

        registry.publish(&[create("/v1/a"), create("/v1/b")]);

        assert_eq!(watch.events.recv().await.unwrap().key(), "/v1/a");
        assert!(watch.events.recv().await.is_none());
        assert_eq!(
            watch.errors.recv().await,
            Some(StoreError::WatchDropped("/v1".to_string()))
        );
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_forgotten() {
        let registry = WatchRegistry::new(8);
        drop(registry.subscribe("/v1"));
        registry.publish(&[create("/v1/a")]);
        assert_eq!(registry.len(), 0);
    }
}
