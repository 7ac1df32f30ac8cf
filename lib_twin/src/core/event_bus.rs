//! # Shadow Event Bus
//!
//! In-process fan-out of `DiffPatch` values to predicate-filtered subscribers.
//!
//! ## Core Design Principles:
//!
//! 1.  **Non-blocking publish**: every subscriber owns an unbounded MPSC
//!     channel. `publish` only enqueues, so a slow consumer never stalls the
//!     session loop that produced the diff or the other subscribers.
//!
//! 2.  **Self-cleaning registry**: a send to a dropped receiver fails; such
//!     subscribers are pruned during the next publish.
//!
//! 3.  **Clean termination**: detaching removes the sender from the registry.
//!     Once the last queued diff is consumed the subscriber's stream ends.
//!
//! Delivery is at-most-once. Per device, diffs arrive in publish order.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::model::DiffPatch;

/// Filter applied to every published diff.
pub type DiffPredicate = Box<dyn Fn(&DiffPatch) -> bool + Send + Sync>;

struct Subscriber {
    predicate: DiffPredicate,
    sender: mpsc::UnboundedSender<Arc<DiffPatch>>,
}

type Registry = RwLock<HashMap<u64, Subscriber>>;

/// The broker. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct ShadowEventBus {
    subscribers: Arc<Registry>,
    next_id: AtomicU64,
}

impl ShadowEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `predicate` and returns the handle holding its queue.
    pub fn subscribe<F>(&self, predicate: F) -> Subscription
    where
        F: Fn(&DiffPatch) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let total = {
            let mut subs = self.subscribers.write();
            subs.insert(
                id,
                Subscriber {
                    predicate: Box::new(predicate),
                    sender: tx,
                },
            );
            subs.len()
        };
        debug!(subscriber = id, total, "shadow event bus: subscriber added");

        Subscription {
            id,
            registry: Arc::downgrade(&self.subscribers),
            stream: UnboundedReceiverStream::new(rx),
        }
    }

    /// Diffs for exactly one device.
    pub fn subscribe_device(&self, device_id: &str) -> Subscription {
        let device_id = device_id.to_string();
        self.subscribe(move |diff| diff.device_id == device_id)
    }

    /// Diffs for any device of `device_ids`.
    pub fn subscribe_devices<I, S>(&self, device_ids: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = device_ids.into_iter().map(Into::into).collect();
        self.subscribe(move |diff| set.contains(&diff.device_id))
    }

    /// Enqueues `diff` for every matching subscriber. Never blocks on consumers.
    pub fn publish(&self, diff: DiffPatch) {
        let diff = Arc::new(diff);
        let mut closed = Vec::new();

        {
            let subs = self.subscribers.read();
            for (id, sub) in subs.iter() {
                if !(sub.predicate)(&diff) {
                    continue;
                }
                if sub.sender.send(Arc::clone(&diff)).is_err() {
                    closed.push(*id);
                }
            }
        }

        if !closed.is_empty() {
            let mut subs = self.subscribers.write();
            for id in closed {
                subs.remove(&id);
                debug!(subscriber = id, "shadow event bus: pruned closed subscriber");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// A registered consumer. Dropping it detaches.
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
    stream: UnboundedReceiverStream<Arc<DiffPatch>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next matching diff; `None` once detached and drained.
    pub async fn recv(&mut self) -> Option<Arc<DiffPatch>> {
        self.stream.as_mut().recv().await
    }

    /// Next queued diff without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<DiffPatch>> {
        self.stream.as_mut().try_recv().ok()
    }

    /// Removes the registration. Already queued diffs can still be drained.
    pub fn detach(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.write().remove(&self.id).is_some() {
                debug!(subscriber = self.id, "shadow event bus: subscriber removed");
            }
        }
        self.stream.as_mut().close();
    }
}

impl Stream for Subscription {
    type Item = Arc<DiffPatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.write().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures_util::StreamExt;

    fn diff(device_id: &str, progress: f64) -> DiffPatch {
        let mut d = DiffPatch::new(device_id, Utc::now());
        d.fields
            .insert("reported.progress_pct".into(), serde_json::json!(progress));
        d
    }

    #[tokio::test]
    async fn test_device_filter_isolates_devices() {
        let bus = ShadowEventBus::new();
        let mut x = bus.subscribe_device("X");

        bus.publish(diff("Y", 1.0));
        bus.publish(diff("X", 2.0));

        let got = x.recv().await.unwrap();
        assert_eq!(got.device_id, "X");
        assert!(x.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_set_filter_and_ordering() {
        let bus = ShadowEventBus::new();
        let mut sub = bus.subscribe_devices(["A", "B"]);

        for (i, dev) in ["A", "C", "B", "A"].iter().enumerate() {
            bus.publish(diff(dev, i as f64));
        }

        let seen: Vec<String> = (0..3)
            .map(|_| sub.try_recv().unwrap().device_id.clone())
            .collect();
        assert_eq!(seen, vec!["A", "B", "A"]);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_detach_terminates_stream_after_drain() {
        let bus = ShadowEventBus::new();
        let mut sub = bus.subscribe(|_| true);
        bus.publish(diff("A", 1.0));

        sub.detach();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(diff("A", 2.0));

        let items: Vec<_> = (&mut sub).collect().await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let bus = ShadowEventBus::new();
        let sub = bus.subscribe(|_| true);
        let _other = bus.subscribe(|_| true);
        assert_eq!(bus.subscriber_count(), 2);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_consumer_does_not_block_publisher() {
        let bus = ShadowEventBus::new();
        let _idle = bus.subscribe(|_| true);
        let mut active = bus.subscribe(|_| true);

        for i in 0..10_000 {
            bus.publish(diff("A", i as f64));
        }
        let mut n = 0;
        while active.try_recv().is_some() {
            n += 1;
        }
        assert_eq!(n, 10_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_subscribe_and_publish() {
        let bus = Arc::new(ShadowEventBus::new());
        let mut handles = Vec::new();

        for p in 0..4 {
            let bus = Arc::clone(&bus);
            handles.push(tokio::spawn(async move {
                for i in 0..500 {
                    bus.publish(diff(&format!("D{p}"), i as f64));
                }
            }));
        }
        for _ in 0..4 {
            let bus = Arc::clone(&bus);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let sub = bus.subscribe(|_| true);
                    drop(sub);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(bus.subscriber_count(), 0);
    }
}
