//! Snapshot publication
//!
//! Every change produces a new `FleetSnapshot` behind a new `Arc`. Machines
//! that did not change keep their `Arc`, so a consumer can tell what moved
//! with `Arc::ptr_eq` instead of comparing contents.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

use super::transport::ConnectionState;
use crate::models::{now_millis, Alert, Machine};

/// Immutable view of canonical state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    pub machines: Vec<Arc<Machine>>,
    /// Newest first
    pub alerts: Vec<Alert>,
    pub connected: bool,
    pub connection_state: ConnectionState,
    pub updated_at: i64,
}

impl FleetSnapshot {
    pub fn empty() -> Self {
        Self {
            machines: Vec::new(),
            alerts: Vec::new(),
            connected: false,
            connection_state: ConnectionState::Disconnected,
            updated_at: now_millis(),
        }
    }

    pub fn machine(&self, id: &str) -> Option<&Arc<Machine>> {
        self.machines.iter().find(|m| m.id == id)
    }
}

/// Callback receiving each new snapshot
pub type Listener = Arc<dyn Fn(Arc<FleetSnapshot>) + Send + Sync>;

/// Listener plus the sequence number of the last snapshot it was given
struct OrderedListener {
    listener: Listener,
    last: Mutex<u64>,
}

impl OrderedListener {
    /// Deliver unless something at least as new already went out
    fn deliver(&self, seq: u64, snapshot: &Arc<FleetSnapshot>) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if seq <= *last {
            return;
        }
        *last = seq;
        // held across the call so two deliveries cannot swap order
        (self.listener)(Arc::clone(snapshot));
    }
}

/// Listener registry shared by the handle and the event loop
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    listeners: DashMap<u64, Arc<OrderedListener>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    fn add(&self, listener: Listener) -> (u64, Arc<OrderedListener>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ordered = Arc::new(OrderedListener {
            listener,
            last: Mutex::new(0),
        });
        self.listeners.insert(id, Arc::clone(&ordered));
        (id, ordered)
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    fn notify(&self, seq: u64, snapshot: &Arc<FleetSnapshot>) {
        // clone out first: a listener may unsubscribe while being called
        let listeners: Vec<Arc<OrderedListener>> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for listener in listeners {
            listener.deliver(seq, snapshot);
        }
    }
}

/// Active subscription; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    pub(crate) fn new(id: u64, registry: &Arc<SubscriberRegistry>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// Publishes snapshots to the watch channel and to listeners
///
/// Every snapshot gets a sequence number; a listener never receives a
/// snapshot older than one it has already seen.
#[derive(Clone)]
pub(crate) struct Publisher {
    snapshots: Arc<watch::Sender<Arc<FleetSnapshot>>>,
    latest: Arc<Mutex<(u64, Arc<FleetSnapshot>)>>,
    subscribers: Arc<SubscriberRegistry>,
}

impl Publisher {
    pub(crate) fn new() -> Self {
        let initial = Arc::new(FleetSnapshot::empty());
        let (snapshots, _) = watch::channel(Arc::clone(&initial));
        Self {
            snapshots: Arc::new(snapshots),
            latest: Arc::new(Mutex::new((1, initial))),
            subscribers: Arc::new(SubscriberRegistry::default()),
        }
    }

    pub(crate) fn publish(&self, snapshot: FleetSnapshot) -> Arc<FleetSnapshot> {
        let snapshot = Arc::new(snapshot);
        let seq = {
            let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
            latest.0 += 1;
            latest.1 = Arc::clone(&snapshot);
            latest.0
        };
        self.snapshots.send_replace(Arc::clone(&snapshot));
        self.subscribers.notify(seq, &snapshot);
        snapshot
    }

    pub(crate) fn current(&self) -> Arc<FleetSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    fn latest(&self) -> (u64, Arc<FleetSnapshot>) {
        let latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        (latest.0, Arc::clone(&latest.1))
    }

    pub(crate) fn watch(&self) -> watch::Receiver<Arc<FleetSnapshot>> {
        self.snapshots.subscribe()
    }

    /// Register, then hand over the latest snapshot unless a concurrent
    /// publish already delivered something newer
    pub(crate) fn subscribe(&self, listener: Listener) -> Subscription {
        let (id, ordered) = self.subscribers.add(listener);
        let (seq, snapshot) = self.latest();
        ordered.deliver(seq, &snapshot);
        Subscription::new(id, &self.subscribers)
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_receives_current_then_updates() {
        let publisher = Publisher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&calls);
        let sub = publisher.subscribe(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        publisher.publish(FleetSnapshot::empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        sub.unsubscribe();
        publisher.publish(FleetSnapshot::empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn test_each_publish_is_a_new_container() {
        let publisher = Publisher::new();
        let machine = Arc::new(Machine::new("m1", "Press", "Press", "Bay 1"));

        let first = publisher.publish(FleetSnapshot {
            machines: vec![Arc::clone(&machine)],
            ..FleetSnapshot::empty()
        });
        let second = publisher.publish(FleetSnapshot {
            machines: vec![Arc::clone(&machine)],
            ..FleetSnapshot::empty()
        });

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first.machines[0], &second.machines[0]));
        assert!(Arc::ptr_eq(&publisher.current(), &second));
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let publisher = Publisher::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::default();

        let inner = Arc::clone(&slot);
        let sub = publisher.subscribe(Arc::new(move |_| {
            if let Ok(mut guard) = inner.try_lock() {
                guard.take();
            }
        }));
        *slot.lock().unwrap() = Some(sub);

        publisher.publish(FleetSnapshot::empty());
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn test_late_current_snapshot_is_not_delivered_after_newer() {
        let publisher = Publisher::new();
        let seen: Arc<Mutex<Vec<i64>>> = Arc::default();

        let (_, ordered) = publisher.subscribers.add({
            let seen = Arc::clone(&seen);
            Arc::new(move |s: Arc<FleetSnapshot>| seen.lock().unwrap().push(s.updated_at))
        });

        // subscriber read the latest snapshot, then a publish overtook it
        let (stale_seq, stale) = publisher.latest();
        publisher.publish(FleetSnapshot {
            updated_at: 42,
            ..FleetSnapshot::empty()
        });
        ordered.deliver(stale_seq, &stale);

        assert_eq!(*seen.lock().unwrap(), vec![42]);
    }

    #[test]
    fn test_subscribe_delivers_latest_once() {
        let publisher = Publisher::new();
        publisher.publish(FleetSnapshot {
            updated_at: 7,
            ..FleetSnapshot::empty()
        });

        let seen: Arc<Mutex<Vec<i64>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let _sub = publisher.subscribe(Arc::new(move |s: Arc<FleetSnapshot>| {
            sink.lock().unwrap().push(s.updated_at)
        }));
        publisher.publish(FleetSnapshot {
            updated_at: 8,
            ..FleetSnapshot::empty()
        });

        assert_eq!(*seen.lock().unwrap(), vec![7, 8]);
    }

    #[tokio::test]
    async fn test_watch_sees_latest() {
        let publisher = Publisher::new();
        let mut rx = publisher.watch();

        publisher.publish(FleetSnapshot {
            connected: true,
            ..FleetSnapshot::empty()
        });

        rx.changed().await.unwrap();
        assert!(rx.borrow().connected);
    }
}
