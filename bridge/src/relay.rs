//! Telemetry relay: last-value-wins fan-out of hardware events.
//!
//! Producers call [`TelemetryRelay::publish`], which only overwrites the
//! pending slot for the event's channel. A periodic flush per
//! [`TelemetryKind`] takes whatever is pending and sends it to every
//! subscriber of that channel, so a burst between two flushes costs one
//! message per channel, not one per event.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use carlink_codec::{TelemetryEvent, TelemetryKind};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::RelayConfig;
use crate::connection::{ClientHandle, ClientId};

/// Subscription tag matching every channel.
pub const ALL_CHANNELS: &str = "*";

struct Subscriber {
    handle: ClientHandle,
    tags: HashSet<String>,
}

impl Subscriber {
    fn wants(&self, channel: &str) -> bool {
        self.tags.contains(ALL_CHANNELS) || self.tags.contains(channel)
    }
}

/// Relay counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStats {
    /// Events accepted from producers.
    pub published: u64,
    /// Events overwritten before they were flushed.
    pub superseded: u64,
    /// Messages queued to subscribers.
    pub delivered: u64,
    /// Messages a subscriber could not take.
    pub dropped: u64,
}

struct RelayInner {
    config: RelayConfig,
    pending: Mutex<HashMap<TelemetryKind, HashMap<String, TelemetryEvent>>>,
    subscribers: RwLock<HashMap<ClientId, Subscriber>>,
    published: AtomicU64,
    superseded: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Shared relay handle.
#[derive(Clone)]
pub struct TelemetryRelay {
    inner: Arc<RelayInner>,
}

impl TelemetryRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                config,
                pending: Mutex::new(HashMap::new()),
                subscribers: RwLock::new(HashMap::new()),
                published: AtomicU64::new(0),
                superseded: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Store `event` as the latest for its channel.
    pub fn publish(&self, event: TelemetryEvent) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.inner.pending.lock();
        let slots = pending.entry(event.kind()).or_default();
        if slots.insert(event.channel().to_string(), event).is_some() {
            self.inner.superseded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Send every pending event of `kind` to its subscribers.
    ///
    /// Returns the number of messages queued.
    pub fn flush(&self, kind: TelemetryKind) -> usize {
        let events = match self.inner.pending.lock().get_mut(&kind) {
            Some(slots) if !slots.is_empty() => std::mem::take(slots),
            _ => return 0,
        };

        let subscribers = self.inner.subscribers.read();
        let mut delivered = 0;
        let mut dropped = 0;
        for (channel, event) in events {
            let text = match serde_json::to_string(&event.to_message()) {
                Ok(text) => Arc::<str>::from(text),
                Err(e) => {
                    debug!("Skipping unserializable {} event: {}", channel, e);
                    continue;
                }
            };
            for sub in subscribers.values().filter(|s| s.wants(&channel)) {
                if sub.handle.try_send(Arc::clone(&text)) {
                    delivered += 1;
                } else {
                    dropped += 1;
                }
            }
        }
        drop(subscribers);

        self.inner
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.inner.dropped.fetch_add(dropped, Ordering::Relaxed);
        if dropped > 0 {
            trace!("{} telemetry flush dropped {} messages", kind.as_str(), dropped);
        }
        delivered
    }

    /// Add a subscriber, or replace an existing one's tags.
    pub fn subscribe<I, S>(&self, handle: ClientHandle, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags = tags.into_iter().map(Into::into).collect();
        self.inner
            .subscribers
            .write()
            .insert(handle.id(), Subscriber { handle, tags });
    }

    /// Add tags for an existing subscriber.
    pub fn add_tags<I, S>(&self, id: ClientId, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(sub) = self.inner.subscribers.write().get_mut(&id) {
            sub.tags.extend(tags.into_iter().map(Into::into));
        }
    }

    /// Remove tags for an existing subscriber.
    pub fn remove_tags<I, S>(&self, id: ClientId, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if let Some(sub) = self.inner.subscribers.write().get_mut(&id) {
            for tag in tags {
                sub.tags.remove(tag.as_ref());
            }
        }
    }

    /// Tags of a subscriber, sorted.
    pub fn tags(&self, id: ClientId) -> Option<Vec<String>> {
        self.inner.subscribers.read().get(&id).map(|s| {
            let mut tags: Vec<String> = s.tags.iter().cloned().collect();
            tags.sort();
            tags
        })
    }

    /// Drop a subscriber from every tag at once.
    pub fn remove(&self, id: ClientId) {
        self.inner.subscribers.write().remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            published: self.inner.published.load(Ordering::Relaxed),
            superseded: self.inner.superseded.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    /// Start one flush timer per kind. Timers stop when `cancel` fires.
    pub fn spawn_flushers(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        TelemetryKind::ALL
            .into_iter()
            .map(|kind| {
                let relay = self.clone();
                let cancel = cancel.clone();
                let period = self.inner.config.interval(kind);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = ticker.tick() => {
                                relay.flush(kind);
                            }
                        }
                    }
                    debug!("{} flusher stopped", kind.as_str());
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn relay() -> TelemetryRelay {
        TelemetryRelay::new(RelayConfig::default())
    }

    fn recv_json(rx: &mut mpsc::Receiver<Arc<str>>) -> Option<Value> {
        rx.try_recv()
            .ok()
            .map(|text| serde_json::from_str(&text).unwrap())
    }

    #[test]
    fn only_latest_event_per_window() {
        let relay = relay();
        let (handle, mut rx) = ClientHandle::channel(16);
        relay.subscribe(handle, [ALL_CHANNELS]);

        for i in 1..=5 {
            relay.publish(TelemetryEvent::camera("camera", format!("frame-{}", i)));
        }
        assert_eq!(relay.flush(TelemetryKind::Camera), 1);
        assert_eq!(
            recv_json(&mut rx),
            Some(json!({"channel": "camera", "data": "frame-5"}))
        );
        assert_eq!(recv_json(&mut rx), None);

        // Nothing new since the last flush.
        assert_eq!(relay.flush(TelemetryKind::Camera), 0);
        assert_eq!(relay.stats().superseded, 4);
    }

    #[test]
    fn kinds_flush_independently() {
        let relay = relay();
        let (handle, mut rx) = ClientHandle::channel(16);
        relay.subscribe(handle, [ALL_CHANNELS]);

        relay.publish(TelemetryEvent::sensor("speed", 1.5));
        relay.publish(TelemetryEvent::camera("camera", "img"));

        assert_eq!(relay.flush(TelemetryKind::Sensor), 1);
        assert_eq!(recv_json(&mut rx).unwrap()["channel"], "speed");
        assert_eq!(recv_json(&mut rx), None);

        assert_eq!(relay.flush(TelemetryKind::Camera), 1);
        assert_eq!(recv_json(&mut rx).unwrap()["channel"], "camera");
    }

    #[test]
    fn subscription_is_per_tag() {
        let relay = relay();
        let (speed_only, mut rx_speed) = ClientHandle::channel(16);
        let (everything, mut rx_all) = ClientHandle::channel(16);
        let speed_id = speed_only.id();
        relay.subscribe(speed_only, ["speed"]);
        relay.subscribe(everything, [ALL_CHANNELS]);

        relay.publish(TelemetryEvent::sensor("speed", 1.0));
        relay.publish(TelemetryEvent::sensor("battery", 80));
        assert_eq!(relay.flush(TelemetryKind::Sensor), 3);

        assert_eq!(recv_json(&mut rx_speed).unwrap()["channel"], "speed");
        assert_eq!(recv_json(&mut rx_speed), None);
        assert!(recv_json(&mut rx_all).is_some());
        assert!(recv_json(&mut rx_all).is_some());

        relay.add_tags(speed_id, ["battery"]);
        relay.remove_tags(speed_id, ["speed"]);
        assert_eq!(relay.tags(speed_id), Some(vec!["battery".to_string()]));

        relay.publish(TelemetryEvent::sensor("speed", 2.0));
        relay.flush(TelemetryKind::Sensor);
        assert_eq!(recv_json(&mut rx_speed), None);
    }

    #[test]
    fn removed_client_gets_nothing() {
        let relay = relay();
        let (handle, mut rx) = ClientHandle::channel(16);
        let id = handle.id();
        relay.subscribe(handle, ["speed", "battery", "camera"]);
        relay.remove(id);
        assert_eq!(relay.subscriber_count(), 0);

        relay.publish(TelemetryEvent::sensor("speed", 1.0));
        assert_eq!(relay.flush(TelemetryKind::Sensor), 0);
        assert_eq!(recv_json(&mut rx), None);
    }

    #[test]
    fn full_subscriber_does_not_block_others() {
        let relay = relay();
        let (slow, _rx_slow) = ClientHandle::channel(1);
        let (fast, mut rx_fast) = ClientHandle::channel(16);
        relay.subscribe(slow, [ALL_CHANNELS]);
        relay.subscribe(fast, [ALL_CHANNELS]);

        relay.publish(TelemetryEvent::sensor("a", 1));
        relay.publish(TelemetryEvent::sensor("b", 2));
        relay.flush(TelemetryKind::Sensor);

        assert!(recv_json(&mut rx_fast).is_some());
        assert!(recv_json(&mut rx_fast).is_some());
        let stats = relay.stats();
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flusher_delivers_on_its_cadence() {
        let relay = relay();
        let (handle, mut rx) = ClientHandle::channel(16);
        relay.subscribe(handle, [ALL_CHANNELS]);
        let cancel = CancellationToken::new();
        let tasks = relay.spawn_flushers(cancel.clone());

        // Let the immediate first ticks pass.
        tokio::time::sleep(Duration::from_millis(1)).await;

        for i in 1..=5 {
            relay.publish(TelemetryEvent::camera("camera", format!("frame-{}", i)));
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        let msg: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["data"], "frame-5");
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
