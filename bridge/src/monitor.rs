//! Monitor broadcast: diagnostic log lines for monitoring clients.
//!
//! Monitoring clients are their own pool, independent of control clients.
//! Delivery is best-effort: a client whose queue is full or closed misses
//! that entry and the broadcaster moves on.
//!
//! Nothing in this module emits tracing events. When tracing output is
//! forwarded to monitors, a tracing call here would feed back into itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::connection::{ClientHandle, ClientId};

/// A timestamped log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub text: String,
}

#[derive(Serialize)]
struct LogMessage<'a> {
    log: &'a str,
    at: i64,
}

impl LogEntry {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            text: text.into(),
        }
    }

    /// Wire form: `{"log": <text>, "at": <unix millis>}`.
    pub fn to_json(&self) -> String {
        let msg = LogMessage {
            log: &self.text,
            at: self.at.timestamp_millis(),
        };
        serde_json::to_string(&msg).unwrap_or_default()
    }
}

/// Registry of monitoring clients.
#[derive(Clone, Default)]
pub struct MonitorHub {
    clients: Arc<RwLock<HashMap<ClientId, ClientHandle>>>,
    sent: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
}

impl MonitorHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ClientHandle) {
        self.clients.write().insert(handle.id(), handle);
    }

    pub fn unregister(&self, id: ClientId) {
        self.clients.write().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Deliver `entry` to every monitoring client that can take it now.
    ///
    /// Never waits. Returns the number of clients reached.
    pub fn broadcast(&self, entry: &LogEntry) -> usize {
        let text: Arc<str> = Arc::from(entry.to_json());
        let clients = self.clients.read();
        let mut reached = 0;
        for handle in clients.values() {
            if handle.try_send(Arc::clone(&text)) {
                reached += 1;
            } else {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sent.fetch_add(reached as u64, Ordering::Relaxed);
        reached
    }

    /// Broadcast a line stamped now.
    pub fn log(&self, text: impl Into<String>) -> usize {
        self.broadcast(&LogEntry::new(text))
    }

    /// Entries delivered and skipped since startup.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_wire_format() {
        let entry = LogEntry::new("command sent: move");
        let v: serde_json::Value = serde_json::from_str(&entry.to_json()).unwrap();
        assert_eq!(v["log"], "command sent: move");
        assert_eq!(v["at"], entry.at.timestamp_millis());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let hub = MonitorHub::new();
        let (a, mut rx_a) = ClientHandle::channel(4);
        let (b, mut rx_b) = ClientHandle::channel(4);
        hub.register(a);
        hub.register(b);

        assert_eq!(hub.log("hello"), 2);
        assert!(rx_a.recv().await.unwrap().contains("\"log\":\"hello\""));
        assert!(rx_b.recv().await.unwrap().contains("\"log\":\"hello\""));
    }

    #[tokio::test]
    async fn slow_and_closed_clients_are_skipped() {
        let hub = MonitorHub::new();
        let (slow, _rx_slow) = ClientHandle::channel(1);
        let (gone, rx_gone) = ClientHandle::channel(4);
        let (ok, mut rx_ok) = ClientHandle::channel(4);
        hub.register(slow);
        hub.register(gone);
        hub.register(ok);
        drop(rx_gone);

        assert_eq!(hub.log("one"), 2);
        // `slow` is now full.
        assert_eq!(hub.log("two"), 1);
        assert!(rx_ok.recv().await.unwrap().contains("one"));
        assert!(rx_ok.recv().await.unwrap().contains("two"));
        assert_eq!(hub.counters(), (3, 3));
    }

    #[test]
    fn unregister_removes_client() {
        let hub = MonitorHub::new();
        let (a, _rx) = ClientHandle::channel(4);
        let id = a.id();
        hub.register(a);
        assert_eq!(hub.len(), 1);
        hub.unregister(id);
        assert!(hub.is_empty());
        assert_eq!(hub.log("nobody"), 0);
    }
}
