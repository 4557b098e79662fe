//! Subscription fan-out.
//!
//! Maps directories to connected clients and holds each client's outbound
//! send handle - the unbounded channel drained by its session's writer
//! task, which serializes all writes onto that stream.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

#[derive(Default)]
struct Inner {
    /// directory id -> subscribed client ids
    by_directory: HashMap<String, HashSet<String>>,
    /// client id -> subscribed directory ids
    by_client: HashMap<String, HashSet<String>>,
    /// client id -> outbound frame channel
    senders: HashMap<String, UnboundedSender<Bytes>>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, client_id: &str, directory_id: &str, sender: UnboundedSender<Bytes>) {
        let mut inner = self.inner.write();
        inner
            .by_directory
            .entry(directory_id.to_string())
            .or_default()
            .insert(client_id.to_string());
        inner
            .by_client
            .entry(client_id.to_string())
            .or_default()
            .insert(directory_id.to_string());
        inner.senders.insert(client_id.to_string(), sender);
        debug!(client_id, directory_id, "client subscribed");
    }

    pub fn unsubscribe(&self, client_id: &str, directory_id: &str) {
        let mut inner = self.inner.write();
        if let Some(clients) = inner.by_directory.get_mut(directory_id) {
            clients.remove(client_id);
        }
        if let Some(dirs) = inner.by_client.get_mut(client_id) {
            dirs.remove(directory_id);
        }
        debug!(client_id, directory_id, "client unsubscribed");
    }

    pub fn remove_client(&self, client_id: &str) {
        let mut inner = self.inner.write();
        if let Some(dirs) = inner.by_client.remove(client_id) {
            for dir_id in dirs {
                if let Some(clients) = inner.by_directory.get_mut(&dir_id) {
                    clients.remove(client_id);
                }
            }
        }
        inner.senders.remove(client_id);
        debug!(client_id, "client removed");
    }

    pub fn is_subscribed(&self, client_id: &str, directory_id: &str) -> bool {
        self.inner
            .read()
            .by_directory
            .get(directory_id)
            .map(|clients| clients.contains(client_id))
            .unwrap_or(false)
    }

    /// Deliver one encoded frame to every subscriber of the directory,
    /// skipping `except_client`. Per-subscriber delivery order follows
    /// invocation order; nothing is promised across subscribers.
    pub fn notify_subscribers(&self, directory_id: &str, except_client: &str, frame: Bytes) {
        let inner = self.inner.read();
        let Some(clients) = inner.by_directory.get(directory_id) else {
            return;
        };

        for client_id in clients {
            if client_id == except_client {
                continue;
            }
            match inner.senders.get(client_id) {
                Some(sender) => {
                    if sender.send(frame.clone()).is_err() {
                        warn!(client_id = %client_id, "failed to notify client, stream closed");
                    } else {
                        debug!(client_id = %client_id, "notified client");
                    }
                }
                None => warn!(client_id = %client_id, "subscriber has no send handle"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_subscribe_and_notify() {
        let registry = SubscriptionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        registry.subscribe("client-a", "dir-1", tx_a);
        registry.subscribe("client-b", "dir-1", tx_b);

        registry.notify_subscribers("dir-1", "client-a", Bytes::from_static(b"frame"));

        // The committer receives no echo
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), Bytes::from_static(b"frame"));
    }

    #[test]
    fn test_notify_unknown_directory_is_noop() {
        let registry = SubscriptionRegistry::new();
        registry.notify_subscribers("nope", "", Bytes::from_static(b"x"));
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.subscribe("client-a", "dir-1", tx);
        assert!(registry.is_subscribed("client-a", "dir-1"));

        registry.unsubscribe("client-a", "dir-1");
        assert!(!registry.is_subscribed("client-a", "dir-1"));

        registry.notify_subscribers("dir-1", "", Bytes::from_static(b"x"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remove_client_clears_all_directories() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.subscribe("client-a", "dir-1", tx.clone());
        registry.subscribe("client-a", "dir-2", tx);

        registry.remove_client("client-a");
        assert!(!registry.is_subscribed("client-a", "dir-1"));
        assert!(!registry.is_subscribed("client-a", "dir-2"));

        registry.notify_subscribers("dir-1", "", Bytes::from_static(b"x"));
        registry.notify_subscribers("dir-2", "", Bytes::from_static(b"x"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_per_subscriber_delivery_order() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.subscribe("client-a", "dir-1", tx);

        for i in 0..5u8 {
            registry.notify_subscribers("dir-1", "", Bytes::from(vec![i]));
        }
        for i in 0..5u8 {
            assert_eq!(rx.try_recv().unwrap(), Bytes::from(vec![i]));
        }
    }
}
