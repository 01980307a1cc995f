//! Registry State
//!
//! In-memory indexes over the connected clients: connection key, node id,
//! client id and user id lookups, the channel subscriber index, and the
//! per-address authentication failure counters used for bruteforce
//! protection.
//!
//! # Thread Safety
//!
//! Every index sits behind its own `std::sync::Mutex` and is never held
//! across an await point; dispatch code clones snapshots out before calling
//! into user callbacks, so readers always observe a consistent view.
//!
//! # Invariants
//!
//! - `node_ids`, `client_ids` and `user_ids` reflect exactly the set of
//!   authenticated, connected clients at every quiescent point.
//! - A `subscribers[channel][node_id]` entry exists iff that client is
//!   currently subscribed; removing the last subscriber removes the channel
//!   key.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::server::client::ServerClient;
use crate::server::types::ChannelFilter;

/// Failed attempts from one address within this window trigger rejection
const BRUTEFORCE_WINDOW: Duration = Duration::from_secs(3);

/// Attempts allowed inside the window
const BRUTEFORCE_LIMIT: usize = 3;

/// Connection, identity and subscription indexes
#[derive(Default)]
pub struct Registry {
    key_counter: AtomicU64,
    connected: Mutex<HashMap<String, Arc<ServerClient>>>,
    node_ids: Mutex<HashMap<String, Arc<ServerClient>>>,
    client_ids: Mutex<HashMap<String, Arc<ServerClient>>>,
    user_ids: Mutex<HashMap<String, Vec<Arc<ServerClient>>>>,
    subscribers: Mutex<HashMap<String, HashMap<String, ChannelFilter>>>,
    auth_attempts: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl Registry {
    /// Next connection key
    pub fn next_key(&self) -> String {
        (self.key_counter.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Track an accepted connection
    pub fn add_connected(&self, client: Arc<ServerClient>) {
        self.connected
            .lock()
            .unwrap()
            .insert(client.key.clone(), client);
    }

    /// Drop a connection by key
    pub fn remove_connected(&self, key: &str) {
        self.connected.lock().unwrap().remove(key);
    }

    /// Snapshot of every tracked connection
    pub fn connected(&self) -> Vec<Arc<ServerClient>> {
        self.connected.lock().unwrap().values().cloned().collect()
    }

    /// Number of tracked connections
    pub fn connected_count(&self) -> usize {
        self.connected.lock().unwrap().len()
    }

    /// Take the current holder of a node id, if any. Used for zombie
    /// eviction before the new holder is inserted.
    pub fn take_node(&self, node_id: &str) -> Option<Arc<ServerClient>> {
        self.node_ids.lock().unwrap().remove(node_id)
    }

    /// Index an authenticated client under its identity
    pub fn register_identity(
        &self,
        node_id: &str,
        client_id: &str,
        user_id: Option<&str>,
        client: Arc<ServerClient>,
    ) {
        self.node_ids
            .lock()
            .unwrap()
            .insert(node_id.to_string(), client.clone());
        self.client_ids
            .lock()
            .unwrap()
            .insert(client_id.to_string(), client.clone());
        if let Some(user_id) = user_id {
            self.user_ids
                .lock()
                .unwrap()
                .entry(user_id.to_string())
                .or_default()
                .push(client);
        }
    }

    /// Remove a client from the identity indexes.
    ///
    /// Entries are only removed when they still point at this client, so a
    /// zombie being destroyed cannot evict the connection that took over
    /// its node id.
    pub fn remove_identity(
        &self,
        node_id: &str,
        client_id: &str,
        user_id: Option<&str>,
        client: &Arc<ServerClient>,
    ) {
        let mut node_ids = self.node_ids.lock().unwrap();
        if node_ids
            .get(node_id)
            .is_some_and(|held| Arc::ptr_eq(held, client))
        {
            node_ids.remove(node_id);
        }
        drop(node_ids);

        let mut client_ids = self.client_ids.lock().unwrap();
        if client_ids
            .get(client_id)
            .is_some_and(|held| Arc::ptr_eq(held, client))
        {
            client_ids.remove(client_id);
        }
        drop(client_ids);

        if let Some(user_id) = user_id {
            let mut user_ids = self.user_ids.lock().unwrap();
            if let Some(clients) = user_ids.get_mut(user_id) {
                clients.retain(|held| !Arc::ptr_eq(held, client));
                if clients.is_empty() {
                    user_ids.remove(user_id);
                }
            }
        }
    }

    /// Connected client holding this node id
    pub fn client_by_node(&self, node_id: &str) -> Option<Arc<ServerClient>> {
        self.node_ids.lock().unwrap().get(node_id).cloned()
    }

    /// Connected client holding this client id
    pub fn client_by_client_id(&self, client_id: &str) -> Option<Arc<ServerClient>> {
        self.client_ids.lock().unwrap().get(client_id).cloned()
    }

    /// Every connected client of a user
    pub fn clients_by_user(&self, user_id: &str) -> Vec<Arc<ServerClient>> {
        self.user_ids
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Record a subscription. Returns `true` when the channel key is new.
    pub fn set_subscriber(&self, channel: &str, node_id: &str, filter: ChannelFilter) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap();
        let is_new = !subscribers.contains_key(channel);
        subscribers
            .entry(channel.to_string())
            .or_default()
            .insert(node_id.to_string(), filter);
        is_new
    }

    /// Remove a subscription. Returns `true` when the entry existed. The
    /// channel key goes away with its last subscriber.
    pub fn remove_subscriber(&self, channel: &str, node_id: &str) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap();
        let Some(nodes) = subscribers.get_mut(channel) else {
            return false;
        };
        let removed = nodes.remove(node_id).is_some();
        if nodes.is_empty() {
            subscribers.remove(channel);
        }
        removed
    }

    /// Drop every subscription of one node. Returns the channels it left.
    pub fn remove_node_subscriptions(&self, node_id: &str) -> Vec<String> {
        let mut subscribers = self.subscribers.lock().unwrap();
        let mut left = Vec::new();
        subscribers.retain(|channel, nodes| {
            if nodes.remove(node_id).is_some() {
                left.push(channel.clone());
            }
            !nodes.is_empty()
        });
        left
    }

    /// Snapshot of one channel's subscribers
    pub fn channel_subscribers(&self, channel: &str) -> Vec<(String, ChannelFilter)> {
        self.subscribers
            .lock()
            .unwrap()
            .get(channel)
            .map(|nodes| {
                nodes
                    .iter()
                    .map(|(node_id, filter)| (node_id.clone(), filter.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether a node is subscribed to a channel
    pub fn has_subscriber(&self, channel: &str, node_id: &str) -> bool {
        self.subscribers
            .lock()
            .unwrap()
            .get(channel)
            .is_some_and(|nodes| nodes.contains_key(node_id))
    }

    /// Channel names with at least one subscriber
    pub fn subscribed_channels(&self) -> Vec<String> {
        self.subscribers.lock().unwrap().keys().cloned().collect()
    }

    /// Record one failed authentication from an address
    pub fn record_auth_failure(&self, ip: IpAddr) {
        let mut attempts = self.auth_attempts.lock().unwrap();
        let entries = attempts.entry(ip).or_default();
        let now = Instant::now();
        entries.retain(|at| now.duration_since(*at) < BRUTEFORCE_WINDOW);
        entries.push(now);
    }

    /// Whether an address has exhausted its attempts for the window
    pub fn is_bruteforce(&self, ip: IpAddr) -> bool {
        let mut attempts = self.auth_attempts.lock().unwrap();
        let Some(entries) = attempts.get_mut(&ip) else {
            return false;
        };
        let now = Instant::now();
        entries.retain(|at| now.duration_since(*at) < BRUTEFORCE_WINDOW);
        if entries.is_empty() {
            attempts.remove(&ip);
            return false;
        }
        entries.len() >= BRUTEFORCE_LIMIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_sequential() {
        let registry = Registry::default();
        assert_eq!(registry.next_key(), "1");
        assert_eq!(registry.next_key(), "2");
    }

    #[test]
    fn test_subscriber_channel_key_lifecycle() {
        let registry = Registry::default();
        assert!(registry.set_subscriber("user/10", "10:a", ChannelFilter::All));
        assert!(!registry.set_subscriber("user/10", "10:b", ChannelFilter::All));
        assert!(registry.has_subscriber("user/10", "10:a"));

        assert!(registry.remove_subscriber("user/10", "10:a"));
        assert!(registry.has_subscriber("user/10", "10:b"));
        assert!(registry.remove_subscriber("user/10", "10:b"));
        assert!(registry.subscribed_channels().is_empty());
        assert!(!registry.remove_subscriber("user/10", "10:b"));
    }

    #[test]
    fn test_remove_node_subscriptions() {
        let registry = Registry::default();
        registry.set_subscriber("user/10", "10:a", ChannelFilter::All);
        registry.set_subscriber("posts", "10:a", ChannelFilter::All);
        registry.set_subscriber("posts", "20:b", ChannelFilter::All);

        let mut left = registry.remove_node_subscriptions("10:a");
        left.sort();
        assert_eq!(left, vec!["posts", "user/10"]);
        assert_eq!(registry.subscribed_channels(), vec!["posts"]);
    }

    #[test]
    fn test_bruteforce_counter() {
        let registry = Registry::default();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(!registry.is_bruteforce(ip));

        registry.record_auth_failure(ip);
        registry.record_auth_failure(ip);
        assert!(!registry.is_bruteforce(ip));

        registry.record_auth_failure(ip);
        assert!(registry.is_bruteforce(ip));

        let other: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(!registry.is_bruteforce(other));
    }
}
