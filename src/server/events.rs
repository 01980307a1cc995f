//! Server Event Bus
//!
//! Every observable server-side happening flows through one enumerated
//! event type on a `tokio::sync::broadcast` channel. The bus doubles as the
//! reporting surface: each event is logged through `tracing` at emit time,
//! and tests subscribe to the same channel to assert report sequences.
//!
//! Losing an event because no receiver is attached is fine; the broadcast
//! sender keeps working with zero subscribers.

use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::shared::{Action, Meta};

/// Enumerated server events.
///
/// One variant per report named by the protocol: connection lifecycle, log
/// lifecycle, subscription lifecycle, and the error taxonomy.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection was accepted
    Connected {
        /// Connection key
        client_key: String,
    },
    /// A connection closed normally
    Disconnected {
        /// Connection key
        client_key: String,
    },
    /// A client passed authentication
    Authenticated {
        /// Authenticated node id
        node_id: String,
        /// Connection key
        client_key: String,
    },
    /// A client failed authentication
    Unauthenticated {
        /// Rejected node id
        node_id: String,
        /// Connection key
        client_key: String,
    },
    /// A connection was evicted because its node id was taken over
    Zombie {
        /// Node id that was taken over
        node_id: String,
    },
    /// An entry was added to the log
    Add {
        /// The action
        action: Action,
        /// Meta as stored
        meta: Meta,
    },
    /// An entry was removed from the log
    Clean {
        /// The action
        action: Action,
        /// Meta at removal
        meta: Meta,
    },
    /// A processed action had no processor and no addressing
    Useless {
        /// The action
        action: Action,
        /// Meta as stored
        meta: Meta,
    },
    /// An action reached its terminal processed state
    Processed {
        /// Action id
        id: String,
        /// Time from add to processed
        latency: Duration,
    },
    /// First subscriber appeared on a channel
    Subscribing {
        /// Channel name
        channel: String,
        /// Subscribing node id
        node_id: String,
    },
    /// A subscription completed
    Subscribed {
        /// Channel name
        channel: String,
        /// Subscribed node id
        node_id: String,
        /// Time from add to subscribed
        latency: Duration,
    },
    /// A subscription was removed
    Unsubscribed {
        /// Channel name
        channel: String,
        /// Unsubscribed node id
        node_id: String,
    },
    /// The subscriber disappeared while its subscription was initializing
    SubscriptionCancelled {
        /// Channel name
        channel: String,
        /// Node id that went away
        node_id: String,
    },
    /// An action was denied by an authorizer
    Denied {
        /// Denied action id
        id: String,
    },
    /// An action had a type nobody registered
    UnknownType {
        /// Action id
        id: String,
        /// The unknown type
        type_name: String,
    },
    /// A subscription referenced a channel nobody registered
    WrongChannel {
        /// Action id
        id: String,
        /// The channel, when it was at least a string
        channel: Option<String>,
    },
    /// A server-side error
    Error {
        /// Related action id, when there is one
        id: Option<String>,
        /// Error message
        message: String,
    },
    /// A wire-level error reported by a peer
    ClientError {
        /// Error message
        message: String,
    },
    /// An unrecoverable error; the process should exit
    Fatal {
        /// Error message
        message: String,
    },
    /// A control request came from outside the allowed mask
    WrongControlIp {
        /// Offending source address
        ip: IpAddr,
    },
    /// A control request carried a bad secret
    WrongControlSecret {
        /// Source address
        ip: IpAddr,
    },
}

/// Broadcast bus for [`ServerEvent`]s.
///
/// Cloneable handle; every emit is also traced so the log output doubles as
/// the report stream.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attach a new receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Report and broadcast an event.
    ///
    /// Returns the number of receivers that got the event.
    pub fn emit(&self, event: ServerEvent) -> usize {
        report(&event);
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Trace one event in the report style
fn report(event: &ServerEvent) {
    match event {
        ServerEvent::Connected { client_key } => {
            tracing::info!("[Client] Connection {} accepted", client_key);
        }
        ServerEvent::Disconnected { client_key } => {
            tracing::info!("[Client] Connection {} closed", client_key);
        }
        ServerEvent::Authenticated {
            node_id,
            client_key,
        } => {
            tracing::info!("[Auth] {} authenticated on connection {}", node_id, client_key);
        }
        ServerEvent::Unauthenticated {
            node_id,
            client_key,
        } => {
            tracing::warn!("[Auth] {} failed authentication on connection {}", node_id, client_key);
        }
        ServerEvent::Zombie { node_id } => {
            tracing::info!("[Auth] {} was taken over by a newer connection", node_id);
        }
        ServerEvent::Add { action, meta } => {
            tracing::debug!("[Log] Added {} ({})", meta.id, action.type_name);
        }
        ServerEvent::Clean { meta, .. } => {
            tracing::debug!("[Log] Cleaned {}", meta.id);
        }
        ServerEvent::Useless { action, meta } => {
            tracing::debug!("[Log] {} ({}) has nobody to go to", meta.id, action.type_name);
        }
        ServerEvent::Processed { id, latency } => {
            tracing::info!("[Pipeline] Processed {} in {:?}", id, latency);
        }
        ServerEvent::Subscribing { channel, node_id } => {
            tracing::debug!("[Channels] {} subscribing to {}", node_id, channel);
        }
        ServerEvent::Subscribed {
            channel,
            node_id,
            latency,
        } => {
            tracing::info!("[Channels] {} subscribed to {} in {:?}", node_id, channel, latency);
        }
        ServerEvent::Unsubscribed { channel, node_id } => {
            tracing::info!("[Channels] {} unsubscribed from {}", node_id, channel);
        }
        ServerEvent::SubscriptionCancelled { channel, node_id } => {
            tracing::debug!("[Channels] {} went away while subscribing to {}", node_id, channel);
        }
        ServerEvent::Denied { id } => {
            tracing::warn!("[Pipeline] Action {} was denied", id);
        }
        ServerEvent::UnknownType { id, type_name } => {
            tracing::warn!("[Pipeline] Action {} has unknown type {}", id, type_name);
        }
        ServerEvent::WrongChannel { id, channel } => {
            tracing::warn!(
                "[Channels] Action {} subscribed to wrong channel {}",
                id,
                channel.as_deref().unwrap_or("<not a string>")
            );
        }
        ServerEvent::Error { id, message } => match id {
            Some(id) => tracing::error!("[Server] Error on action {}: {}", id, message),
            None => tracing::error!("[Server] Error: {}", message),
        },
        ServerEvent::ClientError { message } => {
            tracing::warn!("[Client] Peer error: {}", message);
        }
        ServerEvent::Fatal { message } => {
            tracing::error!("[Server] Fatal: {}", message);
        }
        ServerEvent::WrongControlIp { ip } => {
            tracing::warn!("[Control] Request from {} outside the control mask", ip);
        }
        ServerEvent::WrongControlSecret { ip } => {
            tracing::warn!("[Control] Request from {} with a wrong secret", ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(ServerEvent::Denied {
            id: "1 10:uuid 0".into(),
        });
        match rx.recv().await.unwrap() {
            ServerEvent::Denied { id } => assert_eq!(id, "1 10:uuid 0"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new(16);
        assert_eq!(
            bus.emit(ServerEvent::Connected {
                client_key: "1".into()
            }),
            0
        );
    }
}
