//! Sync Peer Contract
//!
//! The wire codec and framing of the sync protocol live outside this crate.
//! The server consumes peers through this trait: it pushes outbound actions
//! and handshake verdicts in, and receives the peer's happenings over an
//! mpsc channel in wire order.
//!
//! Implementations own ping/timeout enforcement; when the remote goes
//! silent past the configured timeout the peer closes itself and sends
//! `Disconnect`.

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::shared::{Action, Meta, ProtocolErrorKind};

/// Happenings of one peer, delivered in wire order
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The remote completed its handshake frame
    Connect {
        /// Remote node id
        node_id: String,
        /// Remote subprotocol version
        subprotocol: String,
        /// Credentials from the handshake
        credentials: Option<Value>,
        /// Transport headers (cookies, proxy data)
        headers: Map<String, Value>,
    },
    /// The remote synchronized an action
    Action {
        /// The action
        action: Action,
        /// Client-supplied meta
        meta: Meta,
    },
    /// The peer hit a wire-level error
    Error {
        /// Violation kind
        kind: ProtocolErrorKind,
        /// Detail
        message: String,
    },
    /// The transport closed
    Disconnect,
}

/// Channel carrying a peer's events to its server client
pub type PeerEventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

/// Sending half handed to peer implementations
pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// Per-connection wire state machine, seen from the server side
pub trait SyncPeer: Send + Sync {
    /// Enqueue an outbound action
    fn send_action(&self, action: &Action, meta: &Meta);

    /// Send a `['debug', 'error', message]` frame. Development only.
    fn send_debug(&self, message: &str);

    /// Complete the handshake positively
    fn accept(&self);

    /// Refuse the handshake with a protocol error and close
    fn reject(&self, kind: ProtocolErrorKind);

    /// Close the transport
    fn disconnect(&self);

    /// Whether the transport is still open
    fn is_connected(&self) -> bool;
}
