//! Shared test helpers: the sync peer double, a wired test server, and an
//! event recorder for report-sequence assertions.

#![allow(dead_code)]

pub mod peer;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};

use synclog::log::TestTime;
use synclog::server::{
    Env, PeerEvent, PeerEventSender, Server, ServerClient, ServerEvent, ServerOptions,
};
use synclog::shared::{Action, Meta};

pub use peer::{wait_until, TestPeer};

/// Server with a deterministic clock, development env, and allow-all auth
pub fn test_server() -> Server {
    let server = test_server_without_auth();
    server.auth(|_request| async move { Ok(true) });
    server
}

/// Same, but with the authenticator left for the test to register
pub fn test_server_without_auth() -> Server {
    Server::new(test_options()).unwrap()
}

pub fn test_options() -> ServerOptions {
    ServerOptions {
        time: Some(Box::new(TestTime::new())),
        env: Some(Env::Development),
        ..ServerOptions::new("1.0.0", "^1.0.0")
    }
}

/// One simulated connection: the peer double, its event injector, and the
/// server-side client handle
pub struct TestClient {
    pub peer: Arc<TestPeer>,
    pub events: PeerEventSender,
    pub client: Arc<ServerClient>,
}

impl TestClient {
    /// Send the handshake frame without credentials
    pub fn handshake(&self) {
        self.handshake_with(None);
    }

    pub fn handshake_with(&self, credentials: Option<Value>) {
        self.events
            .send(PeerEvent::Connect {
                node_id: self.peer.node_id.clone(),
                subprotocol: self.peer.subprotocol.clone(),
                credentials,
                headers: Map::new(),
            })
            .unwrap();
    }

    /// Handshake and wait for acceptance
    pub async fn authenticate(&self) {
        self.handshake();
        self.peer.wait_accepted().await;
    }

    /// Synchronize one action with the given id
    pub fn send_action(&self, action: Action, id: &str) {
        let mut meta = Meta::with_id(id);
        meta.time = 1;
        self.events
            .send(PeerEvent::Action { action, meta })
            .unwrap();
    }

    /// Synchronize one action with caller-built meta
    pub fn send_action_with_meta(&self, action: Action, meta: Meta) {
        self.events
            .send(PeerEvent::Action { action, meta })
            .unwrap();
    }

    pub fn disconnect(&self) {
        let _ = self.events.send(PeerEvent::Disconnect);
    }
}

/// Attach a simulated connection from 127.0.0.1
pub fn connect(server: &Server, node_id: &str) -> TestClient {
    connect_from(server, node_id, "127.0.0.1")
}

pub fn connect_from(server: &Server, node_id: &str, ip: &str) -> TestClient {
    let (events, rx) = mpsc::unbounded_channel();
    let peer = TestPeer::new(node_id, "1.0.0");
    let client = server.add_connection(peer.clone(), rx, ip.parse().unwrap());
    TestClient {
        peer,
        events,
        client,
    }
}

/// Collects server events for report-sequence assertions
pub struct EventRecorder {
    rx: broadcast::Receiver<ServerEvent>,
    seen: Vec<ServerEvent>,
}

impl EventRecorder {
    pub fn new(server: &Server) -> Self {
        Self {
            rx: server.subscribe_events(),
            seen: Vec::new(),
        }
    }

    /// Wait for an event matching the predicate, recording everything on
    /// the way
    pub async fn wait_for<F>(&mut self, predicate: F) -> ServerEvent
    where
        F: Fn(&ServerEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = self.rx.recv().await.expect("event bus closed");
                self.seen.push(event.clone());
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Names of every event recorded so far
    pub fn names(&self) -> Vec<&'static str> {
        self.seen.iter().map(event_name).collect()
    }

    /// Whether the recorded names contain the given subsequence
    pub fn saw_sequence(&self, expected: &[&str]) -> bool {
        let names = self.names();
        let mut position = 0;
        for name in names {
            if position < expected.len() && name == expected[position] {
                position += 1;
            }
        }
        position == expected.len()
    }
}

pub fn event_name(event: &ServerEvent) -> &'static str {
    match event {
        ServerEvent::Connected { .. } => "connect",
        ServerEvent::Disconnected { .. } => "disconnect",
        ServerEvent::Authenticated { .. } => "authenticated",
        ServerEvent::Unauthenticated { .. } => "unauthenticated",
        ServerEvent::Zombie { .. } => "zombie",
        ServerEvent::Add { .. } => "add",
        ServerEvent::Clean { .. } => "clean",
        ServerEvent::Useless { .. } => "useless",
        ServerEvent::Processed { .. } => "processed",
        ServerEvent::Subscribing { .. } => "subscribing",
        ServerEvent::Subscribed { .. } => "subscribed",
        ServerEvent::Unsubscribed { .. } => "unsubscribed",
        ServerEvent::SubscriptionCancelled { .. } => "subscriptionCancelled",
        ServerEvent::Denied { .. } => "denied",
        ServerEvent::UnknownType { .. } => "unknownType",
        ServerEvent::WrongChannel { .. } => "wrongChannel",
        ServerEvent::Error { .. } => "error",
        ServerEvent::ClientError { .. } => "clientError",
        ServerEvent::Fatal { .. } => "fatal",
        ServerEvent::WrongControlIp { .. } => "wrongControlIp",
        ServerEvent::WrongControlSecret { .. } => "wrongControlSecret",
    }
}
