//! Server Client
//!
//! One instance per accepted connection. Wraps the connection's sync peer
//! and drives its event stream: handshake and authentication (with
//! bruteforce gating and zombie eviction), the inbound action filter, and
//! idempotent teardown that prunes every index the client appears in.
//!
//! # State Machine
//!
//! `new → connected → authenticating → (authenticated | rejected)`, then
//! `synchronizing ⇆ idle` while actions are in flight. `destroyed` is
//! reachable from every state. The `zombie` flag is set right before an
//! eviction destroy to suppress the disconnect report.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use semver::Version;
use serde_json::{Map, Value};

use crate::server::channels::deny_action;
use crate::server::core::ServerCore;
use crate::server::events::ServerEvent;
use crate::server::peer::{PeerEvent, PeerEventReceiver, SyncPeer};
use crate::server::pipeline::{debug_frame, proxy_verdict, undo};
use crate::proxy::ProxyError;
use crate::shared::{
    parse_node_id, Action, Meta, ParsedId, ProtocolError, ProtocolErrorKind,
};

/// Lifecycle state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created, transport not confirmed yet
    New,
    /// Transport accepted
    Connected,
    /// Handshake received, authenticator running
    Authenticating,
    /// Identity established and indexed
    Authenticated,
    /// Handshake refused
    Rejected,
    /// Actions in flight
    Synchronizing,
    /// Authenticated and quiet
    Idle,
    /// Torn down
    Destroyed,
}

#[derive(Debug, Clone)]
struct ClientIdentity {
    node_id: String,
    client_id: String,
    user_id: Option<String>,
}

/// One connected (or connecting) client
pub struct ServerClient {
    /// Connection key, unique per server instance
    pub key: String,
    /// Remote address, snapshotted at accept time
    pub remote_ip: IpAddr,
    core: Arc<ServerCore>,
    peer: Arc<dyn SyncPeer>,
    identity: Mutex<Option<ClientIdentity>>,
    subprotocol: Mutex<Option<String>>,
    state: Mutex<ClientState>,
    zombie: AtomicBool,
    destroyed: AtomicBool,
    in_flight: AtomicUsize,
}

impl ServerClient {
    pub(crate) fn new(
        core: Arc<ServerCore>,
        peer: Arc<dyn SyncPeer>,
        remote_ip: IpAddr,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: core.registry.next_key(),
            remote_ip,
            core,
            peer,
            identity: Mutex::new(None),
            subprotocol: Mutex::new(None),
            state: Mutex::new(ClientState::New),
            zombie: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Drive the peer's event stream until it ends
    pub(crate) fn spawn(self: Arc<Self>, mut events: PeerEventReceiver) {
        self.set_state(ClientState::Connected);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if self.destroyed.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    PeerEvent::Connect {
                        node_id,
                        subprotocol,
                        credentials,
                        headers,
                    } => {
                        self.handle_connect(node_id, subprotocol, credentials, headers)
                            .await;
                    }
                    PeerEvent::Action { action, meta } => {
                        // Actions from one client may be in flight
                        // concurrently; wire order is preserved by the
                        // peer's outbound side, not by intake.
                        let client = self.clone();
                        tokio::spawn(async move {
                            client.handle_action(action, meta).await;
                        });
                    }
                    PeerEvent::Error { kind, message } => {
                        self.core.events.emit(ServerEvent::ClientError {
                            message: ProtocolError::new(kind, message).to_string(),
                        });
                        self.destroy();
                        break;
                    }
                    PeerEvent::Disconnect => {
                        self.destroy();
                        break;
                    }
                }
            }
            self.destroy();
        });
    }

    /// Authenticated node id
    pub fn node_id(&self) -> Option<String> {
        self.identity
            .lock()
            .unwrap()
            .as_ref()
            .map(|identity| identity.node_id.clone())
    }

    /// Authenticated client id
    pub fn client_id(&self) -> Option<String> {
        self.identity
            .lock()
            .unwrap()
            .as_ref()
            .map(|identity| identity.client_id.clone())
    }

    /// Authenticated user id, when the node id carries one
    pub fn user_id(&self) -> Option<String> {
        self.identity
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|identity| identity.user_id.clone())
    }

    /// Remote subprotocol version
    pub fn subprotocol(&self) -> Option<String> {
        self.subprotocol.lock().unwrap().clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap()
    }

    /// Whether this connection was evicted by a newer one
    pub fn is_zombie(&self) -> bool {
        self.zombie.load(Ordering::SeqCst)
    }

    /// Enqueue an outbound action on the peer
    pub(crate) fn send(&self, action: &Action, meta: &Meta) {
        if self.peer.is_connected() {
            self.peer.send_action(action, meta);
        }
    }

    /// Send a development debug frame
    pub(crate) fn send_debug(&self, message: &str) {
        if self.peer.is_connected() {
            self.peer.send_debug(message);
        }
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap() = state;
    }

    async fn handle_connect(
        self: &Arc<Self>,
        node_id: String,
        subprotocol: String,
        credentials: Option<Value>,
        headers: Map<String, Value>,
    ) {
        *self.subprotocol.lock().unwrap() = Some(subprotocol.clone());

        if let Some(supports) = &self.core.supports {
            let acceptable = Version::parse(&subprotocol)
                .map(|version| supports.matches(&version))
                .unwrap_or(false);
            if !acceptable {
                self.core.events.emit(ServerEvent::ClientError {
                    message: ProtocolError::new(
                        ProtocolErrorKind::WrongSubprotocol,
                        format!("{subprotocol} is not supported"),
                    )
                    .to_string(),
                });
                self.set_state(ClientState::Rejected);
                self.peer.reject(ProtocolErrorKind::WrongSubprotocol);
                return;
            }
        }

        self.set_state(ClientState::Authenticating);

        if self.core.registry.is_bruteforce(self.remote_ip) {
            self.core.events.emit(ServerEvent::ClientError {
                message: ProtocolError::new(
                    ProtocolErrorKind::Bruteforce,
                    format!("too many authentication attempts from {}", self.remote_ip),
                )
                .to_string(),
            });
            self.set_state(ClientState::Rejected);
            self.peer.reject(ProtocolErrorKind::Bruteforce);
            return;
        }

        let (user_id, client_id) = parse_node_id(&node_id);
        if user_id.as_deref() == Some("server") {
            self.core.events.emit(ServerEvent::Unauthenticated {
                node_id: node_id.clone(),
                client_key: self.key.clone(),
            });
            self.set_state(ClientState::Rejected);
            self.peer.reject(ProtocolErrorKind::WrongCredentials);
            return;
        }

        let Some(authenticator) = self.core.authenticator() else {
            self.core.events.emit(ServerEvent::Error {
                id: None,
                message: "No authenticator was registered".into(),
            });
            self.set_state(ClientState::Rejected);
            self.peer.reject(ProtocolErrorKind::WrongCredentials);
            return;
        };

        let request = crate::server::core::AuthRequest {
            user_id: user_id.clone(),
            credentials,
            headers,
            node_id: node_id.clone(),
            remote_ip: self.remote_ip,
        };
        let allowed = match authenticator(request).await {
            Ok(allowed) => allowed,
            Err(error) => {
                self.core.events.emit(ServerEvent::Error {
                    id: None,
                    message: error.to_string(),
                });
                self.set_state(ClientState::Rejected);
                self.peer.reject(ProtocolErrorKind::WrongCredentials);
                return;
            }
        };
        if !allowed {
            self.core.registry.record_auth_failure(self.remote_ip);
            self.core.events.emit(ServerEvent::Unauthenticated {
                node_id: node_id.clone(),
                client_key: self.key.clone(),
            });
            self.set_state(ClientState::Rejected);
            self.peer.reject(ProtocolErrorKind::WrongCredentials);
            return;
        }

        // A reconnect can race its own stale connection: the old holder of
        // this node id becomes a zombie and goes away without a disconnect
        // report.
        if let Some(previous) = self.core.registry.take_node(&node_id) {
            previous.zombie.store(true, Ordering::SeqCst);
            self.core.events.emit(ServerEvent::Zombie {
                node_id: node_id.clone(),
            });
            previous.destroy();
        }

        *self.identity.lock().unwrap() = Some(ClientIdentity {
            node_id: node_id.clone(),
            client_id: client_id.clone(),
            user_id: user_id.clone(),
        });
        self.core.registry.register_identity(
            &node_id,
            &client_id,
            user_id.as_deref(),
            self.clone(),
        );
        self.set_state(ClientState::Authenticated);
        self.peer.accept();
        self.core.events.emit(ServerEvent::Authenticated {
            node_id,
            client_key: self.key.clone(),
        });
    }

    async fn handle_action(self: &Arc<Self>, action: Action, mut meta: Meta) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let Some(identity) = self.identity.lock().unwrap().clone() else {
            tracing::warn!(
                "[Client] Connection {} sent an action before authenticating",
                self.key
            );
            return;
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.set_state(ClientState::Synchronizing);

        self.filter_action(&identity, action, &mut meta).await;

        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1
            && !self.destroyed.load(Ordering::SeqCst)
        {
            self.set_state(ClientState::Idle);
        }
    }

    /// Inbound filter: id ownership, meta whitelist, then access by the
    /// matched processor. Denials never reach the log.
    async fn filter_action(
        self: &Arc<Self>,
        identity: &ClientIdentity,
        action: Action,
        meta: &mut Meta,
    ) {
        let Some(parsed) = ParsedId::parse(&meta.id) else {
            self.core.events.emit(ServerEvent::ClientError {
                message: ProtocolError::new(
                    ProtocolErrorKind::WrongFormat,
                    format!("bad action id {:?}", meta.id),
                )
                .to_string(),
            });
            self.peer.reject(ProtocolErrorKind::WrongFormat);
            return;
        };

        let own_id =
            parsed.node_id == identity.node_id || parsed.client_id == identity.client_id;
        if !own_id || !meta.is_client_safe() {
            deny_action(&self.core, &action, meta);
            return;
        }

        if meta.subprotocol.is_none() {
            meta.subprotocol = self.subprotocol();
        }

        if action.is_subscription() {
            self.core.log.add(action, meta.clone());
            return;
        }

        let Some(processor) = self.core.types.resolve(&action.type_name) else {
            // No processor anywhere: let the add dispatch run its
            // unknown-type handling.
            self.core.log.add(action, meta.clone());
            return;
        };

        let ctx = self
            .core
            .context(&parsed.node_id, meta.subprotocol.clone());
        match (processor.access)(ctx, action.clone(), meta.clone()).await {
            Ok(true) => {
                self.core.log.add(action, meta.clone());
            }
            Ok(false) => deny_action(&self.core, &action, meta),
            Err(error) => {
                if matches!(proxy_verdict(&error), Some(ProxyError::UnknownAction)) {
                    self.core.events.emit(ServerEvent::UnknownType {
                        id: meta.id.clone(),
                        type_name: action.type_name.clone(),
                    });
                    undo(&self.core, &action, meta, "unknownType");
                    debug_frame(
                        &self.core,
                        &meta.id,
                        &format!("Action with unknown type {}", action.type_name),
                    );
                } else {
                    self.core.events.emit(ServerEvent::Error {
                        id: Some(meta.id.clone()),
                        message: error.to_string(),
                    });
                    undo(&self.core, &action, meta, "error");
                    debug_frame(
                        &self.core,
                        &meta.id,
                        &format!("Error checking access: {error}"),
                    );
                }
            }
        }
    }

    /// Tear the connection down. Idempotent; prunes every index.
    pub fn destroy(self: &Arc<Self>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ClientState::Destroyed);
        if self.peer.is_connected() {
            self.peer.disconnect();
        }
        self.core.registry.remove_connected(&self.key);
        if let Some(identity) = self.identity.lock().unwrap().clone() {
            self.core.registry.remove_identity(
                &identity.node_id,
                &identity.client_id,
                identity.user_id.as_deref(),
                self,
            );
            self.core
                .registry
                .remove_node_subscriptions(&identity.node_id);
        }
        if !self.is_zombie() && !self.core.is_destroying() {
            self.core.events.emit(ServerEvent::Disconnected {
                client_key: self.key.clone(),
            });
        }
    }
}
