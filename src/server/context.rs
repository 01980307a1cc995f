//! Action Context
//!
//! The per-action view handed to every callback: who produced the action,
//! over which subprotocol, and (for channel callbacks) the params captured
//! by the channel matcher. The context also carries the narrow way back
//! into the server a callback is allowed to use: `send_back`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::server::core::ServerCore;
use crate::shared::{parse_node_id, Action, ActionStatus, Meta};

/// Per-action view for callbacks
#[derive(Clone)]
pub struct Context {
    /// Node id of the producer
    pub node_id: String,
    /// Client id of the producer (first two node-id segments)
    pub client_id: String,
    /// User id of the producer, when the node id carries one
    pub user_id: Option<String>,
    /// Producer's subprotocol version
    pub subprotocol: Option<String>,
    /// Params captured by the channel matcher
    pub params: HashMap<String, String>,
    core: Arc<ServerCore>,
}

impl Context {
    pub(crate) fn new(
        core: Arc<ServerCore>,
        node_id: impl Into<String>,
        subprotocol: Option<String>,
        params: HashMap<String, String>,
    ) -> Self {
        let node_id = node_id.into();
        let (user_id, client_id) = parse_node_id(&node_id);
        Self {
            node_id,
            client_id,
            user_id,
            subprotocol,
            params,
            core,
        }
    }

    /// Whether the action was produced by a server node
    pub fn is_server(&self) -> bool {
        self.user_id.as_deref() == Some("server")
    }

    /// Append an action addressed only to the producing client.
    ///
    /// Used by channel `load` callbacks to hand a new subscriber its
    /// initial state. The entry is marked processed so the pipeline will
    /// not run business logic on it.
    pub fn send_back(&self, action: Action) -> Option<Meta> {
        let meta = Meta {
            clients: vec![self.client_id.clone()],
            status: Some(ActionStatus::Processed),
            ..Meta::default()
        };
        self.core.log.add(action, meta)
    }

    /// Append an action with caller-controlled meta, still addressed to the
    /// producing client
    pub fn send_back_with(&self, action: Action, mut meta: Meta) -> Option<Meta> {
        meta.clients.push(self.client_id.clone());
        if meta.status.is_none() {
            meta.status = Some(ActionStatus::Processed);
        }
        self.core.log.add(action, meta)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("node_id", &self.node_id)
            .field("client_id", &self.client_id)
            .field("user_id", &self.user_id)
            .field("subprotocol", &self.subprotocol)
            .field("params", &self.params)
            .finish()
    }
}
