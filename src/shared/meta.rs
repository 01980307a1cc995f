//! Action Metadata
//!
//! Every log entry pairs an action with a server-maintained meta record:
//! identity, logical time, retention reasons, processing status and resend
//! addressing. Unknown keys (client extras, backend annotations) are kept in
//! a flattened extension map so the record round-trips foreign JSON.
//!
//! # Addressing
//!
//! Fan-out targets live in the plural arrays `nodes`, `clients`, `users` and
//! `channels`. Producers may use the singular short forms `node`, `client`,
//! `user` and `channel`; those arrive in the extension map and are folded
//! into the arrays by [`Meta::normalize_addressing`] during preadd.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Processing status of a log entry.
///
/// Absent for `logux/*` control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// Waiting for a processor
    Waiting,
    /// Terminal: processed successfully, never re-dispatched
    Processed,
    /// Terminal: processing failed
    Error,
}

/// Server-maintained envelope around an action
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Meta {
    /// Globally unique id: `"<counter> <nodeId> <seq>"`
    pub id: String,

    /// Logical timestamp from the log clock, in milliseconds
    pub time: i64,

    /// Local insertion index, assigned by the store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added: Option<u64>,

    /// Retention reasons; an entry survives while at least one remains
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,

    /// Originating server node id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Subprotocol version of the producer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subprotocol: Option<String>,

    /// Processing status; absent for `logux/*` control actions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ActionStatus>,

    /// Target node ids for fan-out
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,

    /// Target client ids for fan-out
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub clients: Vec<String>,

    /// Target user ids for fan-out
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,

    /// Target channels for fan-out
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,

    /// Extension fields: client extras and backend annotations
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Meta {
    /// Meta with only an id set
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Fold singular `node`/`client`/`user`/`channel` extension keys into
    /// the plural addressing arrays. String values become one entry; array
    /// values are appended element-wise.
    pub fn normalize_addressing(&mut self) {
        for (singular, plural) in [
            ("node", 0usize),
            ("client", 1),
            ("user", 2),
            ("channel", 3),
        ] {
            let Some(value) = self.extra.remove(singular) else {
                continue;
            };
            let target = match plural {
                0 => &mut self.nodes,
                1 => &mut self.clients,
                2 => &mut self.users,
                _ => &mut self.channels,
            };
            match value {
                Value::String(one) => target.push(one),
                Value::Array(many) => {
                    target.extend(many.into_iter().filter_map(|v| match v {
                        Value::String(s) => Some(s),
                        _ => None,
                    }));
                }
                _ => {}
            }
        }
    }

    /// Whether any fan-out addressing is present
    pub fn has_addressing(&self) -> bool {
        !self.nodes.is_empty()
            || !self.clients.is_empty()
            || !self.users.is_empty()
            || !self.channels.is_empty()
    }

    /// Whether a client-supplied meta sticks to the whitelisted fields
    /// (`id`, `time`, `subprotocol`). Anything else is grounds for denial.
    pub fn is_client_safe(&self) -> bool {
        self.added.is_none()
            && self.reasons.is_empty()
            && self.server.is_none()
            && self.status.is_none()
            && !self.has_addressing()
            && self.extra.is_empty()
    }

    /// Apply a patch in place
    pub fn apply(&mut self, patch: &MetaPatch) {
        if let Some(status) = patch.status {
            self.status = Some(status);
        }
        if let Some(reasons) = &patch.reasons {
            self.reasons = reasons.clone();
        }
        if let Some(nodes) = &patch.nodes {
            self.nodes = nodes.clone();
        }
        if let Some(clients) = &patch.clients {
            self.clients = clients.clone();
        }
        if let Some(users) = &patch.users {
            self.users = users.clone();
        }
        if let Some(channels) = &patch.channels {
            self.channels = channels.clone();
        }
    }
}

/// Typed change-meta request: `Some` fields replace, `None` fields keep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaPatch {
    /// New processing status
    pub status: Option<ActionStatus>,
    /// New retention reasons
    pub reasons: Option<Vec<String>>,
    /// New node addressing
    pub nodes: Option<Vec<String>>,
    /// New client addressing
    pub clients: Option<Vec<String>>,
    /// New user addressing
    pub users: Option<Vec<String>>,
    /// New channel addressing
    pub channels: Option<Vec<String>>,
}

impl MetaPatch {
    /// Patch that only changes the status
    pub fn status(status: ActionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}
