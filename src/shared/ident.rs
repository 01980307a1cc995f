//! Action and Node Identifiers
//!
//! Action ids have the canonical three-part text form
//! `"<counter> <nodeId> <seq>"`. The node id itself is colon-separated:
//! clients are `user:clientRand[:nodeRand]`, servers are `server:rand`.
//!
//! The middle-segment rule is frozen here: a node id with two or three
//! segments has a user (the first segment) and a client id made of the first
//! two segments; a single-segment node id has no user and is its own client
//! id.

/// Parsed form of an action id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    /// Logical-time counter part of the id
    pub counter: i64,
    /// Node id of the producer
    pub node_id: String,
    /// Client id: first two colon segments of the node id
    pub client_id: String,
    /// User id: first colon segment, when the node id has one
    pub user_id: Option<String>,
    /// Per-counter sequence number
    pub seq: u64,
}

impl ParsedId {
    /// Parse the canonical `"<counter> <nodeId> <seq>"` form.
    ///
    /// Returns `None` for anything that is not exactly three
    /// space-separated parts with numeric counter and sequence.
    pub fn parse(id: &str) -> Option<Self> {
        let mut parts = id.split(' ');
        let counter = parts.next()?.parse::<i64>().ok()?;
        let node_id = parts.next()?;
        let seq = parts.next()?.parse::<u64>().ok()?;
        if parts.next().is_some() || node_id.is_empty() {
            return None;
        }
        let (user_id, client_id) = parse_node_id(node_id);
        Some(Self {
            counter,
            node_id: node_id.to_string(),
            client_id,
            user_id,
            seq,
        })
    }

    /// Whether the id was produced by a server node
    pub fn is_server(&self) -> bool {
        self.user_id.as_deref() == Some("server")
    }
}

/// Split a node id into `(userId, clientId)`.
///
/// Two- and three-segment node ids have a user; a bare segment is its own
/// client id with no user.
pub fn parse_node_id(node_id: &str) -> (Option<String>, String) {
    let mut segments = node_id.split(':');
    let first = segments.next().unwrap_or_default();
    match segments.next() {
        Some(second) => (
            Some(first.to_string()),
            format!("{first}:{second}"),
        ),
        None => (None, first.to_string()),
    }
}
