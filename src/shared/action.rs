//! Action Envelope
//!
//! An action is the unit of synchronization: an application-defined,
//! JSON-shaped record carrying a `type` discriminator. The server treats the
//! payload as opaque except for the reserved `logux/*` control types it
//! emits and consumes itself.
//!
//! # Wire Shape
//!
//! Actions serialize flat: the `type` field sits next to the payload fields,
//! exactly as clients produce them:
//!
//! ```json
//! { "type": "message/add", "text": "hi" }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved type for channel subscription requests
pub const SUBSCRIBE_TYPE: &str = "logux/subscribe";

/// Reserved type for channel unsubscription requests
pub const UNSUBSCRIBE_TYPE: &str = "logux/unsubscribe";

/// Reserved type reverting an action on the client
pub const UNDO_TYPE: &str = "logux/undo";

/// Reserved type confirming an action was processed
pub const PROCESSED_TYPE: &str = "logux/processed";

/// Application action: a `type` discriminator plus an opaque payload.
///
/// The payload map is flattened into the action object on the wire, so the
/// struct round-trips the exact client JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// The action type discriminator
    #[serde(rename = "type")]
    pub type_name: String,

    /// Remaining action fields, kept opaque
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Action {
    /// Create an action with an empty payload
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            payload: Map::new(),
        }
    }

    /// Builder-style payload field setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Whether this is a reserved `logux/*` control action
    pub fn is_control(&self) -> bool {
        self.type_name.starts_with("logux/")
    }

    /// Whether this is a subscribe or unsubscribe request
    pub fn is_subscription(&self) -> bool {
        self.type_name == SUBSCRIBE_TYPE || self.type_name == UNSUBSCRIBE_TYPE
    }

    /// The `channel` payload field, if present and a string
    pub fn channel(&self) -> Option<&str> {
        self.payload.get("channel").and_then(Value::as_str)
    }

    /// The `id` payload field, if present and a string.
    ///
    /// Carried by `logux/undo` and `logux/processed` to reference the
    /// original action.
    pub fn id_field(&self) -> Option<&str> {
        self.payload.get("id").and_then(Value::as_str)
    }

    /// The `reason` payload field of a `logux/undo`
    pub fn reason(&self) -> Option<&str> {
        self.payload.get("reason").and_then(Value::as_str)
    }

    /// Build a `logux/subscribe` request
    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self::new(SUBSCRIBE_TYPE).with("channel", channel.into())
    }

    /// Build a `logux/unsubscribe` request
    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self::new(UNSUBSCRIBE_TYPE).with("channel", channel.into())
    }

    /// Build a `logux/undo` reverting the given action id.
    ///
    /// The original action travels along so clients can revert local state
    /// without a log lookup.
    pub fn undo(id: impl Into<String>, reason: impl Into<String>, action: Option<&Action>) -> Self {
        let mut undo = Self::new(UNDO_TYPE)
            .with("id", id.into())
            .with("reason", reason.into());
        if let Some(original) = action {
            if let Ok(value) = serde_json::to_value(original) {
                undo.payload.insert("action".into(), value);
            }
        }
        undo
    }

    /// Build a `logux/processed` confirmation for the given action id
    pub fn processed(id: impl Into<String>) -> Self {
        Self::new(PROCESSED_TYPE).with("id", id.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape_is_flat() {
        let action = Action::new("message/add").with("text", "hi");
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "message/add");
        assert_eq!(json["text"], "hi");

        let back: Action = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn test_control_detection() {
        assert!(Action::subscribe("user/10").is_control());
        assert!(Action::processed("1 10:uuid 0").is_control());
        assert!(!Action::new("message/add").is_control());
    }

    #[test]
    fn test_subscribe_carries_channel() {
        let action = Action::subscribe("user/10");
        assert_eq!(action.channel(), Some("user/10"));
        assert!(action.is_subscription());
    }

    #[test]
    fn test_undo_references_original() {
        let original = Action::new("message/add").with("text", "hi");
        let undo = Action::undo("1 10:uuid 0", "denied", Some(&original));
        assert_eq!(undo.id_field(), Some("1 10:uuid 0"));
        assert_eq!(undo.reason(), Some("denied"));
        assert_eq!(undo.payload["action"]["type"], "message/add");
    }

    #[test]
    fn test_channel_must_be_string() {
        let action = Action::new(SUBSCRIBE_TYPE).with("channel", 5);
        assert_eq!(action.channel(), None);
    }
}
