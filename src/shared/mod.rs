//! Shared Module
//!
//! Types shared between the server core and sync peer implementations:
//! the action envelope, the meta record, identifier parsing and the
//! wire-level error taxonomy. Everything here is serialization-ready and
//! free of server state.

/// Action envelope and reserved control types
pub mod action;

/// Shared error types
pub mod error;

/// Action and node identifier parsing
pub mod ident;

/// Action metadata and change patches
pub mod meta;

pub use action::{Action, PROCESSED_TYPE, SUBSCRIBE_TYPE, UNDO_TYPE, UNSUBSCRIBE_TYPE};
pub use error::{ProcessError, ProtocolError, ProtocolErrorKind};
pub use ident::{parse_node_id, ParsedId};
pub use meta::{ActionStatus, Meta, MetaPatch};
