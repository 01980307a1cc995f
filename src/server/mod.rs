//! Server Module
//!
//! The server node itself: configuration, registries, the per-connection
//! client, the action pipeline, the channel engine, and the event bus the
//! whole thing reports through.
//!
//! # Architecture
//!
//! - **`core`** - construction, wiring, listen/destroy, public API
//! - **`client`** - one instance per connection: auth, inbound filter
//! - **`pipeline`** - add dispatch, fan-out, processing, undo
//! - **`channels`** - subscribe/unsubscribe handling
//! - **`state`** - connection, identity and subscription indexes
//! - **`types`** - processor and channel registration tables
//! - **`events`** - enumerated event bus doubling as the report stream

/// Channel engine
pub mod channels;

/// Per-connection server client
pub mod client;

/// Per-action callback context
pub mod context;

/// Server construction and public API
pub mod core;

/// Event bus and reports
pub mod events;

/// Configuration
pub mod options;

/// Channel name matching
pub mod pattern;

/// Sync peer contract
pub mod peer;

/// Action pipeline
pub mod pipeline;

/// Registry indexes
pub mod state;

/// Processor and channel tables
pub mod types;

pub use channels::WrongChannel;
pub use client::{ClientState, ServerClient};
pub use context::Context;
pub use core::{AuthRequest, FatalError, ListenInfo, PeerAcceptor, Server, ServerCore};
pub use events::{EventBus, ServerEvent};
pub use options::{CertInput, Env, OptionsError, ServerOptions};
pub use pattern::{ChannelMatcher, ChannelPattern};
pub use peer::{PeerEvent, PeerEventReceiver, PeerEventSender, SyncPeer};
pub use state::Registry;
pub use types::{
    ActionCallbacks, ChannelCallbacks, ChannelFilter, ChannelRegistry, Resend, TypeRegistry,
};
