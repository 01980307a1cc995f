//! Synclog - Server Node for Log-Based Synchronization
//!
//! Many browser-like clients hold an append-only action log; this server
//! holds its own log and exchanges actions with each client so application
//! state converges. The server is the trust boundary: it authenticates
//! clients, authorizes every incoming action, runs the registered business
//! logic, and fans actions out to the interested subset of other clients
//! (by user, by client, by node, by channel).
//!
//! # Module Structure
//!
//! - **`shared`** - action envelope, meta record, identifier parsing,
//!   wire-level errors
//! - **`log`** - append-only store contract, in-memory store, the log with
//!   its preadd hook and event dispatch
//! - **`server`** - the node: options, registries, per-connection clients,
//!   action pipeline, channel engine, event bus
//! - **`proxy`** - HTTP backend delegation for auth/access/process
//! - **`control`** - bounded control HTTP surface
//!
//! # Usage
//!
//! ```rust,no_run
//! use synclog::server::{ActionCallbacks, Server, ServerOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::new(ServerOptions::new("1.0.0", "^1.0.0"))?;
//! server.auth(|request| async move { Ok(request.user_id.is_some()) });
//! server.add_type(
//!     "message/add",
//!     ActionCallbacks::new(|ctx, _action, _meta| async move { Ok(!ctx.is_server()) }),
//! );
//! server.listen().await?;
//! # Ok(())
//! # }
//! ```

/// Bounded control HTTP surface
pub mod control;

/// Append-only action log
pub mod log;

/// Backend proxy
pub mod proxy;

/// The server node
pub mod server;

/// Types shared with sync peer implementations
pub mod shared;

pub use server::{Server, ServerOptions};
pub use shared::{Action, ActionStatus, Meta};
