//! Shared Error Types
//!
//! This module defines error types that are shared between the server core
//! and sync peer implementations. They represent wire-level protocol
//! violations and action processing failures.
//!
//! # Error Categories
//!
//! - `ProtocolError` - Wire-level violations from a peer (closes the connection)
//! - `ProcessError` - Failures of the `Server::process` helper
//!
//! # Thread Safety
//!
//! All error types are `Send + Sync` and can be safely shared across thread
//! boundaries.

use thiserror::Error;

/// Wire-level protocol error kinds.
///
/// These are the error kinds a sync peer can raise or be rejected with.
/// The string form is the canonical wire spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// The peer sent a malformed frame
    WrongFormat,
    /// The peer's subprotocol is outside the supported range
    WrongSubprotocol,
    /// Authentication failed
    WrongCredentials,
    /// The peer was silent past the configured timeout
    Timeout,
    /// Too many failed authentications from this address
    Bruteforce,
    /// The peer sent a message the server does not understand
    UnknownMessage,
}

impl ProtocolErrorKind {
    /// Canonical wire spelling of this error kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WrongFormat => "wrong-format",
            Self::WrongSubprotocol => "wrong-subprotocol",
            Self::WrongCredentials => "wrong-credentials",
            Self::Timeout => "timeout",
            Self::Bruteforce => "bruteforce",
            Self::UnknownMessage => "unknown-message",
        }
    }
}

impl std::fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-level protocol violation from a peer
#[derive(Debug, Error, Clone)]
#[error("Protocol error ({kind}): {message}")]
pub struct ProtocolError {
    /// The violation kind
    pub kind: ProtocolErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl ProtocolError {
    /// Create a new protocol error
    pub fn new(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Failure of the `Server::process` helper
#[derive(Debug, Error, Clone)]
pub enum ProcessError {
    /// The action id already existed in the log
    #[error("Action was already added to the log")]
    Duplicate,

    /// The matching processor reported an error
    #[error("Action processing failed: {message}")]
    Failed {
        /// Error message reported by the processor
        message: String,
    },

    /// The server was destroyed before the action settled
    #[error("Server was destroyed before the action was processed")]
    Destroyed,
}
