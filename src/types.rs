//! Core session types
//!
//! Handles, connection states and transition events are produced by the
//! transport; the session layer only stores copies of them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport-assigned identifier for a single logical connection
///
/// Unique while the connection is alive. Transports may reuse a handle once
/// the connection is fully closed, so handles are not unique across the
/// process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionHandle(pub u32);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport-assigned identifier for a listen endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenHandle(pub u32);

impl fmt::Display for ListenHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listen#{}", self.0)
    }
}

/// Opaque per-session token carried by every connection as user data
///
/// The dispatch trampoline uses it to find the session that owns a
/// connection. Tokens are never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(pub u64);

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Logical state of a connection as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// No state yet; only seen as the previous state of a fresh handle
    None,
    /// Handshake in progress (incoming: waiting to be accepted)
    Connecting,
    /// Established and able to carry messages
    Connected,
    /// The remote side closed the connection
    ClosedByPeer,
    /// Local side detected a failure (timeout, refused, route lost)
    ProblemDetectedLocally,
    /// Transitional states the session layer does not act on
    Other,
}

impl ConnectionState {
    /// Whether this state ends the connection
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ClosedByPeer | Self::ProblemDetectedLocally)
    }
}

/// A single connection state transition, delivered during a poll step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    /// Connection that changed state
    pub handle: ConnectionHandle,

    /// State before the transition
    pub previous_state: ConnectionState,

    /// State after the transition
    pub new_state: ConnectionState,

    /// Transport-supplied reason, populated for terminal transitions
    #[serde(default)]
    pub end_debug: String,

    /// Human-readable description of the connection (peer address etc.)
    #[serde(default)]
    pub description: String,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,
}

impl ConnectionEvent {
    /// Create a transition event stamped with the current time
    pub fn new(
        handle: ConnectionHandle,
        previous_state: ConnectionState,
        new_state: ConnectionState,
    ) -> Self {
        Self {
            handle,
            previous_state,
            new_state,
            end_debug: String::new(),
            description: String::new(),
            timestamp: now_millis(),
        }
    }

    /// Attach the end-of-connection reason
    pub fn with_end_debug(mut self, reason: impl Into<String>) -> Self {
        self.end_debug = reason.into();
        self
    }

    /// Attach the connection description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Delivery guarantee selected per send
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SendReliability {
    /// Ordered, guaranteed delivery (or connection closure)
    #[default]
    Reliable,
    /// Best effort, no ordering or delivery guarantee
    Unreliable,
}

/// An inbound message handed out by the transport
///
/// Consumed once by the application callback, then released by dropping it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Receiving side's handle for the connection the message arrived on
    pub connection: ConnectionHandle,

    /// Message bytes
    pub payload: Bytes,

    /// Reliability class the sender used
    pub reliability: SendReliability,

    /// Per-connection sequence number assigned by the sender's transport
    pub message_number: u64,

    /// Unix timestamp in milliseconds when the message was queued
    pub received_at: u64,
}

impl Message {
    /// Message length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
