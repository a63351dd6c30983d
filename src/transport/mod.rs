//! Transport trait — the message transport the session layer sits on
//!
//! Reliability, congestion control, encryption and framing all live below
//! this trait. A transport hands out connection handles, queues
//! connection-state transitions until `run_callbacks()` is called, and
//! offers per-handle send and batched receive.

use crate::error::Result;
use crate::types::{ConnectionEvent, ConnectionHandle, ListenHandle, Message, SendReliability, SessionToken};
use std::net::SocketAddr;

pub mod loopback;

/// Largest payload a single send may carry (512 KiB)
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// A connection-state transition as the transport reports it
///
/// `user_data` is whatever the connection was registered with; the
/// session layer's trampoline uses it to find the owning session.
#[derive(Debug, Clone)]
pub struct StatusChanged {
    /// User data attached to the connection, if any
    pub user_data: Option<SessionToken>,

    /// The transition itself
    pub event: ConnectionEvent,
}

/// Global status-change entry point
pub type StatusChangedFn = fn(StatusChanged);

/// Callback configuration attached to a connection or listen endpoint
///
/// Connections accepted on a listen endpoint inherit its registration.
#[derive(Debug, Clone, Copy)]
pub struct CallbackRegistration {
    /// Invoked once per transition from inside `run_callbacks()`
    pub callback: StatusChangedFn,

    /// Per-connection user data handed back with every transition
    pub user_data: Option<SessionToken>,
}

/// Core trait for message transports
///
/// Implementations must be usable from several threads at once: one
/// transport is typically shared by a server and any number of clients.
pub trait Transport: Send + Sync {
    /// Global library initialization
    ///
    /// Called once per session that uses the transport. Implementations
    /// that need it should reference-count against `shutdown()`.
    fn init(&self) -> Result<()>;

    /// Release one reference taken by `init()`
    fn shutdown(&self);

    /// Start an outbound connection
    ///
    /// Returns as soon as the handle exists; the handshake outcome arrives
    /// later as transitions.
    fn connect(&self, addr: SocketAddr, registration: CallbackRegistration)
        -> Result<ConnectionHandle>;

    /// Create a listen endpoint on all local addresses
    fn listen(&self, port: u16, registration: CallbackRegistration) -> Result<ListenHandle>;

    /// Accept an incoming connection that is in the `Connecting` state
    fn accept_connection(&self, handle: ConnectionHandle) -> Result<()>;

    /// Close a connection
    ///
    /// `linger` asks the transport to flush pending reliable data first.
    /// Closing an unknown or already closed handle is a no-op.
    fn close_connection(&self, handle: ConnectionHandle, reason: Option<&str>, linger: bool);

    /// Destroy a listen endpoint, closing connections accepted through it
    fn close_listen_endpoint(&self, listen: ListenHandle);

    /// Queue a message on a connection
    fn send_message(
        &self,
        handle: ConnectionHandle,
        payload: &[u8],
        reliability: SendReliability,
    ) -> Result<()>;

    /// Take up to `max` pending messages from a connection, in arrival order
    fn receive_messages(&self, handle: ConnectionHandle, max: usize) -> Result<Vec<Message>>;

    /// Deliver every queued transition to its registered callback
    fn run_callbacks(&self);

    /// Transport name (e.g., "loopback")
    fn name(&self) -> &str;
}
