//! # a3s-session
//!
//! Poll-driven client/server session management over pluggable message
//! transports for the A3S ecosystem.
//!
//! ## Overview
//!
//! A transport delivers connection-state transitions and message batches
//! asynchronously. `a3s-session` turns them into a client/server model:
//! a server keeps a roster of accepted connections and broadcasts to it, a
//! client owns a single connection, and both send reliably or unreliably.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_session::{ClientSession, LoopbackTransport, Pollable, ServerSession};
//! use std::sync::Arc;
//!
//! # fn example() -> a3s_session::Result<()> {
//! let transport = Arc::new(LoopbackTransport::new());
//!
//! let mut server = ServerSession::new(transport.clone());
//! server.set_message_handler(|handle, bytes| {
//!     println!("{}: {}", handle, String::from_utf8_lossy(bytes));
//! });
//! server.initialize(27020)?;
//!
//! let mut client = ClientSession::new(transport);
//! client.connect("127.0.0.1:27020")?;
//!
//! for _ in 0..4 {
//!     server.poll();
//!     client.poll();
//! }
//! client.send_reliable_to_server(b"ping")?;
//! server.receive_messages();
//! # Ok(())
//! # }
//! ```
//!
//! ## Scheduling
//!
//! Nothing here spawns threads. Call `poll()` and `receive_messages()`
//! repeatedly, or run `ServerSession::run()` on a thread of its own and end
//! it with a `StopHandle`. The run loop sleeps a fixed tick between
//! iterations, so it reacts at most one tick late.
//!
//! ## Architecture
//!
//! - **Transport** trait — the message transport sessions sit on
//! - **LoopbackTransport** — in-process transport for tests and single-process use
//! - **dispatch** — global trampoline routing transitions to their session
//! - **SessionManager** / **Pollable** — shared session core
//! - **ClientSession** / **ServerSession** — the two session variants

pub mod config;
pub mod dispatch;
pub mod error;
pub mod session;
pub mod transport;
pub mod types;

// Re-export core types
pub use config::SessionConfig;
pub use dispatch::EventDispatcher;
pub use error::{Result, SessionError};
pub use session::client::{ClientMessageHandler, ClientSession, ClientState};
pub use session::server::{BroadcastSummary, ServerMessageHandler, ServerSession, StopHandle};
pub use session::{Pollable, SessionManager};
pub use transport::{CallbackRegistration, StatusChanged, StatusChangedFn, Transport, MAX_MESSAGE_SIZE};
pub use types::{
    ConnectionEvent, ConnectionHandle, ConnectionState, ListenHandle, Message, SendReliability,
    SessionToken,
};

// Re-export the loopback transport for convenience
pub use transport::loopback::LoopbackTransport;
