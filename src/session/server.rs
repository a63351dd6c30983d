//! Server session — a listen endpoint plus the roster of accepted clients
//!
//! Incoming connections are accepted on `Connecting`, join the roster on
//! `Connected` and leave it on `ClosedByPeer` / `ProblemDetectedLocally`.
//! The roster only ever holds handles whose latest acted-on transition was
//! `Connected`.
//!
//! `run()` is a fixed-tick loop, not an event-driven wait: a stop request
//! or a new message is noticed at most one `tick_interval` late.

use super::{Pollable, SessionManager};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::transport::Transport;
use crate::types::{ConnectionEvent, ConnectionHandle, ConnectionState, ListenHandle, SendReliability};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Application callback for messages from clients
pub type ServerMessageHandler = Box<dyn FnMut(ConnectionHandle, &[u8]) + Send>;

/// Cooperative cancellation for [`ServerSession::run`]
///
/// Cheap to clone and safe to use from any thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    /// Ask the run loop to exit at its next iteration check
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Outcome of a broadcast; failures never stop the fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    /// Recipients the transport accepted the message for
    pub sent: usize,

    /// Recipients whose send failed, in roster order
    pub failed: Vec<ConnectionHandle>,
}

impl BroadcastSummary {
    /// Total recipients attempted
    pub fn attempted(&self) -> usize {
        self.sent + self.failed.len()
    }

    /// Whether every recipient was sent to
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Manages a listen endpoint and the connections accepted on it
pub struct ServerSession {
    manager: SessionManager,
    listen: Option<ListenHandle>,
    port: Option<u16>,
    roster: Vec<ConnectionHandle>,
    /// Accepted, waiting for `Connected`
    accepting: Vec<ConnectionHandle>,
    running: Arc<AtomicBool>,
    on_message: Option<ServerMessageHandler>,
}

impl ServerSession {
    /// Create a server with the default configuration
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            manager: SessionManager::new(transport, config),
            listen: None,
            port: None,
            roster: Vec::new(),
            accepting: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            on_message: None,
        }
    }

    /// Set the callback invoked once per inbound message
    ///
    /// Messages from one connection arrive in order; there is no ordering
    /// across connections.
    pub fn set_message_handler(
        &mut self,
        handler: impl FnMut(ConnectionHandle, &[u8]) + Send + 'static,
    ) {
        self.on_message = Some(Box::new(handler));
    }

    /// Remove the message callback; later messages are discarded
    pub fn clear_message_handler(&mut self) {
        self.on_message = None;
    }

    /// Bind a listen endpoint on `port`
    ///
    /// On failure the server stays not listening.
    pub fn initialize(&mut self, port: u16) -> Result<()> {
        let transport = self.manager.require_transport()?;
        if self.listen.is_some() {
            return Err(SessionError::AlreadyListening);
        }

        let listen = transport
            .listen(port, self.manager.registration())
            .inspect_err(|e| {
                tracing::warn!(port, error = %e, "Failed to create listen endpoint");
            })?;

        self.listen = Some(listen);
        self.port = Some(port);
        self.running.store(true, Ordering::Release);
        tracing::info!(port, transport = transport.name(), "Server listening");
        Ok(())
    }

    /// Poll, receive and sleep one tick at a time until stopped
    ///
    /// Blocks the calling thread. Use [`ServerSession::stop_handle`] to end
    /// the loop from another thread; the shutdown itself (closing clients
    /// and the listen endpoint) then runs here before returning.
    pub fn run(&mut self) {
        if self.listen.is_none() {
            tracing::warn!("Server run requested without a listen endpoint");
            return;
        }

        let tick = self.manager.config().tick_interval();
        while self.running.load(Ordering::Acquire) {
            self.poll();
            self.receive_messages();
            std::thread::sleep(tick);
        }
        self.stop();
    }

    /// [`ServerSession::run`] for a tokio task
    pub async fn run_async(&mut self) {
        if self.listen.is_none() {
            tracing::warn!("Server run requested without a listen endpoint");
            return;
        }

        let tick = self.manager.config().tick_interval();
        while self.running.load(Ordering::Acquire) {
            self.poll();
            self.receive_messages();
            tokio::time::sleep(tick).await;
        }
        self.stop();
    }

    /// Handle that ends `run()` from another thread or task
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.running.clone(),
        }
    }

    /// Close every client and the listen endpoint
    ///
    /// Idempotent; also ends a `run()` loop on its next iteration.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if self.listen.is_none() && self.roster.is_empty() && self.accepting.is_empty() {
            return;
        }

        tracing::info!(clients = self.roster.len(), "Server shutting down");
        if let Some(transport) = self.manager.transport() {
            let reason = self.manager.config().shutdown_reason.as_str();
            for handle in self.roster.iter().chain(self.accepting.iter()) {
                transport.close_connection(*handle, Some(reason), true);
            }
            if let Some(listen) = self.listen {
                transport.close_listen_endpoint(listen);
            }
        }
        self.roster.clear();
        self.accepting.clear();
        self.listen = None;
        self.port = None;
        tracing::info!("Server stopped");
    }

    /// Send to every client reliably, in roster order
    pub fn broadcast_reliable_message(&self, payload: &[u8]) -> BroadcastSummary {
        self.broadcast(payload, SendReliability::Reliable)
    }

    /// Send to every client best effort, in roster order
    pub fn broadcast_unreliable_message(&self, payload: &[u8]) -> BroadcastSummary {
        self.broadcast(payload, SendReliability::Unreliable)
    }

    fn broadcast(&self, payload: &[u8], reliability: SendReliability) -> BroadcastSummary {
        let mut summary = BroadcastSummary::default();
        for &handle in &self.roster {
            match self.manager.send(handle, payload, reliability) {
                Ok(()) => summary.sent += 1,
                Err(_) => summary.failed.push(handle),
            }
        }
        summary
    }

    /// Drain one batch per client into the message callback
    ///
    /// A client whose receive fails is skipped for this tick. Returns the
    /// number of messages drained.
    pub fn receive_messages(&mut self) -> usize {
        let Some(transport) = self.manager.transport() else {
            return 0;
        };
        let batch = self.manager.config().receive_batch_size;

        let mut total = 0;
        for &handle in &self.roster {
            let messages = match transport.receive_messages(handle, batch) {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::debug!(handle = %handle, error = %e, "Receive failed, skipping client");
                    continue;
                }
            };

            total += messages.len();
            for message in messages {
                if message.is_empty() {
                    continue;
                }
                if let Some(on_message) = self.on_message.as_mut() {
                    on_message(handle, &message.payload);
                }
            }
        }
        total
    }

    /// Close one client and drop it from the roster
    ///
    /// Returns false if the handle is not in the roster.
    pub fn disconnect_client(&mut self, handle: ConnectionHandle, reason: &str) -> bool {
        let Some(index) = self.roster.iter().position(|h| *h == handle) else {
            return false;
        };
        self.roster.remove(index);
        if let Some(transport) = self.manager.transport() {
            transport.close_connection(handle, Some(reason), true);
        }
        tracing::info!(handle = %handle, reason, "Client disconnected by server");
        true
    }

    /// Accepted clients, in the order they connected
    pub fn clients(&self) -> &[ConnectionHandle] {
        &self.roster
    }

    pub fn client_count(&self) -> usize {
        self.roster.len()
    }

    pub fn is_listening(&self) -> bool {
        self.listen.is_some()
    }

    /// Whether `run()` would keep looping
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn listen_handle(&self) -> Option<ListenHandle> {
        self.listen
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    fn on_connecting(&mut self, event: &ConnectionEvent) {
        let handle = event.handle;
        // A reused handle starts over
        self.roster.retain(|h| *h != handle);
        self.accepting.retain(|h| *h != handle);

        let Some(transport) = self.manager.transport() else {
            return;
        };
        let config = self.manager.config();
        tracing::info!(handle = %handle, description = %event.description, "Connection request");

        if let Some(max) = config.max_connections {
            if self.roster.len() + self.accepting.len() >= max {
                tracing::warn!(handle = %handle, max, "Rejecting connection, server full");
                transport.close_connection(handle, Some(&config.reject_reason), false);
                return;
            }
        }

        match transport.accept_connection(handle) {
            Ok(()) => {
                self.accepting.push(handle);
                tracing::info!(handle = %handle, "Accepted connection");
            }
            Err(e) => {
                tracing::warn!(handle = %handle, error = %e, "Failed to accept connection");
                transport.close_connection(handle, Some(&config.reject_reason), false);
            }
        }
    }
}

impl Pollable for ServerSession {
    fn manager(&self) -> &SessionManager {
        &self.manager
    }

    fn manager_mut(&mut self) -> &mut SessionManager {
        &mut self.manager
    }

    fn handle_connection_status_changed(&mut self, event: &ConnectionEvent) {
        let handle = event.handle;
        match event.new_state {
            ConnectionState::Connecting => self.on_connecting(event),
            ConnectionState::Connected => {
                self.accepting.retain(|h| *h != handle);
                if !self.roster.contains(&handle) {
                    self.roster.push(handle);
                }
                tracing::info!(
                    handle = %handle,
                    description = %event.description,
                    clients = self.roster.len(),
                    "Client connected"
                );
            }
            ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally => {
                tracing::info!(
                    handle = %handle,
                    description = %event.description,
                    reason = %event.end_debug,
                    "Client disconnected"
                );
                if let Some(transport) = self.manager.transport() {
                    transport.close_connection(handle, None, false);
                }
                self.roster.retain(|h| *h != handle);
                self.accepting.retain(|h| *h != handle);
            }
            ConnectionState::None | ConnectionState::Other => {}
        }
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackTransport;
    use proptest::prelude::*;

    fn loopback() -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport::new())
    }

    fn event(handle: u32, state: ConnectionState) -> ConnectionEvent {
        ConnectionEvent::new(ConnectionHandle(handle), ConnectionState::Other, state)
    }

    #[test]
    fn test_initialize_and_stop() {
        let transport = loopback();
        let mut server = ServerSession::new(transport.clone());
        assert!(!server.is_listening());

        server.initialize(32001).unwrap();
        assert!(server.is_listening());
        assert!(server.is_running());
        assert_eq!(server.port(), Some(32001));
        assert!(transport.is_listening_on(32001));

        server.stop();
        assert!(!server.is_listening());
        assert!(!server.is_running());
        assert!(!transport.is_listening_on(32001));

        server.stop();
    }

    #[test]
    fn test_initialize_twice_rejected() {
        let mut server = ServerSession::new(loopback());
        server.initialize(32002).unwrap();
        assert!(matches!(server.initialize(32003), Err(SessionError::AlreadyListening)));
    }

    #[test]
    fn test_initialize_port_in_use() {
        let transport = loopback();
        let mut first = ServerSession::new(transport.clone());
        let mut second = ServerSession::new(transport);
        first.initialize(32004).unwrap();

        assert!(matches!(second.initialize(32004), Err(SessionError::Listen { .. })));
        assert!(!second.is_listening());
        assert!(!second.is_running());
    }

    #[test]
    fn test_initialize_not_ready() {
        let mut server = ServerSession::new(Arc::new(LoopbackTransport::failing()));
        assert!(matches!(server.initialize(32005), Err(SessionError::NotReady)));
        assert_eq!(server.poll(), 0);
        assert_eq!(server.receive_messages(), 0);
        assert!(server.broadcast_reliable_message(b"x").is_complete());
        server.run();
        server.stop();
    }

    #[test]
    fn test_roster_follows_transitions() {
        let mut server = ServerSession::new(loopback());
        server.handle_connection_status_changed(&event(5, ConnectionState::Connected));
        server.handle_connection_status_changed(&event(6, ConnectionState::Connected));
        assert_eq!(server.clients(), &[ConnectionHandle(5), ConnectionHandle(6)]);

        server.handle_connection_status_changed(&event(5, ConnectionState::ClosedByPeer));
        assert_eq!(server.clients(), &[ConnectionHandle(6)]);

        // Removing a handle that never connected is a no-op
        server.handle_connection_status_changed(&event(9, ConnectionState::ProblemDetectedLocally));
        server.handle_connection_status_changed(&event(5, ConnectionState::ClosedByPeer));
        assert_eq!(server.client_count(), 1);

        server.handle_connection_status_changed(&event(6, ConnectionState::Other));
        assert_eq!(server.client_count(), 1);
    }

    #[test]
    fn test_connected_never_duplicates() {
        let mut server = ServerSession::new(loopback());
        server.handle_connection_status_changed(&event(5, ConnectionState::Connected));
        server.handle_connection_status_changed(&event(5, ConnectionState::Connected));
        assert_eq!(server.client_count(), 1);
    }

    #[test]
    fn test_failed_accept_takes_no_roster_action() {
        let mut server = ServerSession::new(loopback());
        // Unknown to the transport, so acceptance fails
        server.handle_connection_status_changed(&event(40, ConnectionState::Connecting));
        assert_eq!(server.client_count(), 0);
        assert!(server.accepting.is_empty());
    }

    #[test]
    fn test_disconnect_client() {
        let mut server = ServerSession::new(loopback());
        server.handle_connection_status_changed(&event(5, ConnectionState::Connected));
        assert!(server.disconnect_client(ConnectionHandle(5), "kicked"));
        assert!(!server.disconnect_client(ConnectionHandle(5), "kicked"));
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_stop_handle_shares_flag() {
        let mut server = ServerSession::new(loopback());
        server.initialize(32006).unwrap();
        let handle = server.stop_handle();
        assert!(handle.is_running());

        handle.stop();
        assert!(!server.is_running());
        // run() observes the flag immediately and finishes the shutdown
        server.run();
        assert!(!server.is_listening());
    }

    #[test]
    fn test_run_async_stops() {
        let transport = loopback();
        let mut server = ServerSession::new(transport.clone());
        server.initialize(32007).unwrap();
        server.stop_handle().stop();

        tokio_test::block_on(server.run_async());
        assert!(!server.is_listening());
        assert!(!transport.is_listening_on(32007));
    }

    #[test]
    fn test_broadcast_summary() {
        let summary = BroadcastSummary {
            sent: 2,
            failed: vec![ConnectionHandle(3)],
        };
        assert_eq!(summary.attempted(), 3);
        assert!(!summary.is_complete());
        assert!(BroadcastSummary::default().is_complete());
    }

    fn state_strategy() -> impl Strategy<Value = ConnectionState> {
        prop_oneof![
            Just(ConnectionState::Connecting),
            Just(ConnectionState::Connected),
            Just(ConnectionState::ClosedByPeer),
            Just(ConnectionState::ProblemDetectedLocally),
            Just(ConnectionState::Other),
        ]
    }

    proptest! {
        #[test]
        fn prop_roster_consistency(
            events in proptest::collection::vec((1u32..6, state_strategy()), 0..60)
        ) {
            let mut server = ServerSession::new(loopback());
            let mut last: std::collections::HashMap<u32, ConnectionState> = Default::default();

            for (handle, state) in events {
                server.handle_connection_status_changed(&event(handle, state));
                if state != ConnectionState::Other {
                    last.insert(handle, state);
                }

                let mut expected: Vec<u32> = last
                    .iter()
                    .filter(|(_, s)| **s == ConnectionState::Connected)
                    .map(|(h, _)| *h)
                    .collect();
                expected.sort_unstable();

                let mut actual: Vec<u32> = server.clients().iter().map(|h| h.0).collect();
                actual.sort_unstable();
                let before = actual.len();
                actual.dedup();

                prop_assert_eq!(before, actual.len(), "roster holds duplicates");
                prop_assert_eq!(actual, expected);
            }
        }
    }
}
