//! Client session — one outbound connection to a server
//!
//! ```text
//! Disconnected ──connect()──> Connecting ──Connected──> Connected
//!      ^                          │                         │
//!      └── ClosedByPeer / ProblemDetectedLocally / disconnect()
//! ```

use super::{Pollable, SessionManager};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::transport::Transport;
use crate::types::{ConnectionEvent, ConnectionHandle, ConnectionState, SendReliability};
use std::net::SocketAddr;
use std::sync::Arc;

/// Application callback for messages from the server
pub type ClientMessageHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Connection slot of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection held
    Disconnected,
    /// Handle created, handshake not finished
    Connecting(ConnectionHandle),
    /// Established
    Connected(ConnectionHandle),
}

/// Manages exactly one outbound connection
pub struct ClientSession {
    manager: SessionManager,
    state: ClientState,
    last_end_reason: Option<String>,
    on_message: Option<ClientMessageHandler>,
}

impl ClientSession {
    /// Create a client with the default configuration
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            manager: SessionManager::new(transport, config),
            state: ClientState::Disconnected,
            last_end_reason: None,
            on_message: None,
        }
    }

    /// Set the callback invoked once per inbound message, in arrival order
    pub fn set_message_handler(&mut self, handler: impl FnMut(&[u8]) + Send + 'static) {
        self.on_message = Some(Box::new(handler));
    }

    /// Remove the message callback; later messages are discarded
    pub fn clear_message_handler(&mut self) {
        self.on_message = None;
    }

    /// Start connecting to `address` (`ip:port`)
    ///
    /// Fails without creating a connection if the transport is not ready,
    /// a connection is already held, the address is malformed, or the
    /// transport refuses to create the connection.
    pub fn connect(&mut self, address: &str) -> Result<()> {
        let transport = self.manager.require_transport()?;
        if let Some(handle) = self.connection() {
            return Err(SessionError::AlreadyConnected(handle));
        }

        let addr = parse_address(address).inspect_err(|_| {
            tracing::warn!(address, "Invalid server address");
        })?;

        let handle = transport
            .connect(addr, self.manager.registration())
            .inspect_err(|e| {
                tracing::warn!(address, error = %e, "Failed to create connection");
            })?;

        self.state = ClientState::Connecting(handle);
        self.last_end_reason = None;
        tracing::info!(handle = %handle, address, "Connecting to server");
        Ok(())
    }

    /// Gracefully close the connection; no-op when disconnected
    pub fn disconnect(&mut self) {
        let Some(handle) = self.connection() else {
            return;
        };
        if let Some(transport) = self.manager.transport() {
            let reason = self.manager.config().disconnect_reason.as_str();
            transport.close_connection(handle, Some(reason), true);
        }
        self.state = ClientState::Disconnected;
        tracing::info!(handle = %handle, "Disconnected from server");
    }

    /// Send to the server with ordered, guaranteed delivery
    pub fn send_reliable_to_server(&self, payload: &[u8]) -> Result<()> {
        self.send_to_server(payload, SendReliability::Reliable)
    }

    /// Send to the server best effort
    pub fn send_unreliable_to_server(&self, payload: &[u8]) -> Result<()> {
        self.send_to_server(payload, SendReliability::Unreliable)
    }

    fn send_to_server(&self, payload: &[u8], reliability: SendReliability) -> Result<()> {
        match self.state {
            ClientState::Connected(handle) => self.manager.send(handle, payload, reliability),
            _ => Err(SessionError::NotConnected),
        }
    }

    /// Drain one batch of inbound messages into the message callback
    ///
    /// No-op unless connected. Returns the number of messages drained.
    pub fn receive_messages(&mut self) -> usize {
        let ClientState::Connected(handle) = self.state else {
            return 0;
        };
        let Some(transport) = self.manager.transport() else {
            return 0;
        };

        let batch = self.manager.config().receive_batch_size;
        let messages = match transport.receive_messages(handle, batch) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::debug!(handle = %handle, error = %e, "Receive failed");
                return 0;
            }
        };

        let count = messages.len();
        for message in messages {
            if message.is_empty() {
                continue;
            }
            if let Some(on_message) = self.on_message.as_mut() {
                on_message(&message.payload);
            }
        }
        count
    }

    /// True once the handshake has completed and until the connection ends
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ClientState::Connected(_))
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Handle held in the slot, connecting or connected
    pub fn connection(&self) -> Option<ConnectionHandle> {
        match self.state {
            ClientState::Disconnected => None,
            ClientState::Connecting(handle) | ClientState::Connected(handle) => Some(handle),
        }
    }

    /// Transport-supplied reason for the last peer or network close
    pub fn last_end_reason(&self) -> Option<&str> {
        self.last_end_reason.as_deref()
    }
}

impl Pollable for ClientSession {
    fn manager(&self) -> &SessionManager {
        &self.manager
    }

    fn manager_mut(&mut self) -> &mut SessionManager {
        &mut self.manager
    }

    fn handle_connection_status_changed(&mut self, event: &ConnectionEvent) {
        let Some(owned) = self.connection() else {
            return;
        };
        if event.handle != owned {
            return;
        }

        match event.new_state {
            ConnectionState::Connecting => {
                self.state = ClientState::Connecting(owned);
            }
            ConnectionState::Connected => {
                self.state = ClientState::Connected(owned);
                tracing::info!(handle = %owned, "Connected to server");
            }
            ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally => {
                tracing::info!(
                    handle = %owned,
                    state = ?event.new_state,
                    reason = %event.end_debug,
                    "Disconnected from server"
                );
                if let Some(transport) = self.manager.transport() {
                    transport.close_connection(owned, None, false);
                }
                self.state = ClientState::Disconnected;
                self.last_end_reason = Some(event.end_debug.clone());
            }
            ConnectionState::None | ConnectionState::Other => {}
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn parse_address(address: &str) -> Result<SocketAddr> {
    address
        .trim()
        .parse::<SocketAddr>()
        .map_err(|e| SessionError::InvalidAddress(format!("{}: {}", address, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::server::ServerSession;
    use crate::transport::loopback::LoopbackTransport;
    use proptest::prelude::*;
    use std::sync::Mutex;

    fn loopback() -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport::new())
    }

    fn event(handle: ConnectionHandle, state: ConnectionState) -> ConnectionEvent {
        ConnectionEvent::new(handle, ConnectionState::Other, state)
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("127.0.0.1:27020").unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 27020))
        );
        assert!(parse_address("[::1]:9000").is_ok());
        assert!(parse_address(" 10.0.0.1:80 ").is_ok());
        assert!(matches!(
            parse_address("not-an-address"),
            Err(SessionError::InvalidAddress(_))
        ));
        assert!(parse_address("127.0.0.1").is_err());
    }

    #[test]
    fn test_new_client_is_disconnected() {
        let client = ClientSession::new(loopback());
        assert!(client.is_ready());
        assert!(!client.is_connected());
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.connection().is_none());
    }

    #[test]
    fn test_connect_malformed_address() {
        let transport = loopback();
        let mut client = ClientSession::new(transport.clone());
        assert!(matches!(
            client.connect("not-an-address"),
            Err(SessionError::InvalidAddress(_))
        ));
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(transport.connection_count(), 0);
    }

    #[test]
    fn test_connect_when_not_ready() {
        let mut client = ClientSession::new(Arc::new(LoopbackTransport::failing()));
        assert!(!client.is_ready());
        assert!(matches!(
            client.connect("127.0.0.1:27020"),
            Err(SessionError::NotReady)
        ));
        assert_eq!(client.poll(), 0);
        assert_eq!(client.receive_messages(), 0);
        client.disconnect();
    }

    #[test]
    fn test_connect_twice_rejected() {
        let mut client = ClientSession::new(loopback());
        client.connect("127.0.0.1:31001").unwrap();
        assert!(matches!(
            client.connect("127.0.0.1:31001"),
            Err(SessionError::AlreadyConnected(_))
        ));
    }

    #[test]
    fn test_connect_refused_returns_to_disconnected() {
        let mut client = ClientSession::new(loopback());
        client.connect("127.0.0.1:31002").unwrap();
        assert!(matches!(client.state(), ClientState::Connecting(_)));

        client.poll();
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(client.last_end_reason(), Some("Connection refused"));
    }

    #[test]
    fn test_disconnect_when_disconnected_is_noop() {
        let mut client = ClientSession::new(loopback());
        client.disconnect();
        client.disconnect();
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn test_send_requires_connection() {
        let mut client = ClientSession::new(loopback());
        assert!(matches!(
            client.send_reliable_to_server(b"ping"),
            Err(SessionError::NotConnected)
        ));
        client.connect("127.0.0.1:31003").unwrap();
        assert!(matches!(
            client.send_unreliable_to_server(b"ping"),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn test_events_for_other_handles_ignored() {
        let mut client = ClientSession::new(loopback());
        client.connect("127.0.0.1:31004").unwrap();
        let owned = client.connection().unwrap();
        let other = ConnectionHandle(owned.0 + 100);

        client.handle_connection_status_changed(&event(other, ConnectionState::Connected));
        assert_eq!(client.state(), ClientState::Connecting(owned));

        client.handle_connection_status_changed(&event(other, ConnectionState::ClosedByPeer));
        assert_eq!(client.state(), ClientState::Connecting(owned));

        client.handle_connection_status_changed(&event(owned, ConnectionState::Connected));
        assert_eq!(client.state(), ClientState::Connected(owned));
        assert!(client.is_connected());
    }

    #[test]
    fn test_terminal_event_clears_slot() {
        let mut client = ClientSession::new(loopback());
        client.connect("127.0.0.1:31005").unwrap();
        let owned = client.connection().unwrap();
        client.handle_connection_status_changed(&event(owned, ConnectionState::Connected));

        client.handle_connection_status_changed(
            &event(owned, ConnectionState::ProblemDetectedLocally).with_end_debug("Timed out"),
        );
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(client.last_end_reason(), Some("Timed out"));
    }

    #[test]
    fn test_receive_without_handler_discards() {
        let transport = loopback();
        let mut server = ServerSession::new(transport.clone());
        server.initialize(31007).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let mut client = ClientSession::new(transport.clone());
        client.set_message_handler(move |bytes| sink.lock().unwrap().push(bytes.to_vec()));
        client.connect("127.0.0.1:31007").unwrap();
        for _ in 0..3 {
            server.poll();
            client.poll();
        }
        assert!(client.is_connected());

        assert_eq!(server.broadcast_reliable_message(b"unheard").sent, 1);
        client.clear_message_handler();
        let owned = client.connection().unwrap();
        assert_eq!(transport.pending_messages(owned), 1);

        assert_eq!(client.receive_messages(), 1);
        assert_eq!(transport.pending_messages(owned), 0);
        assert!(received.lock().unwrap().is_empty());
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Event(u8, ConnectionState),
        Disconnect,
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

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            8 => (0u8..3, state_strategy()).prop_map(|(h, s)| Step::Event(h, s)),
            1 => Just(Step::Disconnect),
        ]
    }

    proptest! {
        #[test]
        fn prop_single_slot_invariant(steps in proptest::collection::vec(step_strategy(), 0..40)) {
            let mut client = ClientSession::new(loopback());
            client.connect("127.0.0.1:31006").unwrap();
            let owned = client.connection().unwrap();
            // Model: Some(true) connected, Some(false) connecting, None empty slot
            let mut model = Some(false);

            for step in steps {
                match step {
                    Step::Disconnect => {
                        client.disconnect();
                        model = None;
                    }
                    Step::Event(offset, state) => {
                        // offset 0 targets the owned handle
                        let handle = ConnectionHandle(owned.0 + offset as u32 * 1000);
                        client.handle_connection_status_changed(&event(handle, state));
                        if handle == owned && model.is_some() {
                            model = match state {
                                ConnectionState::Connecting => Some(false),
                                ConnectionState::Connected => Some(true),
                                ConnectionState::ClosedByPeer
                                | ConnectionState::ProblemDetectedLocally => None,
                                _ => model,
                            };
                        }
                    }
                }

                prop_assert_eq!(client.is_connected(), model == Some(true));
                prop_assert_eq!(client.connection().is_some(), model.is_some());
            }
        }
    }
}
