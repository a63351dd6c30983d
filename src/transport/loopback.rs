//! In-process loopback transport
//!
//! Implements `Transport` entirely in memory: listen endpoints are keyed
//! by port, and connecting to any `ip:port` pairs the new handle with an
//! incoming handle on the endpoint bound to that port. Messages land in
//! the peer's inbox immediately, so lingering on close has nothing to
//! flush.
//!
//! Useful for tests, benches and single-process use. Fault injection
//! covers the failure paths the session layer must survive: failing
//! library init, per-handle send and receive errors, unreliable loss, and
//! an accept capacity.

use super::{CallbackRegistration, StatusChanged, StatusChangedFn, Transport, MAX_MESSAGE_SIZE};
use crate::error::{Result, SessionError};
use crate::types::{
    now_millis, ConnectionEvent, ConnectionHandle, ConnectionState, ListenHandle, Message,
    SendReliability,
};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

struct LoopbackConnection {
    state: ConnectionState,
    peer: Option<ConnectionHandle>,
    registration: CallbackRegistration,
    /// Set for incoming connections
    listener: Option<ListenHandle>,
    description: String,
    inbox: VecDeque<Message>,
    next_message_number: u64,
}

struct Listener {
    port: u16,
    registration: CallbackRegistration,
}

#[derive(Default)]
struct Faults {
    fail_init: bool,
    drop_unreliable: bool,
    accept_capacity: Option<usize>,
    failing_sends: HashSet<ConnectionHandle>,
    failing_receives: HashSet<ConnectionHandle>,
}

#[derive(Default)]
struct Inner {
    refs: usize,
    next_handle: u32,
    connections: HashMap<ConnectionHandle, LoopbackConnection>,
    listeners: HashMap<ListenHandle, Listener>,
    ports: HashMap<u16, ListenHandle>,
    pending: VecDeque<(StatusChangedFn, StatusChanged)>,
    faults: Faults,
}

impl Inner {
    fn next_id(&mut self) -> u32 {
        loop {
            self.next_handle = self.next_handle.wrapping_add(1).max(1);
            let id = self.next_handle;
            if !self.connections.contains_key(&ConnectionHandle(id))
                && !self.listeners.contains_key(&ListenHandle(id))
            {
                return id;
            }
        }
    }

    fn insert(
        &mut self,
        registration: CallbackRegistration,
        listener: Option<ListenHandle>,
        describe: impl FnOnce(ConnectionHandle) -> String,
    ) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_id());
        self.connections.insert(
            handle,
            LoopbackConnection {
                state: ConnectionState::None,
                peer: None,
                registration,
                listener,
                description: describe(handle),
                inbox: VecDeque::new(),
                next_message_number: 1,
            },
        );
        handle
    }

    /// Move a connection to `new_state` and queue the transition
    fn transition(&mut self, handle: ConnectionHandle, new_state: ConnectionState, end_debug: &str) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        let previous = conn.state;
        conn.state = new_state;

        let event = ConnectionEvent::new(handle, previous, new_state)
            .with_end_debug(end_debug)
            .with_description(conn.description.clone());
        self.pending.push_back((
            conn.registration.callback,
            StatusChanged {
                user_data: conn.registration.user_data,
                event,
            },
        ));
    }

    fn close(&mut self, handle: ConnectionHandle, reason: Option<&str>) {
        let Some(conn) = self.connections.remove(&handle) else {
            return;
        };
        self.faults.failing_sends.remove(&handle);
        self.faults.failing_receives.remove(&handle);

        if let Some(peer) = conn.peer {
            let peer_live = match self.connections.get_mut(&peer) {
                Some(peer_conn) => {
                    peer_conn.peer = None;
                    !peer_conn.state.is_terminal()
                }
                None => false,
            };
            if peer_live {
                self.transition(peer, ConnectionState::ClosedByPeer, reason.unwrap_or("Closed by peer"));
            }
        }
    }

    fn accepted_on(&self, listen: ListenHandle) -> usize {
        self.connections
            .values()
            .filter(|c| c.listener == Some(listen) && c.state == ConnectionState::Connected)
            .count()
    }
}

/// In-memory transport connecting sessions within one process
#[derive(Default)]
pub struct LoopbackTransport {
    inner: Mutex<Inner>,
    /// Serializes callback delivery so transitions reach their callbacks
    /// in the order they were queued
    dispatching: Mutex<()>,
}

impl LoopbackTransport {
    /// Create an empty loopback transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport whose `init()` always fails
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.lock().faults.fail_init = true;
        transport
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every send on `handle` fail until it closes
    pub fn fail_sends_to(&self, handle: ConnectionHandle) {
        self.lock().faults.failing_sends.insert(handle);
    }

    /// Make every receive on `handle` fail until it closes
    pub fn fail_receives_on(&self, handle: ConnectionHandle) {
        self.lock().faults.failing_receives.insert(handle);
    }

    /// Silently drop every unreliable message
    pub fn set_drop_unreliable(&self, drop: bool) {
        self.lock().faults.drop_unreliable = drop;
    }

    /// Limit how many connections each listen endpoint may accept
    pub fn set_accept_capacity(&self, capacity: Option<usize>) {
        self.lock().faults.accept_capacity = capacity;
    }

    /// Remove every injected fault except a failing init
    pub fn clear_faults(&self) {
        let mut inner = self.lock();
        let fail_init = inner.faults.fail_init;
        inner.faults = Faults {
            fail_init,
            ..Faults::default()
        };
    }

    /// Simulate local failure detection (timeout, route lost) on a connection
    pub fn simulate_problem(&self, handle: ConnectionHandle, reason: &str) {
        let mut inner = self.lock();
        let live = inner
            .connections
            .get(&handle)
            .is_some_and(|c| !c.state.is_terminal());
        if live {
            inner.transition(handle, ConnectionState::ProblemDetectedLocally, reason);
        }
    }

    /// Current state of a live handle
    pub fn connection_state(&self, handle: ConnectionHandle) -> Option<ConnectionState> {
        self.lock().connections.get(&handle).map(|c| c.state)
    }

    /// Number of live connection handles (both sides counted)
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Number of open listen endpoints
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Whether a listen endpoint is bound to `port`
    pub fn is_listening_on(&self, port: u16) -> bool {
        self.lock().ports.contains_key(&port)
    }

    /// Messages waiting in a connection's inbox
    pub fn pending_messages(&self, handle: ConnectionHandle) -> usize {
        self.lock()
            .connections
            .get(&handle)
            .map_or(0, |c| c.inbox.len())
    }

    /// Transitions queued for the next `run_callbacks()`
    pub fn pending_callbacks(&self) -> usize {
        self.lock().pending.len()
    }

    /// Outstanding `init()` references
    pub fn references(&self) -> usize {
        self.lock().refs
    }
}

impl Transport for LoopbackTransport {
    fn init(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.faults.fail_init {
            return Err(SessionError::Init(
                "loopback transport configured to fail".to_string(),
            ));
        }
        inner.refs += 1;
        Ok(())
    }

    fn shutdown(&self) {
        let mut inner = self.lock();
        inner.refs = inner.refs.saturating_sub(1);
        if inner.refs == 0 {
            inner.connections.clear();
            inner.listeners.clear();
            inner.ports.clear();
            inner.pending.clear();
            tracing::debug!("Loopback transport shut down");
        }
    }

    fn connect(
        &self,
        addr: SocketAddr,
        registration: CallbackRegistration,
    ) -> Result<ConnectionHandle> {
        if addr.port() == 0 {
            return Err(SessionError::Connect {
                address: addr.to_string(),
                reason: "port 0 is not connectable".to_string(),
            });
        }

        let mut inner = self.lock();
        if inner.refs == 0 {
            return Err(SessionError::NotReady);
        }

        let client = inner.insert(registration, None, |h| format!("{} {}", h, addr));
        inner.transition(client, ConnectionState::Connecting, "");

        let listener = inner
            .ports
            .get(&addr.port())
            .and_then(|listen| inner.listeners.get(listen).map(|l| (*listen, l.registration)));

        match listener {
            Some((listen, listener_registration)) => {
                let server = inner.insert(listener_registration, Some(listen), |h| {
                    format!("{} loopback peer {}", h, client)
                });
                if let Some(server_conn) = inner.connections.get_mut(&server) {
                    server_conn.peer = Some(client);
                }
                if let Some(client_conn) = inner.connections.get_mut(&client) {
                    client_conn.peer = Some(server);
                }
                inner.transition(server, ConnectionState::Connecting, "");
            }
            None => {
                inner.transition(client, ConnectionState::ProblemDetectedLocally, "Connection refused");
            }
        }

        tracing::trace!(handle = %client, addr = %addr, "Loopback connect");
        Ok(client)
    }

    fn listen(&self, port: u16, registration: CallbackRegistration) -> Result<ListenHandle> {
        if port == 0 {
            return Err(SessionError::Listen {
                port,
                reason: "ephemeral ports are not supported".to_string(),
            });
        }

        let mut inner = self.lock();
        if inner.refs == 0 {
            return Err(SessionError::NotReady);
        }
        if inner.ports.contains_key(&port) {
            return Err(SessionError::Listen {
                port,
                reason: "address already in use".to_string(),
            });
        }

        let listen = ListenHandle(inner.next_id());
        inner.listeners.insert(listen, Listener { port, registration });
        inner.ports.insert(port, listen);
        Ok(listen)
    }

    fn accept_connection(&self, handle: ConnectionHandle) -> Result<()> {
        let mut inner = self.lock();
        let conn = inner
            .connections
            .get(&handle)
            .ok_or(SessionError::UnknownConnection(handle))?;

        let reject = |reason: &str| SessionError::Accept {
            handle,
            reason: reason.to_string(),
        };
        let listen = conn.listener.ok_or_else(|| reject("not an incoming connection"))?;
        if conn.state != ConnectionState::Connecting {
            return Err(reject("connection is not awaiting acceptance"));
        }
        let peer = conn.peer;

        if let Some(capacity) = inner.faults.accept_capacity {
            if inner.accepted_on(listen) >= capacity {
                return Err(reject("accept capacity exhausted"));
            }
        }

        inner.transition(handle, ConnectionState::Connected, "");
        if let Some(peer) = peer {
            let peer_connecting = inner
                .connections
                .get(&peer)
                .is_some_and(|c| c.state == ConnectionState::Connecting);
            if peer_connecting {
                inner.transition(peer, ConnectionState::Connected, "");
            }
        }
        Ok(())
    }

    fn close_connection(&self, handle: ConnectionHandle, reason: Option<&str>, linger: bool) {
        self.lock().close(handle, reason);
        tracing::trace!(handle = %handle, linger, "Loopback close");
    }

    fn close_listen_endpoint(&self, listen: ListenHandle) {
        let mut inner = self.lock();
        let Some(listener) = inner.listeners.remove(&listen) else {
            return;
        };
        inner.ports.remove(&listener.port);

        let accepted: Vec<ConnectionHandle> = inner
            .connections
            .iter()
            .filter(|(_, c)| c.listener == Some(listen))
            .map(|(h, _)| *h)
            .collect();
        for handle in accepted {
            inner.close(handle, Some("Listen socket closed"));
        }
    }

    fn send_message(
        &self,
        handle: ConnectionHandle,
        payload: &[u8],
        reliability: SendReliability,
    ) -> Result<()> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(SessionError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut inner = self.lock();
        let send_error = |reason: &str| SessionError::Send {
            handle,
            reason: reason.to_string(),
        };
        if inner.faults.failing_sends.contains(&handle) {
            return Err(send_error("injected send failure"));
        }
        let drop_unreliable = inner.faults.drop_unreliable;

        let conn = inner
            .connections
            .get_mut(&handle)
            .ok_or(SessionError::UnknownConnection(handle))?;
        if conn.state != ConnectionState::Connected {
            return Err(send_error("connection is not connected"));
        }
        let peer = conn.peer.ok_or_else(|| send_error("peer is gone"))?;
        let message_number = conn.next_message_number;
        conn.next_message_number += 1;

        if reliability == SendReliability::Unreliable && drop_unreliable {
            tracing::trace!(handle = %handle, message_number, "Unreliable message dropped");
            return Ok(());
        }

        let peer_conn = inner
            .connections
            .get_mut(&peer)
            .ok_or_else(|| send_error("peer is gone"))?;
        peer_conn.inbox.push_back(Message {
            connection: peer,
            payload: Bytes::copy_from_slice(payload),
            reliability,
            message_number,
            received_at: now_millis(),
        });
        Ok(())
    }

    fn receive_messages(&self, handle: ConnectionHandle, max: usize) -> Result<Vec<Message>> {
        let mut inner = self.lock();
        if inner.faults.failing_receives.contains(&handle) {
            return Err(SessionError::Receive {
                handle,
                reason: "injected receive failure".to_string(),
            });
        }

        let conn = inner
            .connections
            .get_mut(&handle)
            .ok_or(SessionError::UnknownConnection(handle))?;
        let count = max.min(conn.inbox.len());
        Ok(conn.inbox.drain(..count).collect())
    }

    fn run_callbacks(&self) {
        let _dispatching = self.dispatching.lock().unwrap_or_else(PoisonError::into_inner);
        let pending: Vec<_> = self.lock().pending.drain(..).collect();
        for (callback, status) in pending {
            callback(status);
        }
    }

    fn name(&self) -> &str {
        "loopback"
    }
}
