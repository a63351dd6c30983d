//! Session managers — the client/server layer over a `Transport`
//!
//! `SessionManager` owns the transport reference and the session's inbox
//! of routed transitions. `ClientSession` and `ServerSession` compose it
//! and implement [`Pollable`] with their own transition handling.
//!
//! Sessions never spawn threads. Callers drive them by calling `poll()`
//! and `receive_messages()` repeatedly, or `ServerSession::run()` on a
//! thread of their own. A session is mutated only through `&mut self`, so
//! sharing one between threads needs external synchronization.

use crate::config::SessionConfig;
use crate::dispatch::{self, EventDispatcher};
use crate::error::{Result, SessionError};
use crate::transport::{CallbackRegistration, Transport};
use crate::types::{ConnectionEvent, ConnectionHandle, SendReliability, SessionToken};
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod client;
pub mod server;

/// Shared core of client and server sessions
///
/// If the transport fails to initialize, the interface is left empty and
/// every operation degrades to a no-op (or `SessionError::NotReady`).
/// Check [`SessionManager::is_ready`] before relying on the session.
pub struct SessionManager {
    interface: Option<Arc<dyn Transport>>,
    token: SessionToken,
    inbox: mpsc::UnboundedReceiver<ConnectionEvent>,
    config: SessionConfig,
}

impl SessionManager {
    /// Initialize the transport and register with the dispatch trampoline
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid session config, resetting invalid fields");
                config.repaired()
            }
        };

        let (token, inbox) = EventDispatcher::global().register();
        let interface = match transport.init() {
            Ok(()) => Some(transport),
            Err(e) => {
                tracing::error!(
                    transport = transport.name(),
                    error = %e,
                    "Transport initialization failed"
                );
                None
            }
        };

        Self {
            interface,
            token,
            inbox,
            config,
        }
    }

    /// Whether the transport initialized successfully
    pub fn is_ready(&self) -> bool {
        self.interface.is_some()
    }

    /// Token identifying this session to the trampoline
    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The transport, if it initialized
    pub fn transport(&self) -> Option<&dyn Transport> {
        self.interface.as_deref()
    }

    pub(crate) fn require_transport(&self) -> Result<&dyn Transport> {
        self.transport().ok_or(SessionError::NotReady)
    }

    /// Callback registration for connections owned by this session
    pub fn registration(&self) -> CallbackRegistration {
        dispatch::registration(self.token)
    }

    /// Run the transport's pending callbacks and take this session's events
    ///
    /// Events routed to other sessions stay queued for them. Returns an
    /// empty batch if the transport is unavailable.
    pub fn poll_events(&mut self) -> Vec<ConnectionEvent> {
        let Some(transport) = self.interface.as_deref() else {
            return Vec::new();
        };
        transport.run_callbacks();

        let mut events = Vec::new();
        while let Ok(event) = self.inbox.try_recv() {
            events.push(event);
        }
        events
    }

    /// Hand a message to the transport
    pub fn send(
        &self,
        handle: ConnectionHandle,
        payload: &[u8],
        reliability: SendReliability,
    ) -> Result<()> {
        self.require_transport()?
            .send_message(handle, payload, reliability)
            .inspect_err(|e| {
                tracing::debug!(
                    handle = %handle,
                    reliability = ?reliability,
                    error = %e,
                    "Send failed"
                );
            })
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        EventDispatcher::global().unregister(self.token);
        if let Some(transport) = self.interface.take() {
            transport.shutdown();
        }
    }
}

/// Capability shared by client and server sessions
pub trait Pollable {
    fn manager(&self) -> &SessionManager;

    fn manager_mut(&mut self) -> &mut SessionManager;

    /// React to one transition of a connection this session owns
    fn handle_connection_status_changed(&mut self, event: &ConnectionEvent);

    /// Pump queued transport events into this session's handler
    ///
    /// Non-blocking. Returns the number of events handled.
    fn poll(&mut self) -> usize {
        let events = self.manager_mut().poll_events();
        for event in &events {
            self.handle_connection_status_changed(event);
        }
        events.len()
    }

    /// Send with ordered, guaranteed delivery
    fn send_reliable(&self, handle: ConnectionHandle, payload: &[u8]) -> Result<()> {
        self.manager().send(handle, payload, SendReliability::Reliable)
    }

    /// Send best effort, without ordering
    fn send_unreliable(&self, handle: ConnectionHandle, payload: &[u8]) -> Result<()> {
        self.manager().send(handle, payload, SendReliability::Unreliable)
    }

    /// Readiness signal of the underlying transport
    fn is_ready(&self) -> bool {
        self.manager().is_ready()
    }
}
