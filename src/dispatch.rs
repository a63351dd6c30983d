//! Event dispatch trampoline
//!
//! Transports report every connection-state transition through one global
//! callback. Each connection carries the owning session's `SessionToken`
//! as user data; the trampoline looks the token up and queues the event on
//! that session's inbox. The session handles it on its next `poll()`, on
//! whichever thread owns it.
//!
//! Events whose token is missing or no longer registered are dropped.

use crate::transport::{CallbackRegistration, StatusChanged};
use crate::types::{ConnectionEvent, SessionToken};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, PoisonError, RwLock};
use tokio::sync::mpsc;

static DISPATCHER: OnceLock<EventDispatcher> = OnceLock::new();

/// Registry mapping session tokens to session inboxes
pub struct EventDispatcher {
    routes: RwLock<HashMap<SessionToken, mpsc::UnboundedSender<ConnectionEvent>>>,
    next_token: AtomicU64,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }
}

impl EventDispatcher {
    /// The process-wide dispatcher behind [`on_connection_status_changed`]
    pub fn global() -> &'static EventDispatcher {
        DISPATCHER.get_or_init(EventDispatcher::default)
    }

    /// Allocate a token and the inbox its events are routed to
    pub fn register(&self) -> (SessionToken, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let token = SessionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, tx);
        (token, rx)
    }

    /// Stop routing events to `token`
    pub fn unregister(&self, token: SessionToken) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token);
    }

    /// Route one transition to its session; returns whether it was queued
    pub fn dispatch(&self, status: StatusChanged) -> bool {
        let Some(token) = status.user_data else {
            tracing::trace!(handle = %status.event.handle, "Dropping event without user data");
            return false;
        };

        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        match routes.get(&token) {
            Some(tx) => tx.send(status.event).is_ok(),
            None => {
                tracing::trace!(
                    token = %token,
                    handle = %status.event.handle,
                    "Dropping event for unregistered session"
                );
                false
            }
        }
    }

    /// Number of registered sessions
    pub fn registered_count(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Global entry point handed to transports
pub fn on_connection_status_changed(status: StatusChanged) {
    EventDispatcher::global().dispatch(status);
}

/// Callback registration routing a connection's events to `token`
pub fn registration(token: SessionToken) -> CallbackRegistration {
    CallbackRegistration {
        callback: on_connection_status_changed,
        user_data: Some(token),
    }
}
