//! Error types for a3s-session

use crate::types::ConnectionHandle;
use thiserror::Error;

/// Errors that can occur in the session layer
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport library failed to initialize
    #[error("Transport initialization failed: {0}")]
    Init(String),

    /// The session's transport interface is unavailable
    #[error("Transport interface not ready")]
    NotReady,

    /// Address could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Outbound connection could not be created
    #[error("Failed to connect to '{address}': {reason}")]
    Connect {
        address: String,
        reason: String,
    },

    /// Listen endpoint could not be created
    #[error("Failed to listen on port {port}: {reason}")]
    Listen {
        port: u16,
        reason: String,
    },

    /// Incoming connection could not be accepted
    #[error("Failed to accept connection {handle}: {reason}")]
    Accept {
        handle: ConnectionHandle,
        reason: String,
    },

    /// Send failure
    #[error("Failed to send on connection {handle}: {reason}")]
    Send {
        handle: ConnectionHandle,
        reason: String,
    },

    /// Receive failure
    #[error("Failed to receive on connection {handle}: {reason}")]
    Receive {
        handle: ConnectionHandle,
        reason: String,
    },

    /// Handle is not known to the transport
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionHandle),

    /// Message exceeds the transport's maximum size
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Client has no established connection
    #[error("Not connected")]
    NotConnected,

    /// Client already holds a connection
    #[error("Already connected via {0}")]
    AlreadyConnected(ConnectionHandle),

    /// Server already owns a listen endpoint
    #[error("Already listening")]
    AlreadyListening,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O failure (config files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
