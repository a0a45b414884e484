//! Transport error types shared by every socket backend.

use std::io;

/// Socket layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Socket has been closed (last reference released)
    #[error("Socket is closed")]
    Closed,

    /// Socket creation or bind failed
    #[error("Failed to bind socket: {0}")]
    BindFailed(String),

    /// Binding the socket to a network interface failed
    #[error("Failed to bind to network {network}: {reason}")]
    NetworkBindFailed {
        /// Network the socket was meant for
        network: crate::NetworkHandle,
        /// OS-level reason
        reason: String,
    },

    /// Address family of the destination does not match the socket
    #[error("Address family mismatch: socket is {socket}, destination is {destination}")]
    FamilyMismatch {
        /// Family of the socket
        socket: crate::IpFamily,
        /// Family of the destination address
        destination: crate::IpFamily,
    },

    /// Backend-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for socket operations
pub type TransportResult<T> = Result<T, TransportError>;
