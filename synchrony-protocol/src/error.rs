//! Error handling for the Synchrony engine
//!
//! This module provides a single error type for every engine operation.
//! Errors are automatically converted from underlying library errors using `thiserror`.
//!
//! ## Error Categories
//!
//! Every variant belongs to exactly one [`ErrorCategory`], which decides how
//! the owning session reacts:
//!
//! - **Transport**: connection refused/reset, broken pipe, EOF. The session
//!   drops to `Disconnected` and reconnects after the backoff.
//! - **Protocol**: malformed record, unknown keyword, oversized frame. The
//!   record is logged and skipped; the channel stays open.
//! - **Store**: persistence failure. The single mutation is dropped, the
//!   session continues.
//! - **Starvation**: no activity within the timeout window. Handled exactly
//!   like a transport failure.
//!
//! Nothing here is fatal to the process.
//!
//! ## Usage
//!
//! ```rust
//! use synchrony_protocol::{ErrorCategory, ProtocolError, Result};
//!
//! fn parse_id(payload: &str) -> Result<i64> {
//!     payload
//!         .trim()
//!         .parse()
//!         .map_err(|_| ProtocolError::InvalidPacket(format!("not an id: {}", payload)))
//! }
//!
//! let err = parse_id("abc").unwrap_err();
//! assert_eq!(err.category(), ErrorCategory::Protocol);
//! ```

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Coarse classification used by sessions to decide between
/// reconnecting and skipping a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The byte stream is unusable; reconnect
    Transport,
    /// A single record was bad; skip it
    Protocol,
    /// Persistence failed; drop the mutation
    Store,
    /// Peer went silent; reconnect
    Starvation,
}

/// Errors that can occur during engine operations
///
/// # Examples
///
/// ```rust
/// use synchrony_protocol::ProtocolError;
///
/// let error = ProtocolError::UnknownCommand("launch_rockets".to_string());
/// assert_eq!(error.to_string(), "Unknown command: launch_rockets");
///
/// let error = ProtocolError::PacketSizeExceeded(9000, 4096);
/// assert_eq!(error.to_string(), "Packet size exceeded: 9000 bytes (max: 4096)");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (socket, file system)
    ///
    /// Automatically converted from `std::io::Error`.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    ///
    /// Automatically converted from `serde_json::Error`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 payload could not be decoded
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Transport layer error (RFCOMM, TCP relay)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection timeout
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Connection actively refused by the remote device
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Connection reset, aborted or the pipe broke mid-write
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Record payload does not match what its keyword requires
    ///
    /// # Examples
    ///
    /// ```rust
    /// use synchrony_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::InvalidPacket("missing ' | ' separator".to_string());
    /// assert_eq!(error.to_string(), "Invalid packet: missing ' | ' separator");
    /// ```
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Keyword with no handler
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Buffered bytes exceeded the frame limit with no delimiter in sight
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),

    /// Record store failure (SQLite, lock poisoning)
    #[error("Database error: {0}")]
    Database(String),

    /// No session is tracked for the address
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation attempted in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation cancelled by a stop request
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Peer sent nothing for longer than the activity window
    #[error("No activity for {0:?}")]
    Starvation(std::time::Duration),
}

impl From<rusqlite::Error> for ProtocolError {
    fn from(error: rusqlite::Error) -> Self {
        ProtocolError::Database(error.to_string())
    }
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific network error
    ///
    /// # Examples
    ///
    /// ```rust
    /// use synchrony_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::ConnectionRefused, "refused");
    /// let error = ProtocolError::from_io_error(io_error, "connecting to phone");
    ///
    /// assert!(matches!(error, ProtocolError::ConnectionRefused(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::NetworkError(format!(
                "{}: connection interrupted ({})",
                context, error
            )),
            _ => ProtocolError::Io(error),
        }
    }

    /// Classify this error for session handling
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProtocolError::Io(_)
            | ProtocolError::Transport(_)
            | ProtocolError::Timeout(_)
            | ProtocolError::ConnectionRefused(_)
            | ProtocolError::NetworkError(_)
            | ProtocolError::Cancelled(_) => ErrorCategory::Transport,
            ProtocolError::Json(_)
            | ProtocolError::Base64(_)
            | ProtocolError::InvalidPacket(_)
            | ProtocolError::UnknownCommand(_)
            | ProtocolError::PacketSizeExceeded(_, _)
            | ProtocolError::DeviceNotFound(_)
            | ProtocolError::InvalidState(_)
            | ProtocolError::Configuration(_) => ErrorCategory::Protocol,
            ProtocolError::Database(_) => ErrorCategory::Store,
            ProtocolError::Starvation(_) => ErrorCategory::Starvation,
        }
    }

    /// Check if this error should tear the connection down
    ///
    /// Transport failures and starvation both end the current connection;
    /// the session retries after its backoff.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Starvation
        )
    }

    /// Check if this error is recoverable (transient error that can be retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout(_)
                | ProtocolError::NetworkError(_)
                | ProtocolError::ConnectionRefused(_)
                | ProtocolError::Transport(_)
                | ProtocolError::Io(_)
                | ProtocolError::Starvation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};
    use std::time::Duration;

    #[test]
    fn test_io_error_classification() {
        let err = ProtocolError::from_io_error(Error::new(ErrorKind::BrokenPipe, "pipe"), "send");
        assert!(matches!(err, ProtocolError::NetworkError(_)));
        assert_eq!(err.category(), ErrorCategory::Transport);

        let err = ProtocolError::from_io_error(Error::new(ErrorKind::TimedOut, "slow"), "connect");
        assert!(matches!(err, ProtocolError::Timeout(_)));
        assert!(err.is_recoverable());

        let err = ProtocolError::from_io_error(Error::new(ErrorKind::Other, "odd"), "read");
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            ProtocolError::UnknownCommand("x".into()).category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            ProtocolError::Database("locked".into()).category(),
            ErrorCategory::Store
        );
        assert_eq!(
            ProtocolError::Starvation(Duration::from_secs(10)).category(),
            ErrorCategory::Starvation
        );
    }

    #[test]
    fn test_connection_fatal() {
        assert!(ProtocolError::Transport("reset".into()).is_connection_fatal());
        assert!(ProtocolError::Starvation(Duration::from_secs(1)).is_connection_fatal());
        assert!(!ProtocolError::InvalidPacket("bad".into()).is_connection_fatal());
        assert!(!ProtocolError::Database("full".into()).is_connection_fatal());
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let err: ProtocolError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.category(), ErrorCategory::Store);
    }
}
