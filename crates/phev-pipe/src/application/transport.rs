//! The byte transport seam.
//!
//! The engine only needs "read whatever bytes are available" and "write
//! these bytes, tell me if it worked".  Serial, BLE and TCP links all fit
//! behind [`Transport`]; the crate ships a TCP and an in-memory
//! implementation under `infrastructure::transport`.

use thiserror::Error;

/// Errors raised by a [`Transport`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// An operation needs an open connection and there is none.
    #[error("transport is not connected")]
    NotConnected,

    /// Opening the connection failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// The peer stopped answering.
    #[error("peer stopped responding")]
    Timeout,

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

/// A polled, bidirectional byte link.
///
/// `read` must not block for longer than a short, bounded timeout: the
/// session loop calls it once per iteration and does its timer work in
/// between.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    /// Opens the link.  Calling it on an open link is allowed.
    fn connect(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Returns the bytes available right now, or `None` if there are none.
    fn read(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Writes all of `bytes`.
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    fn disconnect(&mut self);
}
