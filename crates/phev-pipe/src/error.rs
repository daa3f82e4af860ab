//! Session error taxonomy.
//!
//! Every failure the engine can observe is a [`PhevError`].  Transport and
//! handshake failures are funnelled through the session's error handler;
//! operations with a direct call site (handler registration, register
//! updates) also return them synchronously.

use phev_core::ProtocolError;
use thiserror::Error;
use tracing::{error, warn};

use crate::application::handshake::HandshakeState;
use crate::application::pipeline::PipelineError;
use crate::application::transport::TransportError;

/// Protocol-integrity signals.  Reported, never fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityWarning {
    /// The car echoed a ping counter other than the one last sent.
    #[error("ping response {received} does not match last ping {expected}")]
    PingMismatch { expected: u8, received: u8 },

    /// A write acknowledgement arrived for a register nobody wrote.
    #[error("unsolicited acknowledgement for register 0x{register:02X}")]
    UnsolicitedAck { register: u8 },

    /// A register write with a callback was not acknowledged in time.
    #[error("update of register 0x{register:02X} was not acknowledged in time")]
    UnacknowledgedUpdate { register: u8 },
}

/// Errors reported by a PHEV session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PhevError {
    /// Vehicle-side read, write or connect failure.  Triggers a reconnect.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The retry budget ran out while waiting in `state`.
    #[error("handshake timed out in {state:?} after {attempts} attempts")]
    HandshakeTimeout {
        state: HandshakeState,
        attempts: u32,
    },

    #[error("protocol integrity warning: {0}")]
    Integrity(#[from] IntegrityWarning),

    /// A fixed-size table (handlers, pending updates) is full.
    #[error("{resource} table is full (capacity {capacity})")]
    CapacityExceeded {
        resource: &'static str,
        capacity: usize,
    },

    /// The car cannot accept another device registration.
    #[error("vehicle already holds {registrations} registrations; device cannot register")]
    MaxRegistrationsReached { registrations: u8 },

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The session was asked to wait for a connection it never started.
    #[error("session has not been started")]
    NotStarted,

    /// The session loop has been stopped.
    #[error("session stopped")]
    Stopped,
}

impl PhevError {
    /// Returns `true` for errors that end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PhevError::HandshakeTimeout { .. } | PhevError::MaxRegistrationsReached { .. }
        )
    }
}

/// The per-session error sink.
pub type ErrorHandler = Box<dyn FnMut(&PhevError) + Send>;

/// Default error handler: logs through `tracing`.
pub fn log_error(err: &PhevError) {
    if err.is_fatal() {
        error!(error = %err, "fatal session error");
    } else {
        warn!(error = %err, "session error");
    }
}
