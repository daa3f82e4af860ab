//! phev-pipe library entry point.
//!
//! The session engine for the PHEV head-unit protocol.  It drives one logical
//! session over a byte transport: MAC announcement, VIN acquisition, optional
//! device registration, the keepalive heartbeat, register writes with
//! acknowledgement matching, and fan-out of protocol events to observers.
//!
//! # Layers
//!
//! - **`application`** – the engine itself.  Depends only on the
//!   [`application::transport::Transport`] and pipeline stage traits, so every
//!   use case can be driven from tests without sockets.
//! - **`infrastructure`** – concrete adapters: TCP and in-memory transports,
//!   the default PHEV pipeline stages, and TOML configuration storage.
//!
//! Re-exports the public modules so that integration tests in `tests/` and
//! the binary entry point in `main.rs` share the same module tree.

pub mod application;
pub mod error;
pub mod infrastructure;

pub use application::session::{Session, SessionHandle};
pub use application::settings::{SessionConfig, SessionSettings};
pub use error::{IntegrityWarning, PhevError};
