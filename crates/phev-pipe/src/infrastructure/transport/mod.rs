//! Byte transports.
//!
//! - [`tcp::TcpTransport`] talks to the head unit's Wi-Fi access point.
//! - [`mock::ScriptedTransport`] is an in-memory peer for tests and demos: bytes
//!   can be injected, written bytes captured, and a responder closure can
//!   play the vehicle's side of the conversation.

pub mod mock;
pub mod tcp;

pub use mock::ScriptedTransport;
pub use tcp::TcpTransport;
