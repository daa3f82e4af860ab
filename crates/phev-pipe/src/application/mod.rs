//! Application layer: the PHEV session engine.
//!
//! Nothing in here opens a socket or reads a file.  Use cases depend on the
//! [`transport::Transport`] trait and the [`pipeline`] stage traits;
//! `infrastructure` supplies the implementations.
//!
//! # Sub-modules
//!
//! - **`transport`** – The byte transport seam and its error type.
//! - **`pipeline`** – Stage traits (split, aggregate, transform, filter,
//!   respond, connect hook) and the bidirectional [`pipeline::MessagePipeline`].
//! - **`events`** – Protocol events and how decoded frames map onto them.
//! - **`dispatch`** – Bounded fan-out of events to registered handlers.
//! - **`keepalive`** – Ping counter and pong tracking.
//! - **`register_updates`** – Register values and writes awaiting an ack.
//! - **`handshake`** – The connection bring-up state machine.
//! - **`settings`** – Session tunables and the construction bundle.
//! - **`session`** – The loop composing all of the above.

pub mod dispatch;
pub mod events;
pub mod handshake;
pub mod keepalive;
pub mod pipeline;
pub mod register_updates;
pub mod session;
pub mod settings;
pub mod transport;
