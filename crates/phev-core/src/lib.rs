//! # phev-core
//!
//! Shared library for the PHEV head-unit session protocol containing the
//! frame codec, the rolling XOR obfuscation layer, and the typed payloads the
//! head unit sends during session bring-up.
//!
//! It has no dependencies on sockets, serial ports, threads or clocks; the
//! session engine in `phev-pipe` builds on top of it.
//!
//! # Architecture overview
//!
//! - **`protocol`** – How bytes travel on the wire.  A frame is
//!   `[command][length][type][register][data…][checksum]`; the two header
//!   bytes stay in clear so a receiver can find frame boundaries, the body is
//!   obfuscated with one of three independently keyed XOR streams.
//!
//! - **`domain`** – Payload views: [`VinInfo`], [`DateInfo`] and the ECU
//!   version string.

pub mod domain;
pub mod protocol;

pub use domain::{DateInfo, VinInfo};
pub use protocol::codec::{decode_message, encode_message, ProtocolError};
pub use protocol::messages::{MessageType, PhevMessage};
pub use protocol::xor::{ObfuscationCodec, XorCategory, XorSeeds};
