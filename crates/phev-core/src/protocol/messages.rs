//! PHEV head-unit protocol message types.
//!
//! Every frame exchanged with the head unit has the same shape:
//!
//! ```text
//! [command:1][length:1][type:1][register:1][data:N][checksum:1]
//! ```
//!
//! `length` counts every byte after itself (`N + 3`), so a whole frame is
//! `length + 2` bytes long.  The command and length bytes form the clear
//! header; everything after them is the obfuscated body.

use serde::{Deserialize, Serialize};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Bytes transmitted in clear at the start of every frame (command + length).
pub const HEADER_SIZE: usize = 2;

/// Smallest legal value of the length byte: type + register + checksum.
pub const MIN_BODY_LEN: usize = 3;

/// Smallest legal frame on the wire.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + MIN_BODY_LEN;

/// Length of a device MAC address.
pub const MAC_LEN: usize = 6;

/// Command bytes.
///
/// The high nibble / low nibble swap between a request and its response is a
/// property of the head-unit firmware, not something the codec relies on.
pub mod commands {
    /// Client → car: start / connect-info request.
    pub const START_SEND: u8 = 0xF2;
    /// Car → client: start / connect-info response.
    pub const START_RESP: u8 = 0x2F;
    /// Client → car: register write, or ack of a car-originated update.
    pub const SEND_CMD: u8 = 0xF6;
    /// Car → client: register update, or ack of a client write.
    pub const RESP_CMD: u8 = 0x6F;
    /// Client → car: keepalive ping.
    pub const PING_SEND: u8 = 0xF9;
    /// Car → client: keepalive ping response.
    pub const PING_RESP: u8 = 0x9F;

    /// Returns `true` if `cmd` is one of the command bytes above.
    pub fn is_known(cmd: u8) -> bool {
        matches!(
            cmd,
            START_SEND | START_RESP | SEND_CMD | RESP_CMD | PING_SEND | PING_RESP
        )
    }
}

/// Register identifiers used during session bring-up and for event routing.
///
/// The head unit exposes many more registers; anything not listed here is
/// surfaced as a generic register update.
pub mod registers {
    /// MAC announcement carried by the first start request.
    pub const CONNECT_INFO: u8 = 0x01;
    /// Start request / start acknowledgement.
    pub const START_INFO: u8 = 0x02;
    pub const REMOTE_SECURITY_PRESENT: u8 = 0x03;
    pub const DATE_INFO: u8 = 0x05;
    /// Client → car request to register this device.
    pub const REGISTRATION_REQUEST: u8 = 0x10;
    pub const REGISTRATION_DISPLAY: u8 = 0x11;
    pub const VIN_INFO: u8 = 0x15;
    pub const BLACK_BOX: u8 = 0x1E;
    pub const REGISTRATION: u8 = 0x2A;
    pub const REGISTRATION_COMPLETE: u8 = 0x2B;
    pub const MAX_REGISTRATIONS: u8 = 0x2C;
    pub const ECU_VERSION: u8 = 0xC0;
}

// ── Message type ──────────────────────────────────────────────────────────────

/// Whether a frame is a request or a response to an earlier request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    Response = 0x01,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x00 => Ok(MessageType::Request),
            0x01 => Ok(MessageType::Response),
            _ => Err(()),
        }
    }
}

// ── Typed message ─────────────────────────────────────────────────────────────

/// A decoded PHEV frame.
///
/// The checksum is not stored: [`crate::protocol::codec::encode_message`]
/// computes it and [`crate::protocol::codec::decode_message`] verifies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhevMessage {
    pub command: u8,
    pub message_type: MessageType,
    pub register: u8,
    pub data: Vec<u8>,
}

impl PhevMessage {
    /// Creates a message from its parts.
    pub fn new(command: u8, message_type: MessageType, register: u8, data: Vec<u8>) -> Self {
        Self {
            command,
            message_type,
            register,
            data,
        }
    }

    /// The first frame of a session: announces the device MAC address.
    pub fn mac_announcement(mac: [u8; MAC_LEN]) -> Self {
        Self::new(
            commands::START_SEND,
            MessageType::Request,
            registers::CONNECT_INFO,
            mac.to_vec(),
        )
    }

    /// Asks the head unit to start the session once the VIN is known.
    pub fn start_request() -> Self {
        Self::new(
            commands::START_SEND,
            MessageType::Request,
            registers::START_INFO,
            vec![0x01],
        )
    }

    /// Keepalive ping; the counter travels in the register byte.
    pub fn ping(counter: u8) -> Self {
        Self::new(commands::PING_SEND, MessageType::Request, counter, vec![0x00])
    }

    /// Register write issued by the client.
    pub fn register_write(register: u8, data: Vec<u8>) -> Self {
        Self::new(commands::SEND_CMD, MessageType::Request, register, data)
    }

    /// Acknowledges a register update sent by the car.
    pub fn register_ack(register: u8) -> Self {
        Self::new(commands::SEND_CMD, MessageType::Response, register, vec![0x00])
    }

    /// Value of the `length` byte for this message.
    pub fn body_len(&self) -> usize {
        self.data.len() + MIN_BODY_LEN
    }

    /// Total encoded size in bytes.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body_len()
    }

    /// `true` for a car-originated register update that expects an ack.
    pub fn is_car_update(&self) -> bool {
        self.command == commands::RESP_CMD && self.message_type == MessageType::Request
    }

    /// `true` for the car's acknowledgement of a client register write.
    pub fn is_write_ack(&self) -> bool {
        self.command == commands::RESP_CMD && self.message_type == MessageType::Response
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
