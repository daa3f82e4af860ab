//! Frame codec for PHEV protocol messages.
//!
//! Wire format:
//! ```text
//! [command:1][length:1][type:1][register:1][data:N][checksum:1]
//! ```
//! `length = N + 3`; `checksum` is the wrapping byte sum of every byte that
//! precedes it.  The codec works on clear frames: obfuscation is applied to
//! the body by [`crate::protocol::xor`] before encoding hits the wire and
//! removed before decoding.

use thiserror::Error;

use crate::protocol::messages::{
    commands, MessageType, PhevMessage, HEADER_SIZE, MIN_BODY_LEN, MIN_FRAME_SIZE,
};

/// Largest payload that still fits in the one-byte length field.
pub const MAX_DATA_LEN: usize = u8::MAX as usize - MIN_BODY_LEN;

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ProtocolError {
    /// The byte slice is shorter than the frame it announces.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The command byte is not a recognized value.
    #[error("unknown command: 0x{0:02X}")]
    UnknownCommand(u8),

    /// The length byte is below the minimum body size.
    #[error("invalid length byte: {0}")]
    InvalidLength(u8),

    /// The trailing checksum does not match the frame contents.
    #[error("checksum mismatch: frame carries 0x{found:02X}, computed 0x{expected:02X}")]
    ChecksumMismatch { expected: u8, found: u8 },

    /// The payload could not be parsed or encoded.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Wrapping byte sum used as the frame checksum.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Returns the total size of the frame starting at `bytes[0]`, if the header
/// is available.
///
/// Only the clear header is inspected, so this works on obfuscated bytes too.
pub fn peek_frame_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    Some(HEADER_SIZE + bytes[1] as usize)
}

/// Encodes a [`PhevMessage`] into a clear frame.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if the payload does not fit in
/// the one-byte length field.
///
/// # Examples
///
/// ```rust
/// use phev_core::protocol::{decode_message, encode_message};
/// use phev_core::protocol::messages::PhevMessage;
///
/// let msg = PhevMessage::ping(7);
/// let bytes = encode_message(&msg).unwrap();
/// let (decoded, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(msg: &PhevMessage) -> Result<Vec<u8>, ProtocolError> {
    if msg.data.len() > MAX_DATA_LEN {
        return Err(ProtocolError::MalformedPayload(format!(
            "payload of {} bytes exceeds the {MAX_DATA_LEN}-byte limit",
            msg.data.len()
        )));
    }

    let mut buf = Vec::with_capacity(msg.frame_len());
    buf.push(msg.command);
    buf.push(msg.body_len() as u8);
    buf.push(msg.message_type as u8);
    buf.push(msg.register);
    buf.extend_from_slice(&msg.data);
    buf.push(checksum(&buf));
    Ok(buf)
}

/// Decodes one [`PhevMessage`] from the beginning of `bytes`.
///
/// Returns the message and the number of bytes consumed so the caller can
/// advance its read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the frame is truncated, carries an unknown
/// command or type, or fails the checksum.
pub fn decode_message(bytes: &[u8]) -> Result<(PhevMessage, usize), ProtocolError> {
    if bytes.len() < MIN_FRAME_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: MIN_FRAME_SIZE,
            available: bytes.len(),
        });
    }

    let command = bytes[0];
    if !commands::is_known(command) {
        return Err(ProtocolError::UnknownCommand(command));
    }

    let length = bytes[1];
    if (length as usize) < MIN_BODY_LEN {
        return Err(ProtocolError::InvalidLength(length));
    }

    let total = HEADER_SIZE + length as usize;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let expected = checksum(&bytes[..total - 1]);
    let found = bytes[total - 1];
    if expected != found {
        return Err(ProtocolError::ChecksumMismatch { expected, found });
    }

    let message_type = MessageType::try_from(bytes[2]).map_err(|_| {
        ProtocolError::MalformedPayload(format!("unknown message type: {}", bytes[2]))
    })?;
    let register = bytes[3];
    let data = bytes[4..total - 1].to_vec();

    Ok((
        PhevMessage {
            command,
            message_type,
            register,
            data,
        },
        total,
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::registers;

    #[test]
    fn test_encode_ping_produces_expected_bytes() {
        // Arrange
        let msg = PhevMessage::ping(0x05);

        // Act
        let bytes = encode_message(&msg).unwrap();

        // Assert: F9 04 00 05 00 + checksum
        let expected_sum = 0xF9u8.wrapping_add(0x04).wrapping_add(0x05);
        assert_eq!(bytes, vec![0xF9, 0x04, 0x00, 0x05, 0x00, expected_sum]);
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        // Arrange: header announces 9 body bytes but only 4 follow
        let bytes = [commands::RESP_CMD, 0x09, 0x00, 0x15, 0x01, 0x02];

        // Act
        let result = decode_message(&bytes);

        // Assert
        assert_eq!(
            result,
            Err(ProtocolError::InsufficientData {
                needed: 11,
                available: 6
            })
        );
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let bytes = [0x42, 0x03, 0x00, 0x01, 0x46];
        assert_eq!(decode_message(&bytes), Err(ProtocolError::UnknownCommand(0x42)));
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        // Arrange
        let mut bytes = encode_message(&PhevMessage::start_request()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] = bytes[last].wrapping_add(1);

        // Act / Assert
        assert!(matches!(
            decode_message(&bytes),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_length_below_minimum() {
        let bytes = [commands::PING_RESP, 0x02, 0x00, 0x00, 0x00];
        assert_eq!(decode_message(&bytes), Err(ProtocolError::InvalidLength(2)));
    }

    #[test]
    fn test_decode_consumes_only_first_frame() {
        // Arrange: two frames back to back
        let first = encode_message(&PhevMessage::register_ack(registers::VIN_INFO)).unwrap();
        let second = encode_message(&PhevMessage::ping(1)).unwrap();
        let mut joined = first.clone();
        joined.extend_from_slice(&second);

        // Act
        let (msg, consumed) = decode_message(&joined).unwrap();

        // Assert
        assert_eq!(consumed, first.len());
        assert_eq!(msg.register, registers::VIN_INFO);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let msg = PhevMessage::register_write(0x10, vec![0u8; MAX_DATA_LEN + 1]);
        assert!(matches!(
            encode_message(&msg),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_peek_frame_len_needs_header() {
        assert_eq!(peek_frame_len(&[commands::PING_RESP]), None);
        assert_eq!(peek_frame_len(&[commands::PING_RESP, 0x04]), Some(6));
    }
}
