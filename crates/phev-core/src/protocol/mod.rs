//! Protocol module containing message types, the frame codec and the XOR
//! obfuscation layer.

pub mod codec;
pub mod messages;
pub mod xor;

pub use codec::{checksum, decode_message, encode_message, peek_frame_len, ProtocolError};
pub use messages::*;
pub use xor::{ObfuscationCodec, XorAccumulator, XorCategory, XorSeeds};
