//! Rolling XOR obfuscation of frame bodies.
//!
//! # How the keystream works
//!
//! Each [`XorAccumulator`] holds a one-byte key.  Every byte that passes
//! through is XORed with the current key, and the key then advances as a
//! function of the *plaintext* byte:
//!
//! ```text
//! cipher = plain ^ key
//! key    = rotl(key, 1) ^ (plain + KEY_STEP)
//! ```
//!
//! Because the decoder recovers the plaintext before advancing, an encoder
//! and a decoder that start from the same seed and see the same sequence of
//! buffers stay in lock-step without ever exchanging the key.
//!
//! # Categories
//!
//! General traffic, pings and register commands are keyed independently, so
//! a dropped or replayed ping cannot desynchronise register traffic.  Each
//! category keeps one accumulator per direction: the outbound one advances
//! on [`ObfuscationCodec::encode`], the inbound one on
//! [`ObfuscationCodec::decode`].

use serde::{Deserialize, Serialize};

use crate::protocol::messages::{commands, HEADER_SIZE};

/// Constant mixed into every key step so an all-zero stream still rolls.
const KEY_STEP: u8 = 0x5B;

/// Message category selecting which accumulator pair is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XorCategory {
    General,
    Ping,
    Command,
}

impl XorCategory {
    /// Picks the category for a frame from its clear command byte.
    pub fn for_command(command: u8) -> Self {
        match command {
            commands::PING_SEND | commands::PING_RESP => XorCategory::Ping,
            commands::SEND_CMD | commands::RESP_CMD => XorCategory::Command,
            _ => XorCategory::General,
        }
    }
}

/// Initial keys for the three categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct XorSeeds {
    #[serde(default)]
    pub general: u8,
    #[serde(default)]
    pub ping: u8,
    #[serde(default)]
    pub command: u8,
}

/// One rolling key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XorAccumulator {
    seed: u8,
    key: u8,
}

impl XorAccumulator {
    pub fn new(seed: u8) -> Self {
        Self { seed, key: seed }
    }

    /// Current key byte.
    pub fn key(&self) -> u8 {
        self.key
    }

    /// Returns the key to its seed.
    pub fn reset(&mut self) {
        self.key = self.seed;
    }

    fn advance(&mut self, plain: u8) {
        self.key = self.key.rotate_left(1) ^ plain.wrapping_add(KEY_STEP);
    }

    /// Obfuscates `buf` in place.
    pub fn encode(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            let plain = *byte;
            *byte = plain ^ self.key;
            self.advance(plain);
        }
    }

    /// Removes the obfuscation from `buf` in place.
    pub fn decode(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            let plain = *byte ^ self.key;
            *byte = plain;
            self.advance(plain);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct XorChannel {
    outbound: XorAccumulator,
    inbound: XorAccumulator,
}

impl XorChannel {
    fn new(seed: u8) -> Self {
        Self {
            outbound: XorAccumulator::new(seed),
            inbound: XorAccumulator::new(seed),
        }
    }

    fn reset(&mut self) {
        self.outbound.reset();
        self.inbound.reset();
    }
}

/// Session-wide obfuscation state: three independently keyed channels.
///
/// When disabled, [`encode`](Self::encode) and [`decode`](Self::decode) leave
/// buffers untouched and no accumulator advances.
///
/// # Examples
///
/// ```rust
/// use phev_core::protocol::xor::{ObfuscationCodec, XorCategory, XorSeeds};
///
/// let seeds = XorSeeds { general: 0x11, ping: 0x22, command: 0x33 };
/// let mut sender = ObfuscationCodec::new(true, seeds);
/// let mut receiver = ObfuscationCodec::new(true, seeds);
///
/// let mut buf = b"hello".to_vec();
/// sender.encode(XorCategory::Command, &mut buf);
/// receiver.decode(XorCategory::Command, &mut buf);
/// assert_eq!(buf, b"hello");
/// ```
#[derive(Debug, Clone)]
pub struct ObfuscationCodec {
    enabled: bool,
    general: XorChannel,
    ping: XorChannel,
    command: XorChannel,
}

impl ObfuscationCodec {
    pub fn new(enabled: bool, seeds: XorSeeds) -> Self {
        Self {
            enabled,
            general: XorChannel::new(seeds.general),
            ping: XorChannel::new(seeds.ping),
            command: XorChannel::new(seeds.command),
        }
    }

    /// A codec that never transforms anything.
    pub fn disabled() -> Self {
        Self::new(false, XorSeeds::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn channel(&mut self, category: XorCategory) -> &mut XorChannel {
        match category {
            XorCategory::General => &mut self.general,
            XorCategory::Ping => &mut self.ping,
            XorCategory::Command => &mut self.command,
        }
    }

    /// Obfuscates `buf` with the outbound accumulator of `category`.
    pub fn encode(&mut self, category: XorCategory, buf: &mut [u8]) {
        if self.enabled {
            self.channel(category).outbound.encode(buf);
        }
    }

    /// De-obfuscates `buf` with the inbound accumulator of `category`.
    pub fn decode(&mut self, category: XorCategory, buf: &mut [u8]) {
        if self.enabled {
            self.channel(category).inbound.decode(buf);
        }
    }

    /// Obfuscates the body of a whole frame, leaving the clear header intact.
    ///
    /// `category` overrides the command-derived category when given.
    pub fn encode_frame(&mut self, category: Option<XorCategory>, frame: &mut [u8]) {
        if frame.len() <= HEADER_SIZE {
            return;
        }
        let category = category.unwrap_or_else(|| XorCategory::for_command(frame[0]));
        self.encode(category, &mut frame[HEADER_SIZE..]);
    }

    /// Inverse of [`encode_frame`](Self::encode_frame).
    pub fn decode_frame(&mut self, category: Option<XorCategory>, frame: &mut [u8]) {
        if frame.len() <= HEADER_SIZE {
            return;
        }
        let category = category.unwrap_or_else(|| XorCategory::for_command(frame[0]));
        self.decode(category, &mut frame[HEADER_SIZE..]);
    }

    /// Current outbound key of `category` (diagnostics only).
    pub fn outbound_key(&self, category: XorCategory) -> u8 {
        match category {
            XorCategory::General => self.general.outbound.key(),
            XorCategory::Ping => self.ping.outbound.key(),
            XorCategory::Command => self.command.outbound.key(),
        }
    }

    /// Re-seeds every accumulator; used when a session reconnects.
    pub fn reset(&mut self) {
        self.general.reset();
        self.ping.reset();
        self.command.reset();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
