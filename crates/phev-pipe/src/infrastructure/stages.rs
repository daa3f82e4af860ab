//! Default pipeline stages for the PHEV wire protocol.
//!
//! [`phev_stages`] assembles the standard stack:
//!
//! | Slot                    | Stage                                   |
//! |-------------------------|-----------------------------------------|
//! | input / output splitter | [`FrameSplitter`]                       |
//! | input / output aggr.    | [`FrameAggregator`]                     |
//! | input inbound           | [`XorTransformer`] (decode)             |
//! | input outbound          | [`XorTransformer`] (encode)             |
//! | output in / outbound    | [`IdentityTransformer`]                 |
//! | input responder         | [`CommandResponder`]                    |
//! | input filter            | [`RegisterFilter`] when configured      |
//! | connect hook            | [`NoopConnectHook`]                     |
//!
//! The application side carries clear frames, so only the vehicle side
//! obfuscates.

use std::collections::BTreeSet;

use phev_core::protocol::messages::{commands, HEADER_SIZE, MIN_BODY_LEN};
use phev_core::protocol::codec::peek_frame_len;
use phev_core::PhevMessage;
use tracing::{debug, trace};

use crate::application::pipeline::{
    Aggregator, ConnectHook, Filter, Message, PipelineError, PipelineStages, Responder,
    Splitter, StageContext, Transformer,
};

// ── Splitting ─────────────────────────────────────────────────────────────────

/// Cuts a byte stream into frames using the clear length byte.
///
/// Partial frames are buffered until the rest arrives, so the result does not
/// depend on how the transport chunks the stream.  Bytes that cannot start a
/// frame (unknown command, impossible length) are skipped one at a time until
/// the stream lines up again.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buffer: Vec<u8>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn resync(&mut self) {
        let skip = self
            .buffer
            .iter()
            .position(|b| commands::is_known(*b))
            .unwrap_or(self.buffer.len());
        if skip > 0 {
            debug!(skipped = skip, "discarding bytes before next frame start");
            self.buffer.drain(..skip);
        }
    }
}

impl Splitter for FrameSplitter {
    fn split(&mut self, _ctx: &mut StageContext<'_>, chunk: &[u8]) -> Vec<Message> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            self.resync();
            if self.buffer.len() < HEADER_SIZE {
                break;
            }
            if (self.buffer[1] as usize) < MIN_BODY_LEN {
                debug!(length = self.buffer[1], "impossible frame length; resynchronising");
                self.buffer.remove(0);
                continue;
            }
            let Some(total) = peek_frame_len(&self.buffer) else {
                break;
            };
            if self.buffer.len() < total {
                trace!(have = self.buffer.len(), need = total, "partial frame buffered");
                break;
            }
            let frame: Vec<u8> = self.buffer.drain(..total).collect();
            frames.push(Message::new(frame));
        }
        frames
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

// ── Aggregation ───────────────────────────────────────────────────────────────

/// One transport write per frame.
#[derive(Debug, Default)]
pub struct FrameAggregator;

impl Aggregator for FrameAggregator {
    fn aggregate(&mut self, _ctx: &mut StageContext<'_>, message: Message) -> Vec<Vec<u8>> {
        vec![message.data]
    }
}

/// Spreads one frame over writes of at most `max_chunk` bytes, for links
/// with a small payload limit.
#[derive(Debug)]
pub struct ChunkedAggregator {
    max_chunk: usize,
}

impl ChunkedAggregator {
    /// `max_chunk` is clamped to at least one byte.
    pub fn new(max_chunk: usize) -> Self {
        Self {
            max_chunk: max_chunk.max(1),
        }
    }
}

impl Aggregator for ChunkedAggregator {
    fn aggregate(&mut self, _ctx: &mut StageContext<'_>, message: Message) -> Vec<Vec<u8>> {
        message
            .data
            .chunks(self.max_chunk)
            .map(<[u8]>::to_vec)
            .collect()
    }
}

// ── Transformation ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XorDirection {
    /// Clear → wire.
    Encode,
    /// Wire → clear.
    Decode,
}

/// Runs frame bodies through the session's obfuscation codec.
#[derive(Debug)]
pub struct XorTransformer {
    direction: XorDirection,
}

impl XorTransformer {
    pub fn new(direction: XorDirection) -> Self {
        Self { direction }
    }
}

impl Transformer for XorTransformer {
    fn transform(&mut self, ctx: &mut StageContext<'_>, mut message: Message) -> Option<Message> {
        match self.direction {
            XorDirection::Encode => ctx.codec.encode_frame(ctx.category, &mut message.data),
            XorDirection::Decode => ctx.codec.decode_frame(ctx.category, &mut message.data),
        }
        Some(message)
    }
}

#[derive(Debug, Default)]
pub struct IdentityTransformer;

impl Transformer for IdentityTransformer {
    fn transform(&mut self, _ctx: &mut StageContext<'_>, message: Message) -> Option<Message> {
        Some(message)
    }
}

// ── Responding and filtering ──────────────────────────────────────────────────

/// Acknowledges every register update the car sends.
#[derive(Debug, Default)]
pub struct CommandResponder;

impl Responder for CommandResponder {
    fn respond(&mut self, _ctx: &mut StageContext<'_>, message: &Message) -> Option<Message> {
        let decoded = message.decode().ok()?;
        if !decoded.is_car_update() {
            return None;
        }
        trace!(register = decoded.register, "acknowledging car update");
        Message::encode(&PhevMessage::register_ack(decoded.register)).ok()
    }
}

/// Suppresses car updates for a fixed set of registers.
#[derive(Debug, Default)]
pub struct RegisterFilter {
    registers: BTreeSet<u8>,
}

impl RegisterFilter {
    pub fn new(registers: impl IntoIterator<Item = u8>) -> Self {
        Self {
            registers: registers.into_iter().collect(),
        }
    }
}

impl Filter for RegisterFilter {
    fn filter(&mut self, _ctx: &mut StageContext<'_>, message: Message) -> Option<Message> {
        match message.decode() {
            Ok(m) if m.is_car_update() && self.registers.contains(&m.register) => None,
            _ => Some(message),
        }
    }
}

#[derive(Debug, Default)]
pub struct NoopConnectHook;

impl ConnectHook for NoopConnectHook {
    fn on_connect(&mut self, _ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// The standard stage set.  Car updates for `filtered_registers` are
/// suppressed (and not acknowledged).
pub fn phev_stages(filtered_registers: &[u8]) -> PipelineStages {
    let input_filter: Option<Box<dyn Filter>> = if filtered_registers.is_empty() {
        None
    } else {
        Some(Box::new(RegisterFilter::new(filtered_registers.iter().copied())))
    };

    PipelineStages {
        input_splitter: Box::new(FrameSplitter::new()),
        input_aggregator: Box::new(FrameAggregator),
        output_splitter: Box::new(FrameSplitter::new()),
        output_aggregator: Box::new(FrameAggregator),
        input_responder: Some(Box::new(CommandResponder)),
        output_responder: None,
        input_filter,
        output_filter: None,
        input_inbound: Box::new(XorTransformer::new(XorDirection::Decode)),
        input_outbound: Box::new(XorTransformer::new(XorDirection::Encode)),
        output_inbound: Box::new(IdentityTransformer),
        output_outbound: Box::new(IdentityTransformer),
        connect_hook: Box::new(NoopConnectHook),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
