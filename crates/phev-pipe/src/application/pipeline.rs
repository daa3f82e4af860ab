//! Bidirectional message pipeline.
//!
//! The pipeline sits between two transports: the vehicle side ("input") and
//! an optional application side ("output"), such as a bridge to another
//! process.  Raw bytes are turned into frames and back by six kinds of
//! pluggable stage, each a trait object chosen when the session is built.
//!
//! # Direction of travel
//!
//! ```text
//! vehicle ─read─► split ─► input-inbound transform ─► filter ─► respond ─► (events) ─► output-outbound transform ─► aggregate ─► app
//!                                                              │
//!                                                              └─ reply ─► input-outbound transform ─► aggregate ─► vehicle
//!
//! app ─read─► split ─► output-inbound transform ─┐
//! session-generated ─────────────────────────────┴─► filter ─► respond ─► input-outbound transform ─► aggregate ─► vehicle
//! ```
//!
//! A stage returning `None` ends processing of that message without error.
//! A filter returning `None` also surfaces the dropped frame to the caller
//! so a filtered-message event can be raised.  Messages are never reordered
//! within one direction.
//!
//! The session's [`ObfuscationCodec`] is owned here and lent to every stage
//! through [`StageContext`], together with the XOR category the current
//! message must use.

use phev_core::{decode_message, encode_message, ObfuscationCodec, PhevMessage, ProtocolError, XorCategory};
use thiserror::Error;
use tracing::{debug, trace};

use crate::application::transport::{Transport, TransportError};
use crate::error::PhevError;

/// Pipeline failures that are not plain vehicle-transport errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The pre-connect hook refused the connection.
    #[error("connect hook failed: {0}")]
    ConnectHook(String),

    /// The application-side transport failed.  The vehicle session is unaffected.
    #[error("output transport: {0}")]
    Output(TransportError),
}

// ── Message ───────────────────────────────────────────────────────────────────

/// One frame travelling through the pipeline.
///
/// Between the transport and the XOR transformer the body is obfuscated;
/// everywhere else it is clear and [`decode`](Self::decode) succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Serialises a typed message into a clear frame.
    pub fn encode(message: &PhevMessage) -> Result<Self, ProtocolError> {
        encode_message(message).map(Self::new)
    }

    /// Parses a clear frame.
    pub fn decode(&self) -> Result<PhevMessage, ProtocolError> {
        decode_message(&self.data).map(|(message, _)| message)
    }

    /// The clear command byte, if the frame has one.
    pub fn command(&self) -> Option<u8> {
        self.data.first().copied()
    }
}

/// Per-invocation state lent to every stage.
pub struct StageContext<'a> {
    pub codec: &'a mut ObfuscationCodec,
    /// Forces a XOR category; `None` derives it from the command byte.
    pub category: Option<XorCategory>,
}

impl<'a> StageContext<'a> {
    pub fn new(codec: &'a mut ObfuscationCodec, category: Option<XorCategory>) -> Self {
        Self { codec, category }
    }
}

// ── Stage traits ──────────────────────────────────────────────────────────────

/// Cuts a raw byte stream into frames, buffering partial ones.
pub trait Splitter: Send {
    fn split(&mut self, ctx: &mut StageContext<'_>, chunk: &[u8]) -> Vec<Message>;

    /// Discards buffered bytes (called on reconnect).
    fn reset(&mut self) {}
}

/// Turns one outbound frame into the writes that carry it.
pub trait Aggregator: Send {
    fn aggregate(&mut self, ctx: &mut StageContext<'_>, message: Message) -> Vec<Vec<u8>>;
}

pub trait Transformer: Send {
    fn transform(&mut self, ctx: &mut StageContext<'_>, message: Message) -> Option<Message>;
}

pub trait Filter: Send {
    fn filter(&mut self, ctx: &mut StageContext<'_>, message: Message) -> Option<Message>;
}

/// Synthesises an immediate protocol-level reply, such as an ack.
pub trait Responder: Send {
    fn respond(&mut self, ctx: &mut StageContext<'_>, message: &Message) -> Option<Message>;
}

/// Transport-specific setup run once the vehicle link is open.
pub trait ConnectHook: Send {
    fn on_connect(&mut self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError>;
}

/// Every stage implementation of one pipeline.
pub struct PipelineStages {
    pub input_splitter: Box<dyn Splitter>,
    pub input_aggregator: Box<dyn Aggregator>,
    pub output_splitter: Box<dyn Splitter>,
    pub output_aggregator: Box<dyn Aggregator>,
    pub input_responder: Option<Box<dyn Responder>>,
    pub output_responder: Option<Box<dyn Responder>>,
    pub input_filter: Option<Box<dyn Filter>>,
    pub output_filter: Option<Box<dyn Filter>>,
    /// Vehicle → engine.
    pub input_inbound: Box<dyn Transformer>,
    /// Engine → vehicle.
    pub input_outbound: Box<dyn Transformer>,
    /// Application → engine.
    pub output_inbound: Box<dyn Transformer>,
    /// Engine → application.
    pub output_outbound: Box<dyn Transformer>,
    pub connect_hook: Box<dyn ConnectHook>,
}

// ── Results ───────────────────────────────────────────────────────────────────

/// What became of one frame received from the vehicle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A clear frame that decoded successfully.
    Message { frame: Message, message: PhevMessage },
    /// The input filter suppressed this clear frame.
    Filtered(Message),
    /// The frame did not decode after de-obfuscation.
    Malformed(ProtocolError),
}

/// What became of one frame sent towards the vehicle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Sent,
    /// The output filter suppressed this clear frame.
    Filtered(Message),
    /// A transformer dropped the frame.
    Dropped,
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub struct MessagePipeline {
    input: Box<dyn Transport>,
    output: Option<Box<dyn Transport>>,
    stages: PipelineStages,
    codec: ObfuscationCodec,
}

impl MessagePipeline {
    pub fn new(
        input: Box<dyn Transport>,
        output: Option<Box<dyn Transport>>,
        stages: PipelineStages,
        codec: ObfuscationCodec,
    ) -> Self {
        Self {
            input,
            output,
            stages,
            codec,
        }
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    pub fn input_connected(&self) -> bool {
        self.input.is_connected()
    }

    /// Opens the vehicle link and runs the pre-connect hook.
    pub fn connect_input(&mut self) -> Result<(), PhevError> {
        if !self.input.is_connected() {
            self.input.connect()?;
        }
        let mut ctx = StageContext::new(&mut self.codec, None);
        self.stages.connect_hook.on_connect(&mut ctx)?;
        Ok(())
    }

    /// Opens the application-side link, if one is configured.
    pub fn connect_output(&mut self) -> Result<(), PhevError> {
        match self.output.as_mut() {
            Some(out) if !out.is_connected() => out
                .connect()
                .map_err(|e| PipelineError::Output(e).into()),
            _ => Ok(()),
        }
    }

    pub fn disconnect_input(&mut self) {
        self.input.disconnect();
        self.stages.input_splitter.reset();
    }

    pub fn disconnect_output(&mut self) {
        if let Some(out) = self.output.as_mut() {
            out.disconnect();
        }
        self.stages.output_splitter.reset();
    }

    /// Drops partial frames and re-seeds the obfuscation keys.
    pub fn reset(&mut self) {
        self.codec.reset();
        self.stages.input_splitter.reset();
        self.stages.output_splitter.reset();
    }

    /// Reads once from the vehicle and runs every complete frame through the
    /// inbound stages.  Responder replies are written back before returning.
    pub fn receive(&mut self) -> Result<Vec<Inbound>, PhevError> {
        let Some(chunk) = self.input.read()? else {
            return Ok(Vec::new());
        };
        trace!(len = chunk.len(), "vehicle bytes received");

        let frames = {
            let mut ctx = StageContext::new(&mut self.codec, None);
            self.stages.input_splitter.split(&mut ctx, &chunk)
        };

        let mut items = Vec::with_capacity(frames.len());
        for frame in frames {
            if let Some(item) = self.process_inbound(frame)? {
                items.push(item);
            }
        }
        Ok(items)
    }

    fn process_inbound(&mut self, frame: Message) -> Result<Option<Inbound>, PhevError> {
        let mut ctx = StageContext::new(&mut self.codec, None);
        let Some(frame) = self.stages.input_inbound.transform(&mut ctx, frame) else {
            return Ok(None);
        };

        let frame = match self.stages.input_filter.as_mut() {
            Some(filter) => {
                let snapshot = frame.clone();
                match filter.filter(&mut ctx, frame) {
                    Some(frame) => frame,
                    None => return Ok(Some(Inbound::Filtered(snapshot))),
                }
            }
            None => frame,
        };

        let reply = self
            .stages
            .input_responder
            .as_mut()
            .and_then(|responder| responder.respond(&mut ctx, &frame));
        if let Some(reply) = reply {
            self.write_to_vehicle(reply, None)?;
        }

        Ok(Some(match frame.decode() {
            Ok(message) => Inbound::Message { frame, message },
            Err(e) => Inbound::Malformed(e),
        }))
    }

    /// Sends a session-generated clear frame through the outbound stages.
    ///
    /// `category` selects the XOR accumulator; `None` derives it from the
    /// command byte.
    pub fn send_frame(
        &mut self,
        frame: Message,
        category: Option<XorCategory>,
    ) -> Result<Outbound, PhevError> {
        let mut ctx = StageContext::new(&mut self.codec, category);

        let frame = match self.stages.output_filter.as_mut() {
            Some(filter) => {
                let snapshot = frame.clone();
                match filter.filter(&mut ctx, frame) {
                    Some(frame) => frame,
                    None => return Ok(Outbound::Filtered(snapshot)),
                }
            }
            None => frame,
        };

        let reply = self
            .stages
            .output_responder
            .as_mut()
            .and_then(|responder| responder.respond(&mut ctx, &frame));
        if let Some(reply) = reply {
            self.forward_to_output(reply)?;
        }

        if self.write_to_vehicle(frame, category)? {
            Ok(Outbound::Sent)
        } else {
            Ok(Outbound::Dropped)
        }
    }

    /// Returns `false` if the outbound transformer dropped the frame.
    fn write_to_vehicle(
        &mut self,
        frame: Message,
        category: Option<XorCategory>,
    ) -> Result<bool, PhevError> {
        let mut ctx = StageContext::new(&mut self.codec, category);
        let Some(frame) = self.stages.input_outbound.transform(&mut ctx, frame) else {
            return Ok(false);
        };
        for bytes in self.stages.input_aggregator.aggregate(&mut ctx, frame) {
            trace!(len = bytes.len(), "writing to vehicle");
            self.input.write(&bytes)?;
        }
        Ok(true)
    }

    /// Hands a clear inbound frame to the application side.  A no-op when no
    /// output transport is configured or it is not connected.
    pub fn forward_to_output(&mut self, frame: Message) -> Result<(), PhevError> {
        let Some(out) = self.output.as_mut() else {
            return Ok(());
        };
        if !out.is_connected() {
            return Ok(());
        }
        let mut ctx = StageContext::new(&mut self.codec, None);
        let Some(frame) = self.stages.output_outbound.transform(&mut ctx, frame) else {
            return Ok(());
        };
        for bytes in self.stages.output_aggregator.aggregate(&mut ctx, frame) {
            out.write(&bytes).map_err(PipelineError::Output)?;
        }
        Ok(())
    }

    /// Reads once from the application side and relays every frame to the
    /// vehicle through the outbound stages.
    pub fn poll_output(&mut self) -> Result<Vec<Outbound>, PhevError> {
        let chunk = match self.output.as_mut() {
            Some(out) if out.is_connected() => out.read().map_err(PipelineError::Output)?,
            _ => return Ok(Vec::new()),
        };
        let Some(chunk) = chunk else {
            return Ok(Vec::new());
        };
        debug!(len = chunk.len(), "application bytes received");

        let frames = {
            let mut ctx = StageContext::new(&mut self.codec, None);
            self.stages.output_splitter.split(&mut ctx, &chunk)
        };

        let mut results = Vec::with_capacity(frames.len());
        for frame in frames {
            let transformed = {
                let mut ctx = StageContext::new(&mut self.codec, None);
                self.stages.output_inbound.transform(&mut ctx, frame)
            };
            match transformed {
                Some(frame) => results.push(self.send_frame(frame, None)?),
                None => results.push(Outbound::Dropped),
            }
        }
        Ok(results)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
