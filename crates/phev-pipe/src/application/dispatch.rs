//! Bounded fan-out of [`PipeEvent`]s to registered handlers.
//!
//! At most [`MAX_EVENT_HANDLERS`] handlers can be registered.  They run in
//! registration order; the first one that returns [`EventOutcome::Handled`]
//! ends the fan-out for that event.
//!
//! Handlers cannot borrow the session while it is dispatching, so they get a
//! [`HandlerContext`] instead: a read-only [`SessionStatus`] snapshot plus a
//! queue of register writes the session sends once dispatch completes.

use tracing::debug;
use uuid::Uuid;

use crate::application::events::PipeEvent;
use crate::application::handshake::HandshakeState;
use crate::error::PhevError;

pub const MAX_EVENT_HANDLERS: usize = 10;

/// Identifies a registered handler so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u32);

/// Whether a handler consumed the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Let the next handler see the event.
    Continue,
    /// Stop the fan-out here.
    Handled,
}

/// Read-only view of a session, taken just before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub state: HandshakeState,
    pub connected: bool,
    pub vin: Option<String>,
    pub registrations: Option<u8>,
    /// Counter carried by the most recent ping.
    pub last_ping: u8,
    /// Counter echoed by the most recent ping response.
    pub ping_response: Option<u8>,
    pub pending_updates: usize,
}

/// A register write requested by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterWrite {
    pub register: u8,
    pub data: Vec<u8>,
}

pub struct HandlerContext<'a> {
    status: &'a SessionStatus,
    writes: Vec<RegisterWrite>,
}

impl<'a> HandlerContext<'a> {
    fn new(status: &'a SessionStatus) -> Self {
        Self {
            status,
            writes: Vec::new(),
        }
    }

    pub fn status(&self) -> &SessionStatus {
        self.status
    }

    /// Queues a single-byte register write.
    pub fn update_register(&mut self, register: u8, value: u8) {
        self.update_complex_register(register, &[value]);
    }

    /// Queues a multi-byte register write.
    pub fn update_complex_register(&mut self, register: u8, data: &[u8]) {
        self.writes.push(RegisterWrite {
            register,
            data: data.to_vec(),
        });
    }
}

/// An observer of session events.
///
/// Implemented for every `FnMut(&mut HandlerContext, &PipeEvent) -> EventOutcome`.
pub trait EventHandler: Send {
    fn handle(&mut self, ctx: &mut HandlerContext<'_>, event: &PipeEvent) -> EventOutcome;
}

impl<F> EventHandler for F
where
    F: FnMut(&mut HandlerContext<'_>, &PipeEvent) -> EventOutcome + Send,
{
    fn handle(&mut self, ctx: &mut HandlerContext<'_>, event: &PipeEvent) -> EventOutcome {
        self(ctx, event)
    }
}

/// Result of dispatching one event.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Number of handlers that ran.
    pub invoked: usize,
    /// The handler that stopped the fan-out, if any.
    pub handled_by: Option<HandlerId>,
    /// Register writes queued by the handlers, in order.
    pub writes: Vec<RegisterWrite>,
}

pub struct EventDispatcher {
    handlers: Vec<(HandlerId, Box<dyn EventHandler>)>,
    next_id: u32,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::with_capacity(MAX_EVENT_HANDLERS),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Appends a handler.
    ///
    /// # Errors
    ///
    /// [`PhevError::CapacityExceeded`] when [`MAX_EVENT_HANDLERS`] are
    /// already registered.
    pub fn register(&mut self, handler: Box<dyn EventHandler>) -> Result<HandlerId, PhevError> {
        if self.handlers.len() >= MAX_EVENT_HANDLERS {
            return Err(PhevError::CapacityExceeded {
                resource: "event handler",
                capacity: MAX_EVENT_HANDLERS,
            });
        }
        let id = HandlerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.handlers.push((id, handler));
        Ok(id)
    }

    /// Removes a handler.  Returns `false` if `id` was not registered.
    pub fn deregister(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(handler_id, _)| *handler_id != id);
        self.handlers.len() != before
    }

    /// Runs the handlers over `event`, then drops it.
    pub fn dispatch(&mut self, event: PipeEvent, status: &SessionStatus) -> DispatchReport {
        let mut ctx = HandlerContext::new(status);
        let mut report = DispatchReport::default();

        for (id, handler) in self.handlers.iter_mut() {
            report.invoked += 1;
            if handler.handle(&mut ctx, &event) == EventOutcome::Handled {
                report.handled_by = Some(*id);
                break;
            }
        }

        debug!(
            kind = ?event.kind(),
            invoked = report.invoked,
            handled = report.handled_by.is_some(),
            "event dispatched"
        );
        report.writes = ctx.writes;
        report
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// A handler that logs every event at debug level and never consumes it.
pub fn logging_handler(ctx: &mut HandlerContext<'_>, event: &PipeEvent) -> EventOutcome {
    match event {
        PipeEvent::FilteredMessage(frame) => {
            debug!(session_id = %ctx.status().session_id, command = ?frame.first(), "message filtered");
        }
        _ => debug!(session_id = %ctx.status().session_id, ?event, "event"),
    }
    EventOutcome::Continue
}
