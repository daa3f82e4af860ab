//! Keepalive heartbeat.
//!
//! Every ping carries an incrementing one-byte counter which the car echoes
//! back.  The manager only keeps the bookkeeping; the session decides when to
//! ping and sends the frame on the ping XOR channel.

use std::time::{Duration, Instant};

use phev_core::PhevMessage;
use tracing::{debug, warn};

use crate::error::IntegrityWarning;

#[derive(Debug, Default)]
pub struct KeepaliveManager {
    last_ping_time: Option<Instant>,
    current_ping: u8,
    ping_response: Option<u8>,
    unanswered: u32,
}

impl KeepaliveManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the counter and returns the ping to send.
    pub fn ping(&mut self, now: Instant) -> PhevMessage {
        self.current_ping = self.current_ping.wrapping_add(1);
        self.last_ping_time = Some(now);
        self.unanswered += 1;
        debug!(ping = self.current_ping, unanswered = self.unanswered, "ping");
        PhevMessage::ping(self.current_ping)
    }

    /// Forgets all ping state.  Used on reconnect.
    pub fn reset_ping(&mut self) {
        *self = Self::default();
    }

    /// Records an echoed counter.
    ///
    /// Any response proves the link is alive, so the unanswered count is
    /// cleared either way.
    ///
    /// # Errors
    ///
    /// [`IntegrityWarning::PingMismatch`] if `echoed` is not the most
    /// recently sent counter.
    pub fn on_ping_response(&mut self, echoed: u8) -> Result<(), IntegrityWarning> {
        self.ping_response = Some(echoed);
        self.unanswered = 0;
        if echoed != self.current_ping {
            warn!(expected = self.current_ping, received = echoed, "ping echo mismatch");
            return Err(IntegrityWarning::PingMismatch {
                expected: self.current_ping,
                received: echoed,
            });
        }
        Ok(())
    }

    /// `true` if no ping was ever sent or `interval` has elapsed since the last.
    pub fn is_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_ping_time
            .map_or(true, |last| now.saturating_duration_since(last) >= interval)
    }

    /// `true` once `max_missed` pings in a row went unanswered.  Zero disables
    /// the check.
    pub fn is_stale(&self, max_missed: u32) -> bool {
        max_missed > 0 && self.unanswered >= max_missed
    }

    pub fn current_ping(&self) -> u8 {
        self.current_ping
    }

    pub fn ping_response(&self) -> Option<u8> {
        self.ping_response
    }

    pub fn last_ping_time(&self) -> Option<Instant> {
        self.last_ping_time
    }

    pub fn unanswered(&self) -> u32 {
        self.unanswered
    }
}
