//! Register values and writes awaiting acknowledgement.
//!
//! # Pending updates
//!
//! A write issued with a callback reserves one of [`MAX_PENDING_UPDATES`]
//! slots, keyed by register id.  Every reserved callback runs exactly once:
//!
//! | Event                          | Callback receives               |
//! |--------------------------------|---------------------------------|
//! | matching ack from the car      | `Ok(RegisterAck)`               |
//! | same register written again    | `Err(UpdateError::Superseded)`  |
//! | no ack within the timeout      | `Err(UpdateError::TimedOut)`    |
//! | session reset (reconnect)      | `Err(UpdateError::SessionReset)`|
//! | frame blocked by a filter      | `Err(UpdateError::NotSent)`     |
//!
//! A write whose frame fails at the transport is withdrawn instead: the
//! caller gets the error and the callback is dropped uncalled.
//!
//! Writing a register that already has a slot replaces the slot in place,
//! so a full table never rejects a re-write of a register it already tracks.
//!
//! Fire-and-forget writes take no slot, but are remembered until their ack
//! arrives so the ack is not mistaken for an unsolicited one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{IntegrityWarning, PhevError};

pub const MAX_PENDING_UPDATES: usize = 10;

/// Confirmation handed to an update callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterAck {
    pub register: u8,
    /// The value that was written and is now confirmed.
    pub value: Vec<u8>,
}

/// Why a pending update ended without an ack.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    #[error("replaced by a newer write to the same register")]
    Superseded,
    #[error("no acknowledgement before the timeout")]
    TimedOut,
    #[error("session was reset before the acknowledgement arrived")]
    SessionReset,
    #[error("write was blocked before reaching the vehicle")]
    NotSent,
}

pub type UpdateCallback = Box<dyn FnOnce(Result<RegisterAck, UpdateError>) + Send>;

/// How an incoming write ack was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Completed a pending update; its callback has run.
    Callback,
    /// Confirmed a fire-and-forget write.
    Expected,
}

struct PendingUpdate {
    register: u8,
    value: Vec<u8>,
    callback: UpdateCallback,
    issued_at: Instant,
}

impl PendingUpdate {
    fn complete(self, result: Result<RegisterAck, UpdateError>) {
        (self.callback)(result);
    }
}

pub struct RegisterStore {
    slots: [Option<PendingUpdate>; MAX_PENDING_UPDATES],
    /// Fire-and-forget writes not yet acknowledged.
    unconfirmed: HashMap<u8, (Vec<u8>, Instant)>,
    values: HashMap<u8, Vec<u8>>,
}

impl RegisterStore {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            unconfirmed: HashMap::new(),
            values: HashMap::new(),
        }
    }

    /// Number of occupied slots.
    pub fn pending_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_pending(&self, register: u8) -> bool {
        self.slot_index(register).is_some()
    }

    fn slot_index(&self, register: u8) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(p) if p.register == register))
    }

    /// Reserves a slot for a write that expects an ack.
    ///
    /// # Errors
    ///
    /// [`PhevError::CapacityExceeded`] if all slots are taken and none of them
    /// belongs to `register`.  No slot is created and `callback` is dropped
    /// without being called.
    pub fn reserve(
        &mut self,
        register: u8,
        value: Vec<u8>,
        callback: UpdateCallback,
        now: Instant,
    ) -> Result<(), PhevError> {
        let update = PendingUpdate {
            register,
            value,
            callback,
            issued_at: now,
        };

        if let Some(index) = self.slot_index(register) {
            debug!(register, "superseding pending update");
            if let Some(previous) = self.slots[index].replace(update) {
                previous.complete(Err(UpdateError::Superseded));
            }
            return Ok(());
        }

        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(update);
                Ok(())
            }
            None => Err(PhevError::CapacityExceeded {
                resource: "pending register update",
                capacity: MAX_PENDING_UPDATES,
            }),
        }
    }

    /// Frees the slot for `register` and hands back its callback uncalled.
    pub fn withdraw(&mut self, register: u8) -> Option<UpdateCallback> {
        let index = self.slot_index(register)?;
        self.slots[index].take().map(|update| update.callback)
    }

    /// Remembers a fire-and-forget write so its ack is recognised.
    pub fn note_write(&mut self, register: u8, value: Vec<u8>, now: Instant) {
        self.unconfirmed.insert(register, (value, now));
    }

    /// Matches a write ack from the car.
    ///
    /// # Errors
    ///
    /// [`IntegrityWarning::UnsolicitedAck`] if nothing was written to `register`.
    pub fn on_ack(&mut self, register: u8) -> Result<AckOutcome, IntegrityWarning> {
        if let Some(index) = self.slot_index(register) {
            if let Some(update) = self.slots[index].take() {
                self.unconfirmed.remove(&register);
                self.values.insert(register, update.value.clone());
                let ack = RegisterAck {
                    register,
                    value: update.value.clone(),
                };
                update.complete(Ok(ack));
                return Ok(AckOutcome::Callback);
            }
        }

        match self.unconfirmed.remove(&register) {
            Some((value, _)) => {
                self.values.insert(register, value);
                Ok(AckOutcome::Expected)
            }
            None => {
                warn!(register, "unsolicited register ack");
                Err(IntegrityWarning::UnsolicitedAck { register })
            }
        }
    }

    /// Frees every slot older than `timeout`, completing it with
    /// [`UpdateError::TimedOut`].  Returns the registers that timed out.
    ///
    /// Stale fire-and-forget entries are dropped quietly.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<u8> {
        let mut expired = Vec::new();
        for slot in self.slots.iter_mut() {
            let is_old = matches!(
                slot,
                Some(p) if now.saturating_duration_since(p.issued_at) >= timeout
            );
            if is_old {
                if let Some(update) = slot.take() {
                    expired.push(update.register);
                    update.complete(Err(UpdateError::TimedOut));
                }
            }
        }
        self.unconfirmed
            .retain(|_, (_, issued_at)| now.saturating_duration_since(*issued_at) < timeout);
        expired
    }

    /// Completes every pending update with [`UpdateError::SessionReset`].
    pub fn abandon_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(update) = slot.take() {
                update.complete(Err(UpdateError::SessionReset));
            }
        }
        self.unconfirmed.clear();
    }

    /// Stores the last known value of a register.
    pub fn record(&mut self, register: u8, data: Vec<u8>) {
        self.values.insert(register, data);
    }

    pub fn get(&self, register: u8) -> Option<&[u8]> {
        self.values.get(&register).map(Vec::as_slice)
    }
}

impl Default for RegisterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RegisterStore {
    fn drop(&mut self) {
        self.abandon_all();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
