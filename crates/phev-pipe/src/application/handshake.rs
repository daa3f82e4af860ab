//! Connection bring-up state machine.
//!
//! The machine is pure: it never touches a transport or a clock.  The
//! session feeds it [`HandshakeInput`]s together with the current instant and
//! carries out the [`HandshakeAction`]s it returns.
//!
//! # States
//!
//! ```text
//! Disconnected ─Start─► Connecting ─MacAccepted─► AwaitingVin ─Vin─┬─────────────────────────────► AwaitingStartAck ─StartAck─► Operational
//!                                                                  │                                 ▲
//!                                                                  └─► Registering ─ack─► AwaitingRegistrationAck ─complete─► RegistrationComplete
//! ```
//!
//! Any waiting state retries its action every `wait` and fails after
//! `max_retries` retries.  `Failed` is terminal.  Transport loss returns to
//! `Disconnected`, re-arms the retry budget and reconnects straight away.

use std::time::{Duration, Instant};

use phev_core::protocol::messages::{registers, MAC_LEN};
use tracing::{debug, info, warn};

use crate::application::events::VinEvent;
use crate::error::PhevError;

/// Retries allowed in one waiting state.
pub const PHEV_CONNECT_MAX_RETRIES: u32 = 5;

/// Delay between attempts.
pub const PHEV_CONNECT_WAIT_TIME: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Disconnected,
    Connecting,
    AwaitingVin,
    AwaitingStartAck,
    Registering,
    AwaitingRegistrationAck,
    RegistrationComplete,
    Operational,
    Failed,
}

impl HandshakeState {
    /// States in which the machine waits for the car and retries on timeout.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            HandshakeState::Connecting
                | HandshakeState::AwaitingVin
                | HandshakeState::AwaitingStartAck
                | HandshakeState::Registering
                | HandshakeState::AwaitingRegistrationAck
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: PHEV_CONNECT_MAX_RETRIES,
            wait: PHEV_CONNECT_WAIT_TIME,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeInput {
    /// The session was started with this device MAC.
    Start { mac: [u8; MAC_LEN] },
    /// The vehicle transport connected and the pre-connect hook succeeded.
    TransportReady,
    /// The MAC announcement was written.
    MacAccepted,
    Vin(VinEvent),
    /// The car acknowledged a write to this register.
    RegisterAck(u8),
    RegistrationComplete,
    StartAck,
    MaxRegistrations,
    TransportLost,
    /// The session was stopped; forget the MAC and stay disconnected.
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    Connect,
    SendMac([u8; MAC_LEN]),
    SendRegistration,
    SendStart,
    NotifyRegistrationComplete,
    MarkConnected,
    Report(PhevError),
    /// Drop session state tied to the old connection.
    ResetSession,
}

pub struct HandshakeMachine {
    state: HandshakeState,
    register_device: bool,
    max_registrations: u8,
    policy: RetryPolicy,
    mac: Option<[u8; MAC_LEN]>,
    registrations: u8,
    attempts: u32,
    last_attempt: Option<Instant>,
    registration_notified: bool,
    history: Vec<HandshakeState>,
}

impl HandshakeMachine {
    pub fn new(register_device: bool, max_registrations: u8, policy: RetryPolicy) -> Self {
        Self {
            state: HandshakeState::Disconnected,
            register_device,
            max_registrations,
            policy,
            mac: None,
            registrations: 0,
            attempts: 0,
            last_attempt: None,
            registration_notified: false,
            history: vec![HandshakeState::Disconnected],
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn mac(&self) -> Option<[u8; MAC_LEN]> {
        self.mac
    }

    /// Every state entered since construction, oldest first.
    pub fn history(&self) -> &[HandshakeState] {
        &self.history
    }

    /// Retries spent in the current state.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn enter(&mut self, next: HandshakeState, now: Instant) {
        debug!(from = ?self.state, to = ?next, "handshake transition");
        self.state = next;
        self.attempts = 0;
        self.last_attempt = Some(now);
        self.history.push(next);
    }

    fn fail(&mut self, error: PhevError, now: Instant) -> Vec<HandshakeAction> {
        self.enter(HandshakeState::Failed, now);
        vec![HandshakeAction::Report(error)]
    }

    /// Applies one input and returns the actions the session must perform.
    pub fn handle(&mut self, input: HandshakeInput, now: Instant) -> Vec<HandshakeAction> {
        use HandshakeInput as In;
        use HandshakeState as S;

        if self.state == S::Failed {
            debug!(?input, "handshake failed; input ignored");
            return Vec::new();
        }

        match (self.state, input) {
            (S::Disconnected, In::Start { mac }) => {
                self.mac = Some(mac);
                self.enter(S::Connecting, now);
                vec![HandshakeAction::Connect]
            }
            (S::Connecting, In::TransportReady) => match self.mac {
                Some(mac) => vec![HandshakeAction::SendMac(mac)],
                None => Vec::new(),
            },
            (S::Connecting, In::MacAccepted) => {
                self.enter(S::AwaitingVin, now);
                Vec::new()
            }
            (S::AwaitingVin, In::Vin(vin)) => self.on_vin(&vin, now),
            (S::Registering, In::RegisterAck(register))
                if register == registers::REGISTRATION_REQUEST =>
            {
                self.enter(S::AwaitingRegistrationAck, now);
                Vec::new()
            }
            (S::Registering | S::AwaitingRegistrationAck, In::RegistrationComplete) => {
                self.enter(S::RegistrationComplete, now);
                let mut actions = Vec::new();
                if !self.registration_notified {
                    self.registration_notified = true;
                    actions.push(HandshakeAction::NotifyRegistrationComplete);
                }
                self.enter(S::AwaitingStartAck, now);
                actions.push(HandshakeAction::SendStart);
                actions
            }
            (S::AwaitingStartAck, In::StartAck) => {
                self.enter(S::Operational, now);
                info!("handshake complete");
                vec![HandshakeAction::MarkConnected]
            }
            (state, In::StartAck) => {
                debug!(?state, "start ack outside AwaitingStartAck ignored");
                Vec::new()
            }
            (S::Disconnected, In::MaxRegistrations) => Vec::new(),
            (_, In::MaxRegistrations) => self.fail(
                PhevError::MaxRegistrationsReached {
                    registrations: self.registrations,
                },
                now,
            ),
            (_, In::TransportLost) => self.on_transport_lost(now),
            (state, In::Stop) => {
                self.mac = None;
                if state != S::Disconnected {
                    info!(?state, "handshake stopped");
                    self.enter(S::Disconnected, now);
                }
                Vec::new()
            }
            (state, input) => {
                debug!(?state, ?input, "input has no effect");
                Vec::new()
            }
        }
    }

    fn on_vin(&mut self, vin: &VinEvent, now: Instant) -> Vec<HandshakeAction> {
        self.registrations = vin.registrations;
        if !self.register_device {
            self.enter(HandshakeState::AwaitingStartAck, now);
            return vec![HandshakeAction::SendStart];
        }
        if vin.registrations >= self.max_registrations {
            warn!(
                registrations = vin.registrations,
                max = self.max_registrations,
                "vehicle has no free registration slots"
            );
            return self.fail(
                PhevError::MaxRegistrationsReached {
                    registrations: vin.registrations,
                },
                now,
            );
        }
        self.enter(HandshakeState::Registering, now);
        vec![HandshakeAction::SendRegistration]
    }

    fn on_transport_lost(&mut self, now: Instant) -> Vec<HandshakeAction> {
        warn!(state = ?self.state, "transport lost");
        self.enter(HandshakeState::Disconnected, now);
        let mut actions = vec![HandshakeAction::ResetSession];
        if self.mac.is_some() {
            self.enter(HandshakeState::Connecting, now);
            actions.push(HandshakeAction::Connect);
        }
        actions
    }

    /// Retries the current state's action when its wait has elapsed, and
    /// fails once the retry budget is spent.
    pub fn tick(&mut self, now: Instant) -> Vec<HandshakeAction> {
        if !self.state.is_waiting() {
            return Vec::new();
        }
        let due = self
            .last_attempt
            .map_or(true, |last| now.saturating_duration_since(last) >= self.policy.wait);
        if !due {
            return Vec::new();
        }

        if self.attempts >= self.policy.max_retries {
            let state = self.state;
            let attempts = self.attempts;
            warn!(?state, attempts, "handshake retry budget exhausted");
            return self.fail(PhevError::HandshakeTimeout { state, attempts }, now);
        }

        self.attempts += 1;
        self.last_attempt = Some(now);
        debug!(state = ?self.state, attempt = self.attempts, "handshake retry");

        let action = match self.state {
            HandshakeState::Connecting => HandshakeAction::Connect,
            HandshakeState::AwaitingVin => match self.mac {
                Some(mac) => HandshakeAction::SendMac(mac),
                None => return Vec::new(),
            },
            HandshakeState::AwaitingStartAck => HandshakeAction::SendStart,
            HandshakeState::Registering | HandshakeState::AwaitingRegistrationAck => {
                HandshakeAction::SendRegistration
            }
            _ => return Vec::new(),
        };
        vec![action]
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x24, 0x0A, 0xC4, 0x11, 0x22, 0x33];

    fn vin(registrations: u8) -> VinEvent {
        VinEvent {
            vin: "JMAXDGG2WGZ002035".to_string(),
            flag: 0x01,
            registrations,
        }
    }

    /// Drives a machine to `AwaitingVin`.
    fn awaiting_vin(register_device: bool, now: Instant) -> HandshakeMachine {
        let mut machine = HandshakeMachine::new(register_device, 3, RetryPolicy::default());
        assert_eq!(
            machine.handle(HandshakeInput::Start { mac: MAC }, now),
            vec![HandshakeAction::Connect]
        );
        assert_eq!(
            machine.handle(HandshakeInput::TransportReady, now),
            vec![HandshakeAction::SendMac(MAC)]
        );
        machine.handle(HandshakeInput::MacAccepted, now);
        assert_eq!(machine.state(), HandshakeState::AwaitingVin);
        machine
    }

    fn assert_start_ack_precedes_operational(history: &[HandshakeState]) {
        let op = history
            .iter()
            .position(|s| *s == HandshakeState::Operational)
            .expect("reached Operational");
        assert_eq!(history[op - 1], HandshakeState::AwaitingStartAck);
    }

    #[test]
    fn test_registered_device_goes_straight_to_start() {
        // Arrange
        let now = Instant::now();
        let mut machine = awaiting_vin(false, now);

        // Act
        let on_vin = machine.handle(HandshakeInput::Vin(vin(1)), now);
        let on_ack = machine.handle(HandshakeInput::StartAck, now);

        // Assert
        assert_eq!(on_vin, vec![HandshakeAction::SendStart]);
        assert_eq!(on_ack, vec![HandshakeAction::MarkConnected]);
        assert_eq!(machine.state(), HandshakeState::Operational);
        assert_start_ack_precedes_operational(machine.history());
    }

    #[test]
    fn test_registration_branch_passes_through_start_ack() {
        // Arrange
        let now = Instant::now();
        let mut machine = awaiting_vin(true, now);

        // Act
        assert_eq!(
            machine.handle(HandshakeInput::Vin(vin(0)), now),
            vec![HandshakeAction::SendRegistration]
        );
        machine.handle(HandshakeInput::RegisterAck(registers::REGISTRATION_REQUEST), now);
        let on_complete = machine.handle(HandshakeInput::RegistrationComplete, now);
        machine.handle(HandshakeInput::StartAck, now);

        // Assert
        assert_eq!(
            on_complete,
            vec![
                HandshakeAction::NotifyRegistrationComplete,
                HandshakeAction::SendStart
            ]
        );
        assert_eq!(
            machine.history(),
            &[
                HandshakeState::Disconnected,
                HandshakeState::Connecting,
                HandshakeState::AwaitingVin,
                HandshakeState::Registering,
                HandshakeState::AwaitingRegistrationAck,
                HandshakeState::RegistrationComplete,
                HandshakeState::AwaitingStartAck,
                HandshakeState::Operational,
            ]
        );
    }

    #[test]
    fn test_start_ack_outside_awaiting_start_ack_is_ignored() {
        let now = Instant::now();
        let mut machine = awaiting_vin(true, now);

        assert!(machine.handle(HandshakeInput::StartAck, now).is_empty());
        machine.handle(HandshakeInput::Vin(vin(0)), now);
        assert!(machine.handle(HandshakeInput::StartAck, now).is_empty());

        assert_eq!(machine.state(), HandshakeState::Registering);
    }

    #[test]
    fn test_vin_at_max_registrations_fails_without_registration_send() {
        // Arrange
        let now = Instant::now();
        let mut machine = awaiting_vin(true, now);

        // Act
        let actions = machine.handle(HandshakeInput::Vin(vin(3)), now);

        // Assert
        assert_eq!(
            actions,
            vec![HandshakeAction::Report(PhevError::MaxRegistrationsReached {
                registrations: 3
            })]
        );
        assert!(!actions.contains(&HandshakeAction::SendRegistration));
        assert_eq!(machine.state(), HandshakeState::Failed);
        assert!(!machine.history().contains(&HandshakeState::Registering));
    }

    #[test]
    fn test_max_registrations_event_fails_from_any_active_state() {
        let now = Instant::now();
        let mut machine = awaiting_vin(true, now);
        machine.handle(HandshakeInput::Vin(vin(1)), now);

        let actions = machine.handle(HandshakeInput::MaxRegistrations, now);

        assert!(matches!(
            actions.as_slice(),
            [HandshakeAction::Report(PhevError::MaxRegistrationsReached { registrations: 1 })]
        ));
        assert_eq!(machine.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_failed_is_terminal() {
        let now = Instant::now();
        let mut machine = awaiting_vin(true, now);
        machine.handle(HandshakeInput::Vin(vin(9)), now);

        assert!(machine.handle(HandshakeInput::TransportLost, now).is_empty());
        assert!(machine.handle(HandshakeInput::Start { mac: MAC }, now).is_empty());
        assert!(machine.tick(now + Duration::from_secs(60)).is_empty());
        assert_eq!(machine.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_registration_complete_notifies_once_per_session() {
        // Arrange
        let now = Instant::now();
        let mut machine = awaiting_vin(true, now);
        machine.handle(HandshakeInput::Vin(vin(0)), now);
        machine.handle(HandshakeInput::RegistrationComplete, now);

        // Act: reconnect and register again
        machine.handle(HandshakeInput::TransportLost, now);
        machine.handle(HandshakeInput::TransportReady, now);
        machine.handle(HandshakeInput::MacAccepted, now);
        machine.handle(HandshakeInput::Vin(vin(0)), now);
        let second = machine.handle(HandshakeInput::RegistrationComplete, now);

        // Assert
        assert_eq!(second, vec![HandshakeAction::SendStart]);
    }

    #[test]
    fn test_tick_retries_then_times_out() {
        // Arrange
        let start = Instant::now();
        let policy = RetryPolicy {
            max_retries: 2,
            wait: Duration::from_millis(100),
        };
        let mut machine = HandshakeMachine::new(false, 3, policy);
        machine.handle(HandshakeInput::Start { mac: MAC }, start);
        machine.handle(HandshakeInput::MacAccepted, start);

        // Act
        let early = machine.tick(start + Duration::from_millis(50));
        let first = machine.tick(start + Duration::from_millis(100));
        let second = machine.tick(start + Duration::from_millis(200));
        let exhausted = machine.tick(start + Duration::from_millis(300));

        // Assert
        assert!(early.is_empty());
        assert_eq!(first, vec![HandshakeAction::SendMac(MAC)]);
        assert_eq!(second, vec![HandshakeAction::SendMac(MAC)]);
        assert_eq!(
            exhausted,
            vec![HandshakeAction::Report(PhevError::HandshakeTimeout {
                state: HandshakeState::AwaitingVin,
                attempts: 2
            })]
        );
        assert_eq!(machine.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_transport_lost_rearms_budget_and_reconnects() {
        // Arrange
        let start = Instant::now();
        let policy = RetryPolicy {
            max_retries: 1,
            wait: Duration::from_millis(10),
        };
        let mut machine = HandshakeMachine::new(false, 3, policy);
        machine.handle(HandshakeInput::Start { mac: MAC }, start);
        machine.tick(start + Duration::from_millis(10));
        assert_eq!(machine.attempts(), 1);

        // Act
        let actions = machine.handle(HandshakeInput::TransportLost, start + Duration::from_millis(15));

        // Assert
        assert_eq!(
            actions,
            vec![HandshakeAction::ResetSession, HandshakeAction::Connect]
        );
        assert_eq!(machine.state(), HandshakeState::Connecting);
        assert_eq!(machine.attempts(), 0);
        let tail = &machine.history()[machine.history().len() - 2..];
        assert_eq!(tail, &[HandshakeState::Disconnected, HandshakeState::Connecting]);
    }

    #[test]
    fn test_operational_does_not_tick() {
        let now = Instant::now();
        let mut machine = awaiting_vin(false, now);
        machine.handle(HandshakeInput::Vin(vin(0)), now);
        machine.handle(HandshakeInput::StartAck, now);

        assert!(machine.tick(now + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_stop_leaves_operational_and_does_not_reconnect() {
        // Arrange
        let now = Instant::now();
        let mut machine = awaiting_vin(false, now);
        machine.handle(HandshakeInput::Vin(vin(0)), now);
        machine.handle(HandshakeInput::StartAck, now);

        // Act
        let on_stop = machine.handle(HandshakeInput::Stop, now);
        let on_lost = machine.handle(HandshakeInput::TransportLost, now);

        // Assert
        assert!(on_stop.is_empty());
        assert_eq!(machine.mac(), None);
        assert_eq!(on_lost, vec![HandshakeAction::ResetSession]);
        assert_eq!(machine.state(), HandshakeState::Disconnected);
    }

    #[test]
    fn test_vin_after_vin_is_ignored() {
        let now = Instant::now();
        let mut machine = awaiting_vin(false, now);
        machine.handle(HandshakeInput::Vin(vin(0)), now);

        let again = machine.handle(HandshakeInput::Vin(vin(0)), now);

        assert!(again.is_empty());
        assert_eq!(machine.state(), HandshakeState::AwaitingStartAck);
    }
}
