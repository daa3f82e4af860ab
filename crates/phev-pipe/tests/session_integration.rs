//! Integration tests for the session engine.
//!
//! A scripted head unit sits behind a [`ScriptedTransport`]: it keeps its own
//! obfuscation codec, decodes everything the session writes and answers the
//! way a car does during bring-up.  Tests drive the session with `poll()` on
//! the test thread unless they exercise the cross-thread handle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use phev_core::protocol::messages::{commands, registers, MessageType};
use phev_core::{decode_message, encode_message, ObfuscationCodec, PhevMessage, VinInfo, XorSeeds};
use phev_pipe::application::dispatch::{EventOutcome, HandlerContext};
use phev_pipe::application::events::{EventKind, PipeEvent};
use phev_pipe::application::handshake::HandshakeState;
use phev_pipe::application::register_updates::{RegisterAck, UpdateError};
use phev_pipe::application::transport::TransportError;
use phev_pipe::infrastructure::stages::phev_stages;
use phev_pipe::infrastructure::transport::ScriptedTransport;
use phev_pipe::{IntegrityWarning, PhevError, Session, SessionConfig, SessionSettings};

const MAC: [u8; 6] = [0x24, 0x0A, 0xC4, 0x11, 0x22, 0x33];
const VIN: &str = "JMAXDGG2WGZ002035";
const SEEDS: XorSeeds = XorSeeds {
    general: 0x5A,
    ping: 0xC3,
    command: 0x0F,
};

// ── Scripted head unit ────────────────────────────────────────────────────────

struct Vehicle {
    codec: ObfuscationCodec,
    registrations: u8,
    /// Writes to these registers are never acknowledged.
    silent_registers: Vec<u8>,
    answer_pings: bool,
    /// Every frame the session wrote, in clear.
    received: Vec<PhevMessage>,
}

impl Vehicle {
    fn new(encrypt: bool, registrations: u8) -> Self {
        Self {
            codec: ObfuscationCodec::new(encrypt, SEEDS),
            registrations,
            silent_registers: Vec::new(),
            answer_pings: true,
            received: Vec::new(),
        }
    }

    fn encode(&mut self, msg: &PhevMessage) -> Vec<u8> {
        let mut wire = encode_message(msg).unwrap();
        self.codec.encode_frame(None, &mut wire);
        wire
    }

    fn car_update(&mut self, register: u8, data: Vec<u8>) -> Vec<u8> {
        self.encode(&PhevMessage::new(commands::RESP_CMD, MessageType::Request, register, data))
    }

    fn write_ack(&mut self, register: u8) -> Vec<u8> {
        self.encode(&PhevMessage::new(commands::RESP_CMD, MessageType::Response, register, vec![0]))
    }

    fn respond(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut wire = bytes.to_vec();
        // A MAC announcement opens a fresh session on the car side too.
        if wire.len() >= 2 && wire[0] == commands::START_SEND && wire[1] == 9 {
            self.codec.reset();
        }
        self.codec.decode_frame(None, &mut wire);
        let (msg, _) = decode_message(&wire).unwrap();
        self.received.push(msg.clone());

        match (msg.command, msg.message_type, msg.register) {
            (commands::START_SEND, _, registers::CONNECT_INFO) => {
                let vin = VinInfo {
                    vin: VIN.to_string(),
                    flag: 0x01,
                    registrations: self.registrations,
                };
                vec![self.car_update(registers::VIN_INFO, vin.to_payload())]
            }
            (commands::START_SEND, _, registers::START_INFO) => vec![self.encode(&PhevMessage::new(
                commands::START_RESP,
                MessageType::Response,
                registers::START_INFO,
                vec![0],
            ))],
            (commands::PING_SEND, _, _) if !self.answer_pings => Vec::new(),
            (commands::PING_SEND, _, counter) => vec![self.encode(&PhevMessage::new(
                commands::PING_RESP,
                MessageType::Response,
                counter,
                vec![0],
            ))],
            (commands::SEND_CMD, MessageType::Request, registers::REGISTRATION_REQUEST) => {
                self.registrations += 1;
                vec![
                    self.write_ack(registers::REGISTRATION_REQUEST),
                    self.car_update(registers::REGISTRATION_COMPLETE, vec![0x01]),
                ]
            }
            (commands::SEND_CMD, MessageType::Request, register)
                if self.silent_registers.contains(&register) =>
            {
                Vec::new()
            }
            (commands::SEND_CMD, MessageType::Request, register) => vec![self.write_ack(register)],
            _ => Vec::new(),
        }
    }

    fn sent_registers(&self) -> Vec<u8> {
        self.received
            .iter()
            .filter(|m| m.command == commands::SEND_CMD && m.message_type == MessageType::Request)
            .map(|m| m.register)
            .collect()
    }
}

struct Rig {
    session: Session,
    link: ScriptedTransport,
    vehicle: Arc<Mutex<Vehicle>>,
    events: Arc<Mutex<Vec<PipeEvent>>>,
    errors: Arc<Mutex<Vec<PhevError>>>,
}

fn test_config() -> SessionConfig {
    SessionConfig {
        xor_seeds: SEEDS,
        connect_wait_time_ms: 20,
        ping_interval_ms: 60_000,
        poll_interval_ms: 1,
        ..SessionConfig::default()
    }
}

fn rig_with(config: SessionConfig, vehicle: Vehicle) -> Rig {
    let link = ScriptedTransport::new();
    let vehicle = Arc::new(Mutex::new(vehicle));
    let script = Arc::clone(&vehicle);
    link.set_responder(move |bytes| script.lock().unwrap().respond(bytes));

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let settings = SessionSettings::new(
        Box::new(link.clone()),
        phev_stages(&config.filtered_registers),
    )
    .with_config(config)
    .with_error_handler(move |err| sink.lock().unwrap().push(err.clone()));

    let mut session = Session::new(settings);
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&events);
    session
        .register_event_handler(move |_: &mut HandlerContext<'_>, event: &PipeEvent| {
            log.lock().unwrap().push(event.clone());
            EventOutcome::Continue
        })
        .unwrap();

    Rig {
        session,
        link,
        vehicle,
        events,
        errors,
    }
}

fn rig(vehicle: Vehicle) -> Rig {
    rig_with(test_config(), vehicle)
}

impl Rig {
    fn inject_car_update(&self, register: u8, data: Vec<u8>) {
        let bytes = self.vehicle.lock().unwrap().car_update(register, data);
        self.link.inject(bytes);
    }

    fn poll_until(&mut self, mut done: impl FnMut(&Session) -> bool) {
        for _ in 0..500 {
            if done(&self.session) {
                return;
            }
            self.session.poll().unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached; state {:?}", self.session.state());
    }

    fn event_kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(PipeEvent::kind).collect()
    }
}

// ── Bring-up ──────────────────────────────────────────────────────────────────

#[test]
fn test_unregistered_bring_up_reaches_operational() {
    // Arrange
    let mut rig = rig(Vehicle::new(true, 1));

    // Act
    rig.session.start(MAC);
    rig.session.wait_for_connection().unwrap();

    // Assert
    assert_eq!(
        rig.session.history(),
        &[
            HandshakeState::Disconnected,
            HandshakeState::Connecting,
            HandshakeState::AwaitingVin,
            HandshakeState::AwaitingStartAck,
            HandshakeState::Operational,
        ]
    );
    assert_eq!(
        rig.event_kinds(),
        vec![EventKind::VinAcquired, EventKind::StartAck, EventKind::Connected]
    );
    let status = rig.session.status();
    assert_eq!(status.vin.as_deref(), Some(VIN));
    assert_eq!(status.registrations, Some(1));
    assert!(rig.errors.lock().unwrap().is_empty());

    let first = rig.vehicle.lock().unwrap().received[0].clone();
    assert_eq!(first, PhevMessage::mac_announcement(MAC));
}

#[test]
fn test_registration_runs_before_start_and_notifies_once() {
    // Arrange
    let config = SessionConfig {
        register_device: true,
        ..test_config()
    };
    let link = ScriptedTransport::new();
    let vehicle = Arc::new(Mutex::new(Vehicle::new(true, 1)));
    let script = Arc::clone(&vehicle);
    link.set_responder(move |bytes| script.lock().unwrap().respond(bytes));
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    let settings = SessionSettings::new(Box::new(link), phev_stages(&[]))
        .with_config(config)
        .on_registration_complete(move |status| {
            assert_eq!(status.vin.as_deref(), Some(VIN));
            counter.fetch_add(1, Ordering::SeqCst);
        });
    let mut session = Session::new(settings);

    // Act
    session.start(MAC);
    session.wait_for_connection().unwrap();

    // Assert
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert!(session
        .history()
        .windows(2)
        .any(|w| w == [HandshakeState::Registering, HandshakeState::AwaitingRegistrationAck]));
    assert!(session.history().contains(&HandshakeState::RegistrationComplete));
    assert_eq!(
        vehicle.lock().unwrap().sent_registers(),
        vec![registers::REGISTRATION_REQUEST]
    );
}

#[test]
fn test_full_vehicle_fails_without_requesting_registration() {
    // Arrange
    let config = SessionConfig {
        register_device: true,
        max_registrations: 3,
        ..test_config()
    };
    let mut rig = rig_with(config, Vehicle::new(true, 3));

    // Act
    rig.session.start(MAC);
    let result = rig.session.wait_for_connection();

    // Assert
    assert_eq!(
        result,
        Err(PhevError::MaxRegistrationsReached { registrations: 3 })
    );
    assert_eq!(rig.session.state(), HandshakeState::Failed);
    assert!(rig.vehicle.lock().unwrap().sent_registers().is_empty());
    assert!(!rig.session.is_connected());
}

#[test]
fn test_silent_vehicle_times_out_the_handshake() {
    // Arrange
    let config = SessionConfig {
        connect_wait_time_ms: 5,
        connect_max_retries: 2,
        ..test_config()
    };
    let link = ScriptedTransport::new();
    let probe = link.clone();
    let mut session = Session::new(
        SessionSettings::new(Box::new(link), phev_stages(&[])).with_config(config),
    );

    // Act
    session.start(MAC);
    let result = session.wait_for_connection();

    // Assert
    assert_eq!(
        result,
        Err(PhevError::HandshakeTimeout {
            state: HandshakeState::AwaitingVin,
            attempts: 2,
        })
    );
    // The first announcement plus one per retry.
    assert_eq!(probe.take_written().len(), 3);
}

#[test]
fn test_refused_connection_times_out_in_connecting() {
    let config = SessionConfig {
        connect_wait_time_ms: 5,
        connect_max_retries: 3,
        ..test_config()
    };
    let link = ScriptedTransport::new();
    link.set_fail_connect(true);
    let probe = link.clone();
    let mut session = Session::new(
        SessionSettings::new(Box::new(link), phev_stages(&[])).with_config(config),
    );

    session.start(MAC);
    let result = session.wait_for_connection();

    assert_eq!(
        result,
        Err(PhevError::HandshakeTimeout {
            state: HandshakeState::Connecting,
            attempts: 3,
        })
    );
    assert_eq!(probe.connect_attempts(), 4);
}

// ── Operational traffic ───────────────────────────────────────────────────────

#[test]
fn test_first_ping_is_answered_and_recorded() {
    // Arrange
    let mut rig = rig(Vehicle::new(true, 1));
    rig.session.start(MAC);
    rig.session.wait_for_connection().unwrap();

    // Act
    rig.poll_until(|s| s.status().ping_response.is_some());

    // Assert
    let status = rig.session.status();
    assert_eq!(status.last_ping, 1);
    assert_eq!(status.ping_response, Some(1));
    assert!(rig.event_kinds().contains(&EventKind::PingResponse));
    assert!(rig.errors.lock().unwrap().is_empty());
}

#[test]
fn test_update_with_callback_completes_on_ack() {
    // Arrange
    let mut rig = rig(Vehicle::new(true, 1));
    rig.session.start(MAC);
    rig.session.wait_for_connection().unwrap();
    let (tx, rx) = mpsc::channel();

    // Act
    rig.session
        .update_complex_register_with_callback(0x0A, &[0x02, 0x01], move |result| {
            tx.send(result).unwrap();
        })
        .unwrap();
    rig.poll_until(|s| s.status().pending_updates == 0);

    // Assert
    assert_eq!(
        rx.try_recv().unwrap(),
        Ok(RegisterAck {
            register: 0x0A,
            value: vec![0x02, 0x01],
        })
    );
    assert_eq!(rig.session.register_value(0x0A), Some(&[0x02, 0x01][..]));
}

#[test]
fn test_unacknowledged_update_times_out_with_warning() {
    // Arrange
    let config = SessionConfig {
        update_ack_timeout_ms: 10,
        ..test_config()
    };
    let mut vehicle = Vehicle::new(true, 1);
    vehicle.silent_registers.push(0x0B);
    let mut rig = rig_with(config, vehicle);
    rig.session.start(MAC);
    rig.session.wait_for_connection().unwrap();
    let (tx, rx) = mpsc::channel();

    // Act
    rig.session
        .update_register_with_callback(0x0B, 1, move |result| tx.send(result).unwrap())
        .unwrap();
    rig.poll_until(|s| s.status().pending_updates == 0);

    // Assert
    assert_eq!(rx.try_recv().unwrap(), Err(UpdateError::TimedOut));
    assert!(rig
        .errors
        .lock()
        .unwrap()
        .contains(&PhevError::Integrity(IntegrityWarning::UnacknowledgedUpdate {
            register: 0x0B
        })));
}

#[test]
fn test_car_updates_are_acked_recorded_and_dispatched() {
    // Arrange
    let mut rig = rig(Vehicle::new(true, 1));
    rig.session.start(MAC);
    rig.session.wait_for_connection().unwrap();

    // Act
    rig.inject_car_update(0x1D, vec![0x04]);
    rig.poll_until(|s| s.register_value(0x1D).is_some());

    // Assert
    assert_eq!(rig.session.register_value(0x1D), Some(&[0x04][..]));
    assert!(rig
        .events
        .lock()
        .unwrap()
        .contains(&PipeEvent::RegisterUpdate {
            register: 0x1D,
            data: vec![0x04],
        }));
    let acks: Vec<u8> = rig
        .vehicle
        .lock()
        .unwrap()
        .received
        .iter()
        .filter(|m| m.command == commands::SEND_CMD && m.message_type == MessageType::Response)
        .map(|m| m.register)
        .collect();
    assert!(acks.contains(&0x1D));
}

#[test]
fn test_filtered_register_is_not_acked_and_raises_filtered_event() {
    // Arrange
    let config = SessionConfig {
        filtered_registers: vec![registers::BLACK_BOX],
        ..test_config()
    };
    let mut rig = rig_with(config, Vehicle::new(true, 1));
    rig.session.start(MAC);
    rig.session.wait_for_connection().unwrap();

    // Act
    rig.inject_car_update(registers::BLACK_BOX, vec![1, 2, 3]);
    for _ in 0..10 {
        rig.session.poll().unwrap();
    }

    // Assert
    assert!(rig.event_kinds().contains(&EventKind::FilteredMessage));
    assert!(!rig.event_kinds().contains(&EventKind::BlackBox));
    assert_eq!(rig.session.register_value(registers::BLACK_BOX), None);
    let acked_black_box = rig.vehicle.lock().unwrap().received.iter().any(|m| {
        m.command == commands::SEND_CMD
            && m.message_type == MessageType::Response
            && m.register == registers::BLACK_BOX
    });
    assert!(!acked_black_box);
}

#[test]
fn test_handler_writes_are_sent_to_the_vehicle() {
    // Arrange
    let mut rig = rig(Vehicle::new(true, 1));
    rig.session
        .register_event_handler(|ctx: &mut HandlerContext<'_>, event: &PipeEvent| {
            if let PipeEvent::RegisterUpdate { register: 0x1D, .. } = event {
                ctx.update_register(0x0A, 0x02);
                return EventOutcome::Handled;
            }
            EventOutcome::Continue
        })
        .unwrap();
    rig.session.start(MAC);
    rig.session.wait_for_connection().unwrap();

    // Act
    rig.inject_car_update(0x1D, vec![0x01]);
    rig.poll_until(|s| s.register_value(0x0A).is_some());

    // Assert
    assert_eq!(rig.vehicle.lock().unwrap().sent_registers(), vec![0x0A]);
    assert_eq!(rig.session.register_value(0x0A), Some(&[0x02][..]));
}

// ── Link loss ─────────────────────────────────────────────────────────────────

#[test]
fn test_dropped_link_reconnects_and_completes_handshake_again() {
    // Arrange
    let mut rig = rig(Vehicle::new(true, 1));
    rig.session.start(MAC);
    rig.session.wait_for_connection().unwrap();
    let (tx, rx) = mpsc::channel();
    rig.vehicle.lock().unwrap().silent_registers.push(0x0C);
    rig.session
        .update_register_with_callback(0x0C, 1, move |result| tx.send(result).unwrap())
        .unwrap();

    // Act
    rig.link.drop_connection();
    rig.session.poll().unwrap();
    rig.poll_until(Session::is_connected);

    // Assert
    assert_eq!(rig.link.connect_attempts(), 2);
    assert_eq!(rx.try_recv().unwrap(), Err(UpdateError::SessionReset));
    let history = rig.session.history();
    let operational = history
        .iter()
        .filter(|s| **s == HandshakeState::Operational)
        .count();
    assert_eq!(operational, 2);
    assert!(rig
        .errors
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, PhevError::Transport(_))));
}

#[test]
fn test_unanswered_pings_trigger_reconnect() {
    // Arrange
    let config = SessionConfig {
        ping_interval_ms: 2,
        max_missed_pings: 3,
        ..test_config()
    };
    let mut vehicle = Vehicle::new(true, 1);
    vehicle.answer_pings = false;
    let mut rig = rig_with(config, vehicle);
    rig.session.start(MAC);
    rig.session.wait_for_connection().unwrap();
    let link = rig.link.clone();

    // Act
    rig.poll_until(|_| link.connect_attempts() >= 2);

    // Assert
    assert_eq!(rig.link.connect_attempts(), 2);
    assert!(rig
        .errors
        .lock()
        .unwrap()
        .contains(&PhevError::Transport(TransportError::Timeout)));
    let pings = rig
        .vehicle
        .lock()
        .unwrap()
        .received
        .iter()
        .filter(|m| m.command == commands::PING_SEND)
        .count();
    assert!(pings >= 3, "only {pings} pings sent");
}

#[test]
fn test_stopped_session_is_no_longer_connected() {
    // Arrange
    let mut rig = rig(Vehicle::new(true, 1));
    let handle = rig.session.handle();
    rig.session.start(MAC);
    rig.session.wait_for_connection().unwrap();

    // Act
    rig.session.stop();

    // Assert
    assert!(!rig.session.is_connected());
    assert!(!rig.session.status().connected);
    assert_eq!(rig.session.state(), HandshakeState::Disconnected);
    assert!(!handle.is_connected());
    assert!(!rig.link.is_open());
    assert_eq!(rig.session.wait_for_connection(), Err(PhevError::Stopped));
}

// ── Cross-thread control ──────────────────────────────────────────────────────

#[test]
fn test_handle_controls_a_session_running_on_another_thread() {
    // Arrange
    let rig = rig(Vehicle::new(true, 1));
    let handle = rig.session.handle();
    let mut session = rig.session;
    let worker = thread::spawn(move || {
        session.start(MAC);
        session.run()
    });

    // Act
    let connected = handle.wait_for_connection(Duration::from_secs(5));
    let (tx, rx) = mpsc::channel();
    handle
        .update_register_with_callback(0x0A, 1, move |result| tx.send(result).unwrap())
        .unwrap();
    let ack = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    handle.stop().unwrap();
    let outcome = worker.join().unwrap();

    // Assert
    assert!(connected);
    assert_eq!(ack.map(|a| a.register), Ok(0x0A));
    assert_eq!(outcome, Ok(()));
    assert!(!handle.is_connected());
    assert_eq!(handle.ping(), Err(PhevError::Stopped));
}
