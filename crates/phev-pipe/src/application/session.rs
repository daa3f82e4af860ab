//! The session engine.
//!
//! A [`Session`] owns the pipeline, the handshake machine, the keepalive
//! manager, the register store and the event dispatcher, and drives them
//! from a single loop:
//!
//! ```text
//! poll()
//!  ├─ drain SessionHandle commands
//!  ├─ handshake.tick()            retries / timeouts
//!  ├─ pipeline.receive()          vehicle frames → events → handshake inputs
//!  ├─ pipeline.poll_output()      application frames → vehicle (Operational only)
//!  ├─ keepalive                   ping when due, declare loss when stale
//!  └─ registers.expire()          unacknowledged writes → warnings
//! ```
//!
//! Everything runs on the caller's thread.  Other threads talk to a running
//! session through a [`SessionHandle`]: its commands are queued on a channel
//! and executed at the start of the next `poll()`, and its
//! [`wait_for_connection`](SessionHandle::wait_for_connection) blocks on a
//! condition variable rather than polling.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use phev_core::protocol::messages::{registers, MAC_LEN};
use phev_core::{ObfuscationCodec, PhevMessage, XorCategory};
use tracing::{debug, info, info_span, trace, warn};
use uuid::Uuid;

use crate::application::dispatch::{EventDispatcher, EventHandler, HandlerId, SessionStatus};
use crate::application::events::{event_for, PipeEvent, VinEvent};
use crate::application::handshake::{HandshakeAction, HandshakeInput, HandshakeMachine, HandshakeState};
use crate::application::keepalive::KeepaliveManager;
use crate::application::pipeline::{Inbound, Message, MessagePipeline, Outbound};
use crate::application::register_updates::{RegisterAck, RegisterStore, UpdateCallback, UpdateError};
use crate::application::settings::{RegistrationCallback, SessionConfig, SessionSettings};
use crate::application::transport::TransportError;
use crate::error::{ErrorHandler, IntegrityWarning, PhevError};

// ── Cross-thread plumbing ─────────────────────────────────────────────────────

enum SessionCommand {
    Write {
        register: u8,
        data: Vec<u8>,
        callback: Option<UpdateCallback>,
    },
    Ping,
    Stop,
}

#[derive(Default)]
struct ConnectionSignal {
    connected: Mutex<bool>,
    changed: Condvar,
}

impl ConnectionSignal {
    fn set(&self, connected: bool) {
        let mut guard = self.connected.lock().unwrap_or_else(PoisonError::into_inner);
        if *guard != connected {
            *guard = connected;
            self.changed.notify_all();
        }
    }

    fn get(&self) -> bool {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.connected.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |connected| !*connected)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Thread-safe control surface of a [`Session`].
///
/// Commands are executed by the session loop at its next `poll()`.  Every
/// method fails with [`PhevError::Stopped`] once the session is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    commands: Sender<SessionCommand>,
    signal: Arc<ConnectionSignal>,
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) -> Result<(), PhevError> {
        self.commands.send(command).map_err(|_| PhevError::Stopped)
    }

    pub fn update_register(&self, register: u8, value: u8) -> Result<(), PhevError> {
        self.update_complex_register(register, &[value])
    }

    pub fn update_complex_register(&self, register: u8, data: &[u8]) -> Result<(), PhevError> {
        self.send(SessionCommand::Write {
            register,
            data: data.to_vec(),
            callback: None,
        })
    }

    pub fn update_register_with_callback<F>(
        &self,
        register: u8,
        value: u8,
        callback: F,
    ) -> Result<(), PhevError>
    where
        F: FnOnce(Result<RegisterAck, UpdateError>) + Send + 'static,
    {
        self.update_complex_register_with_callback(register, &[value], callback)
    }

    /// Queues a write with a completion callback.  If the session cannot
    /// reserve a slot when it executes the command, the failure goes to the
    /// session's error handler and `callback` is dropped uncalled.
    pub fn update_complex_register_with_callback<F>(
        &self,
        register: u8,
        data: &[u8],
        callback: F,
    ) -> Result<(), PhevError>
    where
        F: FnOnce(Result<RegisterAck, UpdateError>) + Send + 'static,
    {
        self.send(SessionCommand::Write {
            register,
            data: data.to_vec(),
            callback: Some(Box::new(callback)),
        })
    }

    pub fn ping(&self) -> Result<(), PhevError> {
        self.send(SessionCommand::Ping)
    }

    /// Asks the loop to stop.  `run()` returns after the current iteration.
    pub fn stop(&self) -> Result<(), PhevError> {
        self.send(SessionCommand::Stop)
    }

    pub fn is_connected(&self) -> bool {
        self.signal.get()
    }

    /// Blocks until the session is `Operational` or `timeout` elapses.
    /// Returns whether it is connected.
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.signal.wait(timeout)
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct Session {
    id: Uuid,
    config: SessionConfig,
    pipeline: MessagePipeline,
    handshake: HandshakeMachine,
    keepalive: KeepaliveManager,
    registers: RegisterStore,
    dispatcher: EventDispatcher,
    error_handler: ErrorHandler,
    on_registration_complete: Option<RegistrationCallback>,
    vin: Option<VinEvent>,
    running: bool,
    fatal: Option<PhevError>,
    /// Bumped on every reset so stale inbound frames are not processed.
    generation: u64,
    commands: Receiver<SessionCommand>,
    command_sender: Sender<SessionCommand>,
    signal: Arc<ConnectionSignal>,
}

impl Session {
    pub fn new(settings: SessionSettings) -> Self {
        let SessionSettings {
            input,
            output,
            stages,
            config,
            error_handler,
            on_registration_complete,
        } = settings;

        let codec = if config.encrypt {
            ObfuscationCodec::new(true, config.xor_seeds)
        } else {
            ObfuscationCodec::disabled()
        };
        let (command_sender, commands) = mpsc::channel();
        let id = Uuid::new_v4();
        info!(
            session_id = %id,
            encrypt = config.encrypt,
            register_device = config.register_device,
            "session created"
        );

        Self {
            id,
            pipeline: MessagePipeline::new(input, output, stages, codec),
            handshake: HandshakeMachine::new(
                config.register_device,
                config.max_registrations,
                config.retry_policy(),
            ),
            keepalive: KeepaliveManager::new(),
            registers: RegisterStore::new(),
            dispatcher: EventDispatcher::new(),
            error_handler,
            on_registration_complete,
            vin: None,
            running: true,
            fatal: None,
            generation: 0,
            commands,
            command_sender,
            signal: Arc::new(ConnectionSignal::default()),
            config,
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    /// Handshake states visited so far, oldest first.
    pub fn history(&self) -> &[HandshakeState] {
        self.handshake.history()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == HandshakeState::Operational
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Last known value of a register.
    pub fn register_value(&self, register: u8) -> Option<&[u8]> {
        self.registers.get(register)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id,
            state: self.state(),
            connected: self.is_connected(),
            vin: self.vin.as_ref().map(|v| v.vin.clone()),
            registrations: self.vin.as_ref().map(|v| v.registrations),
            last_ping: self.keepalive.current_ping(),
            ping_response: self.keepalive.ping_response(),
            pending_updates: self.registers.pending_count(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.command_sender.clone(),
            signal: Arc::clone(&self.signal),
        }
    }

    // ── Control ───────────────────────────────────────────────────────────────

    /// Starts the handshake: connects the vehicle transport and announces `mac`.
    pub fn start(&mut self, mac: [u8; MAC_LEN]) {
        let span = info_span!("session", id = %self.id);
        let _entered = span.enter();
        info!(mac = %format_mac(&mac), "starting session");
        self.feed(HandshakeInput::Start { mac }, Instant::now());
    }

    /// Writes the MAC announcement frame.
    pub fn send_mac(&mut self, mac: [u8; MAC_LEN]) -> Result<(), PhevError> {
        self.publish(&PhevMessage::mac_announcement(mac), Some(XorCategory::General))
    }

    /// Asks the car to register this device.
    pub fn send_register(&mut self) -> Result<(), PhevError> {
        self.update_register(registers::REGISTRATION_REQUEST, 0x01)
    }

    pub fn register_event_handler(
        &mut self,
        handler: impl EventHandler + 'static,
    ) -> Result<HandlerId, PhevError> {
        self.dispatcher.register(Box::new(handler))
    }

    pub fn deregister_event_handler(&mut self, id: HandlerId) -> bool {
        self.dispatcher.deregister(id)
    }

    /// Fire-and-forget single-byte register write.
    pub fn update_register(&mut self, register: u8, value: u8) -> Result<(), PhevError> {
        self.update_complex_register(register, &[value])
    }

    /// Fire-and-forget multi-byte register write.
    pub fn update_complex_register(&mut self, register: u8, data: &[u8]) -> Result<(), PhevError> {
        let frame = Message::encode(&PhevMessage::register_write(register, data.to_vec()))?;
        debug!(register, len = data.len(), "register write");
        self.registers.note_write(register, data.to_vec(), Instant::now());
        self.publish_frame(frame, Some(XorCategory::Command))
    }

    /// Single-byte write whose `callback` runs exactly once: on the car's
    /// ack, or with an [`UpdateError`] if the write is superseded, times out,
    /// is blocked by the output filter, or the session resets first.
    ///
    /// # Errors
    ///
    /// [`PhevError::CapacityExceeded`] when 10 writes are already pending, or
    /// the transport error if the frame could not be written.  No slot is
    /// kept and `callback` is dropped without being called.
    pub fn update_register_with_callback<F>(
        &mut self,
        register: u8,
        value: u8,
        callback: F,
    ) -> Result<(), PhevError>
    where
        F: FnOnce(Result<RegisterAck, UpdateError>) + Send + 'static,
    {
        self.write_with_callback(register, vec![value], Box::new(callback))
    }

    pub fn update_complex_register_with_callback<F>(
        &mut self,
        register: u8,
        data: &[u8],
        callback: F,
    ) -> Result<(), PhevError>
    where
        F: FnOnce(Result<RegisterAck, UpdateError>) + Send + 'static,
    {
        self.write_with_callback(register, data.to_vec(), Box::new(callback))
    }

    fn write_with_callback(
        &mut self,
        register: u8,
        data: Vec<u8>,
        callback: UpdateCallback,
    ) -> Result<(), PhevError> {
        let frame = Message::encode(&PhevMessage::register_write(register, data.clone()))?;
        self.registers
            .reserve(register, data, callback, Instant::now())?;
        debug!(register, pending = self.registers.pending_count(), "register write awaiting ack");

        match self.deliver(frame, Some(XorCategory::Command)) {
            Ok(true) => Ok(()),
            Ok(false) => {
                if let Some(callback) = self.registers.withdraw(register) {
                    callback(Err(UpdateError::NotSent));
                }
                Ok(())
            }
            Err(err) => {
                self.registers.withdraw(register);
                Err(err)
            }
        }
    }

    /// Sends the next keepalive ping.
    pub fn ping(&mut self) -> Result<(), PhevError> {
        let ping = self.keepalive.ping(Instant::now());
        self.publish(&ping, Some(XorCategory::Ping))
    }

    pub fn reset_ping(&mut self) {
        self.keepalive.reset_ping();
    }

    /// Closes the vehicle link.  A started session treats this as transport
    /// loss and reconnects on the next `poll()`; use [`stop`](Self::stop) to
    /// end it.
    pub fn disconnect_input(&mut self) {
        self.pipeline.disconnect_input();
    }

    pub fn disconnect_output(&mut self) {
        self.pipeline.disconnect_output();
    }

    /// Ends the session: returns the handshake to `Disconnected`, closes both
    /// links and abandons pending writes.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        info!(session_id = %self.id, "stopping session");
        self.running = false;
        self.signal.set(false);
        self.handshake.handle(HandshakeInput::Stop, Instant::now());
        self.pipeline.disconnect_input();
        self.pipeline.disconnect_output();
        self.registers.abandon_all();
    }

    // ── Loop ──────────────────────────────────────────────────────────────────

    /// Runs the loop until [`stop`](Self::stop) or a fatal error.
    pub fn run(&mut self) -> Result<(), PhevError> {
        info!(session_id = %self.id, "session loop started");
        while self.running {
            self.poll()?;
            thread::sleep(self.config.poll_interval());
        }
        info!(session_id = %self.id, "session loop stopped");
        Ok(())
    }

    /// Drives the loop on this thread until the session is `Operational`.
    ///
    /// Bounded by the handshake retry budget.
    ///
    /// # Errors
    ///
    /// The fatal error that ended the handshake, [`PhevError::NotStarted`] if
    /// [`start`](Self::start) was never called, or [`PhevError::Stopped`].
    pub fn wait_for_connection(&mut self) -> Result<(), PhevError> {
        loop {
            if !self.running {
                return Err(PhevError::Stopped);
            }
            if self.is_connected() {
                return Ok(());
            }
            if self.state() == HandshakeState::Disconnected && self.handshake.mac().is_none() {
                return Err(PhevError::NotStarted);
            }
            self.poll()?;
            if !self.running {
                return Err(PhevError::Stopped);
            }
            if self.is_connected() {
                return Ok(());
            }
            thread::sleep(self.config.poll_interval());
        }
    }

    /// One loop iteration.
    ///
    /// # Errors
    ///
    /// Returns the fatal error once the handshake has failed.
    pub fn poll(&mut self) -> Result<(), PhevError> {
        let span = info_span!("session", id = %self.id);
        let _entered = span.enter();
        let now = Instant::now();

        self.drain_commands();
        if !self.running {
            return Ok(());
        }

        let retries = self.handshake.tick(now);
        self.apply(retries, now);

        if self.handshake_active() {
            if self.pipeline.input_connected() {
                self.receive(now);
            } else if self.state() != HandshakeState::Connecting {
                self.report(TransportError::NotConnected.into());
                self.feed(HandshakeInput::TransportLost, now);
            }
        }

        if self.is_connected() {
            self.relay_application_frames();
            self.keepalive_step(now);
        }

        for register in self.registers.expire(now, self.config.update_ack_timeout()) {
            self.report(IntegrityWarning::UnacknowledgedUpdate { register }.into());
        }

        match &self.fatal {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn handshake_active(&self) -> bool {
        !matches!(
            self.state(),
            HandshakeState::Disconnected | HandshakeState::Failed
        )
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            let result = match command {
                SessionCommand::Write {
                    register,
                    data,
                    callback: None,
                } => self.update_complex_register(register, &data),
                SessionCommand::Write {
                    register,
                    data,
                    callback: Some(callback),
                } => self.write_with_callback(register, data, callback),
                SessionCommand::Ping => self.ping(),
                SessionCommand::Stop => {
                    self.stop();
                    Ok(())
                }
            };
            if let Err(err) = result {
                self.report(err);
            }
        }
    }

    fn receive(&mut self, now: Instant) {
        let items = match self.pipeline.receive() {
            Ok(items) => items,
            Err(err @ PhevError::Transport(_)) => {
                self.report(err);
                self.feed(HandshakeInput::TransportLost, now);
                return;
            }
            Err(err) => {
                self.report(err);
                return;
            }
        };

        let generation = self.generation;
        for item in items {
            match item {
                Inbound::Message { frame, message } => {
                    self.on_message(&message, now);
                    self.forward(frame);
                }
                Inbound::Filtered(frame) => {
                    self.send_event_to_handlers(PipeEvent::FilteredMessage(frame.data))
                }
                Inbound::Malformed(err) => self.report(err.into()),
            }
            if self.generation != generation || !self.running {
                break;
            }
        }
    }

    fn on_message(&mut self, message: &PhevMessage, now: Instant) {
        trace!(
            command = message.command,
            register = message.register,
            len = message.data.len(),
            "message received"
        );

        if message.is_car_update() {
            self.registers.record(message.register, message.data.clone());
        }
        if message.is_write_ack() {
            if let Err(warning) = self.registers.on_ack(message.register) {
                self.report(warning.into());
            }
        }

        let event = match event_for(message) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(err) => {
                self.report(err.into());
                return;
            }
        };

        let input = match &event {
            PipeEvent::VinAcquired(vin) => {
                info!(vin = %vin.vin, registrations = vin.registrations, "VIN received");
                self.vin = Some(vin.clone());
                Some(HandshakeInput::Vin(vin.clone()))
            }
            PipeEvent::PingResponse(echoed) => {
                if let Err(warning) = self.keepalive.on_ping_response(*echoed) {
                    self.report(warning.into());
                }
                None
            }
            PipeEvent::StartAck => Some(HandshakeInput::StartAck),
            PipeEvent::RegistrationComplete => Some(HandshakeInput::RegistrationComplete),
            PipeEvent::MaxRegistrations => Some(HandshakeInput::MaxRegistrations),
            PipeEvent::RegisterUpdateAck { register, .. } => {
                Some(HandshakeInput::RegisterAck(*register))
            }
            _ => None,
        };

        self.send_event_to_handlers(event);
        if let Some(input) = input {
            self.feed(input, now);
        }
    }

    fn feed(&mut self, input: HandshakeInput, now: Instant) {
        let actions = self.handshake.handle(input, now);
        self.apply(actions, now);
    }

    fn apply(&mut self, actions: Vec<HandshakeAction>, now: Instant) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            let follow_up = match action {
                HandshakeAction::Connect => match self.pipeline.connect_input() {
                    Ok(()) => {
                        info!("vehicle transport connected");
                        self.connect_output();
                        Some(HandshakeInput::TransportReady)
                    }
                    Err(err) => {
                        self.report(err);
                        None
                    }
                },
                HandshakeAction::SendMac(mac) => match self.send_mac(mac) {
                    Ok(()) => Some(HandshakeInput::MacAccepted),
                    Err(err) => self.on_send_error(err),
                },
                HandshakeAction::SendRegistration => match self.send_register() {
                    Ok(()) => None,
                    Err(err) => self.on_send_error(err),
                },
                HandshakeAction::SendStart => {
                    match self.publish(&PhevMessage::start_request(), Some(XorCategory::General)) {
                        Ok(()) => None,
                        Err(err) => self.on_send_error(err),
                    }
                }
                HandshakeAction::NotifyRegistrationComplete => {
                    info!("device registration complete");
                    if let Some(callback) = self.on_registration_complete.take() {
                        let status = self.status();
                        callback(&status);
                    }
                    None
                }
                HandshakeAction::MarkConnected => {
                    info!("session operational");
                    self.keepalive.reset_ping();
                    self.signal.set(true);
                    self.send_event_to_handlers(PipeEvent::Connected);
                    None
                }
                HandshakeAction::Report(err) => {
                    self.report(err);
                    None
                }
                HandshakeAction::ResetSession => {
                    self.reset_session();
                    None
                }
            };
            if let Some(input) = follow_up {
                queue.extend(self.handshake.handle(input, now));
            }
        }
    }

    /// Reports a failed handshake write.  A transport failure closes the
    /// link; the next `poll()` notices and reconnects.
    fn on_send_error(&mut self, err: PhevError) -> Option<HandshakeInput> {
        if matches!(err, PhevError::Transport(_)) {
            self.pipeline.disconnect_input();
        }
        self.report(err);
        None
    }

    fn reset_session(&mut self) {
        debug!("resetting session state");
        self.generation += 1;
        self.signal.set(false);
        self.pipeline.disconnect_input();
        self.pipeline.reset();
        self.keepalive.reset_ping();
        self.registers.abandon_all();
    }

    fn connect_output(&mut self) {
        if !self.pipeline.has_output() {
            return;
        }
        if let Err(err) = self.pipeline.connect_output() {
            self.report(err);
        }
    }

    fn keepalive_step(&mut self, now: Instant) {
        if self.keepalive.is_stale(self.config.max_missed_pings) {
            warn!(missed = self.keepalive.unanswered(), "vehicle stopped answering pings");
            self.report(TransportError::Timeout.into());
            self.feed(HandshakeInput::TransportLost, now);
            return;
        }
        if self.keepalive.is_due(now, self.config.ping_interval()) {
            if let Err(err) = self.ping() {
                self.on_send_error(err);
            }
        }
    }

    fn relay_application_frames(&mut self) {
        match self.pipeline.poll_output() {
            Ok(results) => {
                for result in results {
                    if let Outbound::Filtered(frame) = result {
                        self.send_event_to_handlers(PipeEvent::FilteredMessage(frame.data));
                    }
                }
            }
            Err(err @ PhevError::Pipeline(_)) => {
                self.report(err);
                self.pipeline.disconnect_output();
            }
            Err(err) => {
                self.on_send_error(err);
            }
        }
    }

    fn forward(&mut self, frame: Message) {
        if let Err(err) = self.pipeline.forward_to_output(frame) {
            self.report(err);
            self.pipeline.disconnect_output();
        }
    }

    fn publish(&mut self, message: &PhevMessage, category: Option<XorCategory>) -> Result<(), PhevError> {
        let frame = Message::encode(message)?;
        self.publish_frame(frame, category)
    }

    fn publish_frame(&mut self, frame: Message, category: Option<XorCategory>) -> Result<(), PhevError> {
        self.deliver(frame, category).map(|_| ())
    }

    /// Returns whether the frame reached the vehicle transport.
    fn deliver(&mut self, frame: Message, category: Option<XorCategory>) -> Result<bool, PhevError> {
        match self.pipeline.send_frame(frame, category)? {
            Outbound::Sent => Ok(true),
            Outbound::Filtered(frame) => {
                self.send_event_to_handlers(PipeEvent::FilteredMessage(frame.data));
                Ok(false)
            }
            Outbound::Dropped => {
                debug!("outbound frame dropped by transformer");
                Ok(false)
            }
        }
    }

    /// Runs the registered handlers over `event`, then sends the register
    /// writes they queued.  Failed writes go to the error handler.
    pub fn send_event_to_handlers(&mut self, event: PipeEvent) {
        let status = self.status();
        let report = self.dispatcher.dispatch(event, &status);
        for write in report.writes {
            if let Err(err) = self.update_complex_register(write.register, &write.data) {
                self.report(err);
            }
        }
    }

    fn report(&mut self, err: PhevError) {
        if err.is_fatal() && self.fatal.is_none() {
            self.fatal = Some(err.clone());
            self.signal.set(false);
        }
        (self.error_handler)(&err);
    }
}

fn format_mac(mac: &[u8; MAC_LEN]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
