//! Protocol events and the mapping from decoded frames to events.
//!
//! Events are created by the session when a decoded frame matches a
//! recognised pattern, moved into the dispatcher, lent to each handler as
//! `&PipeEvent`, and dropped once dispatch finishes.

use phev_core::domain::vehicle::parse_ecu_version;
use phev_core::protocol::messages::{commands, registers, MessageType};
use phev_core::{DateInfo, PhevMessage, ProtocolError, VinInfo};

/// VIN announcement: the 17-character VIN, the flag byte that precedes it and
/// the number of devices already registered with the car.
pub type VinEvent = VinInfo;

/// Fieldless discriminant of [`PipeEvent`], handy for filtering and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    VinAcquired,
    Connected,
    StartAck,
    Registration,
    EcuVersion,
    RemoteSecurityPresent,
    RegistrationDisplay,
    MaxRegistrations,
    RegistrationComplete,
    RegisterUpdate,
    RegisterUpdateAck,
    DateInfo,
    BlackBox,
    PingResponse,
    FilteredMessage,
}

/// An event raised by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeEvent {
    VinAcquired(VinEvent),
    /// The handshake reached `Operational`.
    Connected,
    StartAck,
    Registration(Vec<u8>),
    EcuVersion(String),
    RemoteSecurityPresent(Vec<u8>),
    RegistrationDisplay(Vec<u8>),
    MaxRegistrations,
    RegistrationComplete,
    /// A car-originated update of a register with no dedicated event.
    RegisterUpdate { register: u8, data: Vec<u8> },
    /// The car acknowledged a client register write.
    RegisterUpdateAck { register: u8, data: Vec<u8> },
    DateInfo(DateInfo),
    BlackBox(Vec<u8>),
    /// Ping counter echoed by the car.
    PingResponse(u8),
    /// A frame a pipeline filter suppressed, in clear.
    FilteredMessage(Vec<u8>),
}

impl PipeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PipeEvent::VinAcquired(_) => EventKind::VinAcquired,
            PipeEvent::Connected => EventKind::Connected,
            PipeEvent::StartAck => EventKind::StartAck,
            PipeEvent::Registration(_) => EventKind::Registration,
            PipeEvent::EcuVersion(_) => EventKind::EcuVersion,
            PipeEvent::RemoteSecurityPresent(_) => EventKind::RemoteSecurityPresent,
            PipeEvent::RegistrationDisplay(_) => EventKind::RegistrationDisplay,
            PipeEvent::MaxRegistrations => EventKind::MaxRegistrations,
            PipeEvent::RegistrationComplete => EventKind::RegistrationComplete,
            PipeEvent::RegisterUpdate { .. } => EventKind::RegisterUpdate,
            PipeEvent::RegisterUpdateAck { .. } => EventKind::RegisterUpdateAck,
            PipeEvent::DateInfo(_) => EventKind::DateInfo,
            PipeEvent::BlackBox(_) => EventKind::BlackBox,
            PipeEvent::PingResponse(_) => EventKind::PingResponse,
            PipeEvent::FilteredMessage(_) => EventKind::FilteredMessage,
        }
    }
}

/// Maps one decoded inbound frame to its event.
///
/// Returns `Ok(None)` for frames that carry nothing the session reports
/// (client-direction commands echoed back, start responses for other
/// registers).  Payloads that fail to parse are returned as errors.
pub fn event_for(message: &PhevMessage) -> Result<Option<PipeEvent>, ProtocolError> {
    match message.command {
        commands::PING_RESP => Ok(Some(PipeEvent::PingResponse(message.register))),
        commands::START_RESP if message.register == registers::START_INFO => {
            Ok(Some(PipeEvent::StartAck))
        }
        commands::RESP_CMD => match message.message_type {
            MessageType::Response => Ok(Some(PipeEvent::RegisterUpdateAck {
                register: message.register,
                data: message.data.clone(),
            })),
            MessageType::Request => car_update_event(message).map(Some),
        },
        _ => Ok(None),
    }
}

fn car_update_event(message: &PhevMessage) -> Result<PipeEvent, ProtocolError> {
    let data = &message.data;
    let event = match message.register {
        registers::VIN_INFO => PipeEvent::VinAcquired(VinInfo::parse(data)?),
        registers::ECU_VERSION => PipeEvent::EcuVersion(parse_ecu_version(data)?),
        registers::DATE_INFO => PipeEvent::DateInfo(DateInfo::parse(data)?),
        registers::REMOTE_SECURITY_PRESENT => PipeEvent::RemoteSecurityPresent(data.clone()),
        registers::REGISTRATION_DISPLAY => PipeEvent::RegistrationDisplay(data.clone()),
        registers::REGISTRATION => PipeEvent::Registration(data.clone()),
        registers::REGISTRATION_COMPLETE => PipeEvent::RegistrationComplete,
        registers::MAX_REGISTRATIONS => PipeEvent::MaxRegistrations,
        registers::BLACK_BOX => PipeEvent::BlackBox(data.clone()),
        register => PipeEvent::RegisterUpdate {
            register,
            data: data.clone(),
        },
    };
    Ok(event)
}
