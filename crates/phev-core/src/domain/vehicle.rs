//! Typed views of the payloads the head unit sends during bring-up.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::codec::ProtocolError;

/// Number of characters in a vehicle identification number.
pub const VIN_LEN: usize = 17;

/// ECU version payload size.
pub const ECU_VERSION_LEN: usize = 11;

/// Date-info payload size (`yy mm dd hh mi ss`).
pub const DATE_INFO_LEN: usize = 6;

/// Contents of the VIN register: `[flag][VIN:17][registrations]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VinInfo {
    pub vin: String,
    /// Status byte the head unit sends ahead of the VIN.
    pub flag: u8,
    /// Number of devices already registered with this vehicle.
    pub registrations: u8,
}

impl VinInfo {
    /// Parses a VIN register payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] if the payload is short or
    /// the VIN is not printable ASCII.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let needed = 1 + VIN_LEN + 1;
        if data.len() < needed {
            return Err(ProtocolError::MalformedPayload(format!(
                "VIN payload needs {needed} bytes, got {}",
                data.len()
            )));
        }
        let raw = &data[1..=VIN_LEN];
        if !raw.iter().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ProtocolError::MalformedPayload(
                "VIN contains non-alphanumeric bytes".to_string(),
            ));
        }
        Ok(Self {
            vin: String::from_utf8_lossy(raw).into_owned(),
            flag: data[0],
            registrations: data[VIN_LEN + 1],
        })
    }

    /// Encodes back into the register payload layout.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VIN_LEN + 2);
        out.push(self.flag);
        out.extend_from_slice(self.vin.as_bytes());
        out.push(self.registrations);
        out
    }
}

/// Head-unit clock as reported by the date-info register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateInfo {
    /// Years since 2000.
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateInfo {
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] when fewer than six bytes
    /// are present.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < DATE_INFO_LEN {
            return Err(ProtocolError::MalformedPayload(format!(
                "date info needs {DATE_INFO_LEN} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            year: data[0],
            month: data[1],
            day: data[2],
            hour: data[3],
            minute: data[4],
            second: data[5],
        })
    }
}

impl fmt::Display for DateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "20{:02}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Extracts the ECU firmware version string, trimming NUL padding.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] when the payload is shorter
/// than [`ECU_VERSION_LEN`].
pub fn parse_ecu_version(data: &[u8]) -> Result<String, ProtocolError> {
    if data.len() < ECU_VERSION_LEN {
        return Err(ProtocolError::MalformedPayload(format!(
            "ECU version needs {ECU_VERSION_LEN} bytes, got {}",
            data.len()
        )));
    }
    let raw = &data[..ECU_VERSION_LEN];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}
