//! Vehicle-side domain types.
//!
//! Pure data parsed out of register payloads: the VIN announcement, the
//! head-unit clock and the ECU firmware version.  Nothing here touches a
//! transport or the session state.

pub mod vehicle;

pub use vehicle::{parse_ecu_version, DateInfo, VinInfo, DATE_INFO_LEN, ECU_VERSION_LEN, VIN_LEN};
