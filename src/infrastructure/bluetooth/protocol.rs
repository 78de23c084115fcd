//! Puck BLE Protocol
//!
//! GATT identifiers and commands of the motion-capture pucks.

use crate::domain::settings::ConnectionSettings;
use crate::infrastructure::bluetooth::TransportError;

/// Telemetry notification characteristic (orientation + acceleration).
pub const DATA_CHAR_UUID: &str = "25047e64-657c-4856-afcf-e315048a965b";

/// Command characteristic.
pub const COMMAND_CHAR_UUID: &str = "0000ff01-0000-1000-8000-00805f9b34fb";

/// Starts the telemetry stream once notifications are enabled.
pub const STREAM_START_COMMAND: [u8; 7] = [0x7e, 0x03, 0x18, 0xd6, 0x01, 0x00, 0x00];

/// Characteristics a transport resolves on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattConfig {
    pub data_char_uuid: String,
    pub command_char_uuid: String,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            data_char_uuid: DATA_CHAR_UUID.to_string(),
            command_char_uuid: COMMAND_CHAR_UUID.to_string(),
        }
    }
}

impl From<&ConnectionSettings> for GattConfig {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            data_char_uuid: settings.data_char_uuid.clone(),
            command_char_uuid: settings.command_char_uuid.clone(),
        }
    }
}

/// UUID split into its GUID fields (data1, data2, data3, data4).
pub type UuidFields = (u32, u16, u16, [u8; 8]);

/// Parse a hyphenated UUID string into its GUID fields.
pub fn parse_uuid(uuid_str: &str) -> Result<UuidFields, TransportError> {
    let invalid = || TransportError::InvalidUuid(uuid_str.to_string());
    let hex = uuid_str.replace('-', "");

    if hex.len() != 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    let d1 = u32::from_str_radix(&hex[0..8], 16).map_err(|_| invalid())?;
    let d2 = u16::from_str_radix(&hex[8..12], 16).map_err(|_| invalid())?;
    let d3 = u16::from_str_radix(&hex[12..16], 16).map_err(|_| invalid())?;

    let mut d4 = [0u8; 8];
    for (i, byte) in d4.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[16 + i * 2..18 + i * 2], 16).map_err(|_| invalid())?;
    }

    Ok((d1, d2, d3, d4))
}
