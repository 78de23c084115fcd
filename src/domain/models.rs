use glam::Quat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of tracker slots the receiving server accepts from this bridge.
pub const MAX_TRACKERS: usize = 6;

/// Sensor slot (0-5). Maps 1:1 to a UDP socket and to the server's sensor id.
pub type SensorId = u8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MacAddressError {
    #[error("MAC address must have 6 colon-separated octets: {0:?}")]
    InvalidLength(String),
    #[error("Invalid hex octet {octet:?} in MAC address {address:?}")]
    InvalidOctet { address: String, octet: String },
}

/// 6-byte Bluetooth device address (`XX:XX:XX:XX:XX:XX`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// 48-bit address as used by native Bluetooth APIs.
    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
    }
}

impl FromStr for MacAddress {
    type Err = MacAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split(':').collect();
        if parts.len() != 6 {
            return Err(MacAddressError::InvalidLength(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(MacAddressError::InvalidOctet {
                    address: s.to_string(),
                    octet: part.to_string(),
                });
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| MacAddressError::InvalidOctet {
                address: s.to_string(),
                octet: part.to_string(),
            })?;
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = MacAddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(value: MacAddress) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Identity of one physical puck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracker {
    pub sensor_id: SensorId,
    pub address: MacAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
        };
        f.write_str(label)
    }
}

/// Events published to whatever observer drives the bridge (CLI, UI).
#[derive(Debug, Clone)]
pub enum AppEvent {
    TrackerStatus {
        sensor_id: SensorId,
        status: ConnectionStatus,
    },
    TrackerData {
        sensor_id: SensorId,
        orientation: Quat,
    },
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac_address() {
        let mac: MacAddress = "3c:38:F4:b4:95:01".parse().unwrap();
        assert_eq!(mac.octets(), [0x3C, 0x38, 0xF4, 0xB4, 0x95, 0x01]);
        assert_eq!(mac.to_string(), "3C:38:F4:B4:95:01");
        assert_eq!(mac.to_u64(), 0x3C38_F4B4_9501);
    }

    #[test]
    fn test_reject_malformed_mac_address() {
        assert!(matches!(
            "3C:38:F4:B4:95".parse::<MacAddress>(),
            Err(MacAddressError::InvalidLength(_))
        ));
        assert!(matches!(
            "3C:38:F4:B4:95:ZZ".parse::<MacAddress>(),
            Err(MacAddressError::InvalidOctet { .. })
        ));
        assert!("3C:38:F4:B4:95:001".parse::<MacAddress>().is_err());
        assert!(matches!(
            "3C:38:F4:B4:95:+1".parse::<MacAddress>(),
            Err(MacAddressError::InvalidOctet { .. })
        ));
    }

    #[test]
    fn test_mac_address_serde_as_string() {
        let mac = MacAddress::new([0x3C, 0x38, 0xF4, 0xB4, 0x95, 0x06]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"3C:38:F4:B4:95:06\"");
        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }
}
