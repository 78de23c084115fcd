//! Tracker server wire format
//!
//! Every datagram starts with a 4-byte packet type and the 8-byte sequence
//! counter, both big-endian, followed by a type-specific payload:
//!
//! ```text
//! Handshake (3):     board u32, imu u32, mcu u32, imu info 3*u32,
//!                    build u32, fw string (u8 len + UTF-8), mac [u8; 6], 0xFF
//! SensorInfo (15):   sensor id u8, status u8, sensor type u8
//! Rotation (17):     sensor id u8, data type u8, -x f32, z f32, y f32, w f32,
//!                    calibration u8
//! Acceleration (4):  ax f32, ay f32, az f32, sensor id u8
//! ```

use crate::domain::models::{MacAddress, SensorId};
use glam::{Quat, Vec3};

pub const PACKET_HANDSHAKE: u32 = 3;
pub const PACKET_ACCEL: u32 = 4;
pub const PACKET_SENSOR_INFO: u32 = 15;
pub const PACKET_ROTATION_DATA: u32 = 17;

/// Header length shared by every packet (type + counter).
pub const HEADER_LEN: usize = 12;

const BOARD_TYPE: u32 = 15;
const IMU_TYPE: u32 = 8;
const MCU_TYPE: u32 = 7;
const IMU_INFO: [u32; 3] = [0, 0, 0];
const HANDSHAKE_PADDING: u8 = 255;

const SENSOR_STATUS_OK: u8 = 0;
/// Emulated IMU chip reported for every puck.
const SENSOR_TYPE: u8 = 8;
/// Rotation data type "unknown/generic".
const ROTATION_DATA_TYPE: u8 = 1;
const CALIBRATION_INFO: u8 = 0;

/// Firmware identity sent in the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub bridge_name: String,
    pub transport_name: String,
    pub version: String,
}

impl FirmwareInfo {
    /// `"<bridge>/<transport> - Puck Version:<version>"`
    pub fn description(&self) -> String {
        format!(
            "{}/{} - Puck Version:{}",
            self.bridge_name, self.transport_name, self.version
        )
    }

    /// Digits of the version string concatenated, e.g. "1.0.0" -> 100.
    pub fn build_number(&self) -> u32 {
        self.version
            .chars()
            .filter_map(|c| c.to_digit(10))
            .fold(0u32, |acc, digit| acc.saturating_mul(10).saturating_add(digit))
    }
}

/// Outbound packet kinds.
#[derive(Debug, Clone, Copy)]
pub enum Packet<'a> {
    Handshake {
        mac: &'a MacAddress,
        firmware: &'a FirmwareInfo,
    },
    SensorInfo {
        sensor_id: SensorId,
    },
    Rotation {
        sensor_id: SensorId,
        orientation: Quat,
    },
    Acceleration {
        sensor_id: SensorId,
        acceleration: Vec3,
    },
}

impl Packet<'_> {
    pub fn packet_type(&self) -> u32 {
        match self {
            Self::Handshake { .. } => PACKET_HANDSHAKE,
            Self::SensorInfo { .. } => PACKET_SENSOR_INFO,
            Self::Rotation { .. } => PACKET_ROTATION_DATA,
            Self::Acceleration { .. } => PACKET_ACCEL,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::SensorInfo { .. } => "sensor info",
            Self::Rotation { .. } => "rotation",
            Self::Acceleration { .. } => "acceleration",
        }
    }

    /// Serialize with the given sequence counter.
    pub fn encode(&self, counter: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.packet_type().to_be_bytes());
        buf.extend_from_slice(&counter.to_be_bytes());

        match self {
            Self::Handshake { mac, firmware } => {
                for value in [BOARD_TYPE, IMU_TYPE, MCU_TYPE] {
                    buf.extend_from_slice(&value.to_be_bytes());
                }
                for value in IMU_INFO {
                    buf.extend_from_slice(&value.to_be_bytes());
                }
                buf.extend_from_slice(&firmware.build_number().to_be_bytes());

                let description = firmware.description();
                let fw = truncate_utf8(&description, u8::MAX as usize);
                buf.push(fw.len() as u8);
                buf.extend_from_slice(fw.as_bytes());

                buf.extend_from_slice(&mac.octets());
                buf.push(HANDSHAKE_PADDING);
            }
            Self::SensorInfo { sensor_id } => {
                buf.extend_from_slice(&[*sensor_id, SENSOR_STATUS_OK, SENSOR_TYPE]);
            }
            Self::Rotation {
                sensor_id,
                orientation: q,
            } => {
                buf.push(*sensor_id);
                buf.push(ROTATION_DATA_TYPE);
                // Server axis convention
                for value in [-q.x, q.z, q.y, q.w] {
                    buf.extend_from_slice(&value.to_be_bytes());
                }
                buf.push(CALIBRATION_INFO);
            }
            Self::Acceleration {
                sensor_id,
                acceleration: a,
            } => {
                for value in [a.x, a.y, a.z] {
                    buf.extend_from_slice(&value.to_be_bytes());
                }
                buf.push(*sensor_id);
            }
        }

        buf
    }
}

fn truncate_utf8(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
