//! Puck telemetry decoding
//!
//! # Notification Layout (>= 30 bytes, little-endian)
//!
//! ```text
//! [0-7]   : Header / timestamp (ignored)
//! [8-9]   : Quaternion W (i16, scaled by 1/8192)
//! [10-11] : Quaternion X
//! [12-13] : Quaternion Y
//! [14-15] : Quaternion Z
//! [16-23] : Reserved
//! [24-25] : Accel X (IEEE-754 binary16)
//! [26-27] : Accel Y
//! [28-29] : Accel Z
//! ```
//!
//! The puck reports orientation in its own frame. Before it is handed to the
//! packet encoder the Y axis is mirrored, the result is turned +90 degrees
//! about X and the Y/Z components are swapped.

use crate::domain::quaternion::rotate_quaternion;
use glam::{Quat, Vec3};
use half::f16;
use thiserror::Error;

/// Shortest notification that carries both orientation and acceleration.
pub const MIN_PAYLOAD_LEN: usize = 30;

const QUAT_OFFSET: usize = 8;
const ACCEL_OFFSET: usize = 24;

/// Fixed-point scale of the quaternion components.
const QUAT_SCALE: f32 = 8192.0;

/// Frame correction applied after the Y mirror.
const FRAME_ROTATION_AXIS: Vec3 = Vec3::X;
const FRAME_ROTATION_DEGREES: f32 = 90.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("Insufficient data: {len} bytes (need {MIN_PAYLOAD_LEN})")]
    InsufficientData { len: usize },
}

/// One decoded notification, already in the server's axis convention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    pub orientation: Quat,
    pub acceleration: Vec3,
}

/// Decode a raw notification payload.
pub fn decode(payload: &[u8]) -> Result<TelemetrySample, TelemetryError> {
    if payload.len() < MIN_PAYLOAD_LEN {
        return Err(TelemetryError::InsufficientData { len: payload.len() });
    }

    let component = |index: usize| -> f32 {
        let offset = QUAT_OFFSET + index * 2;
        i16::from_le_bytes([payload[offset], payload[offset + 1]]) as f32 / QUAT_SCALE
    };
    let (w, x, y, z) = (component(0), component(1), component(2), component(3));

    let mirrored = Quat::from_xyzw(x, -y, z, w);
    let rotated = rotate_quaternion(mirrored, FRAME_ROTATION_AXIS, FRAME_ROTATION_DEGREES);
    let orientation = Quat::from_xyzw(rotated.x, rotated.z, rotated.y, rotated.w);

    let accel = |index: usize| -> f32 {
        let offset = ACCEL_OFFSET + index * 2;
        f16::from_le_bytes([payload[offset], payload[offset + 1]]).to_f32()
    };
    let acceleration = Vec3::new(accel(0), accel(1), accel(2));

    Ok(TelemetrySample {
        orientation,
        acceleration,
    })
}
