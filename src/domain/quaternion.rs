//! Quaternion helpers for remapping puck orientation into the server's frame.

use glam::{Quat, Vec3};

/// Compose `quat` with a rotation of `angle_degrees` about `axis`.
///
/// The result is the Hamilton product `quat * r`, where `r` is built from the
/// half-angle sine/cosine. `axis` is expected to be a unit vector.
pub fn rotate_quaternion(quat: Quat, axis: Vec3, angle_degrees: f32) -> Quat {
    let rotation = Quat::from_axis_angle(axis, angle_degrees.to_radians());
    quat * rotation
}
