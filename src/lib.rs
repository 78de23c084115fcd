//! Bridge between BLE motion-capture pucks and a full-body-tracking server.
//!
//! Each puck is impersonated as one network tracker with its own UDP socket:
//! orientation and acceleration notifications are decoded, converted into the
//! server's axis convention and forwarded as rotation and acceleration packets.

pub mod bridge;
pub mod domain;
pub mod infrastructure;
