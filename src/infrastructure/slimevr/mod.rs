//! Tracker server output
//!
//! - [`packets`] - Wire format of the four packet kinds the bridge emits
//! - [`sender`] - Per-tracker UDP socket and sequence counter

pub mod packets;
pub mod sender;

pub use packets::{FirmwareInfo, Packet};
pub use sender::PacketSender;
