//! Bluetooth Module
//!
//! Peripheral transport consumed by tracker sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                TrackerSession                │
//! └──────────────────────┬───────────────────────┘
//!                        │ PeripheralTransport / PeripheralLink
//!          ┌─────────────┼──────────────┐
//!          ▼                            ▼
//! ┌─────────────────┐          ┌─────────────────┐
//! │  WinRtTransport │          │  MockTransport  │
//! │  (Windows GATT) │          │  (tests)        │
//! └─────────────────┘          └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Puck UUIDs, commands and UUID parsing
//! - `winrt` - WinRT GATT implementation (Windows only)
//! - `mock` - Scriptable transport for tests

pub mod protocol;

#[cfg(windows)]
pub mod winrt;

#[cfg(test)]
pub mod mock;

use crate::domain::models::MacAddress;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[cfg(windows)]
pub use winrt::WinRtTransport;

/// Bounded queue a link pushes raw notifications into.
pub type NotificationSender = mpsc::Sender<Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection timed out after {0} ms")]
    Timeout(u64),
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),
    #[error("Pairing failed: {0}")]
    Pairing(String),
    #[error("GATT operation failed: {0}")]
    Gatt(String),
    #[error("Link closed")]
    Closed,
}

/// Capability to open links to pucks.
#[async_trait]
pub trait PeripheralTransport: Send + Sync {
    /// Short transport name reported in the handshake firmware string.
    fn name(&self) -> &'static str;

    /// Connect to a device and resolve its telemetry/command characteristics.
    ///
    /// Callers bound this with their own timeout.
    async fn connect(&self, address: MacAddress) -> Result<Box<dyn PeripheralLink>, TransportError>;
}

/// An open connection to one puck.
#[async_trait]
pub trait PeripheralLink: Send + Sync {
    /// Raise the link's security level. Callers treat failure as non-fatal.
    async fn pair(&self) -> Result<(), TransportError>;

    /// Start telemetry notifications. Payloads are pushed with
    /// [`forward_notification`] so delivery never blocks.
    async fn subscribe(&self, notifications: NotificationSender) -> Result<(), TransportError>;

    /// Write to the device's command characteristic.
    async fn write_command(&self, command: &[u8]) -> Result<(), TransportError>;

    /// Fire `lost` once if the device drops the connection.
    fn watch_disconnect(&self, lost: oneshot::Sender<()>) -> Result<(), TransportError>;

    /// Close the connection and release its handles.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Hand a notification to the session without waiting; drops it when the
/// session's queue is full or gone.
pub fn forward_notification(notifications: &NotificationSender, payload: Vec<u8>) {
    match notifications.try_send(payload) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!("Notification queue full, dropping payload");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_notification_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(2);
        for i in 0..5u8 {
            forward_notification(&tx, vec![i]);
        }
        assert_eq!(rx.try_recv().unwrap(), vec![0]);
        assert_eq!(rx.try_recv().unwrap(), vec![1]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_forward_notification_ignores_closed_queue() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        forward_notification(&tx, vec![1, 2, 3]);
    }
}
