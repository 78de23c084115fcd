//! WinRT GATT Transport
//!
//! Connects to pucks through `Windows.Devices.Bluetooth`.

use crate::domain::models::MacAddress;
use crate::infrastructure::bluetooth::protocol::{self, GattConfig};
use crate::infrastructure::bluetooth::{
    forward_notification, NotificationSender, PeripheralLink, PeripheralTransport, TransportError,
};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Devices::Enumeration::{DevicePairingProtectionLevel, DevicePairingResultStatus};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

impl From<windows::core::Error> for TransportError {
    fn from(e: windows::core::Error) -> Self {
        TransportError::Gatt(e.to_string())
    }
}

fn to_guid(uuid_str: &str) -> Result<GUID, TransportError> {
    let (data1, data2, data3, data4) = protocol::parse_uuid(uuid_str)?;
    Ok(GUID {
        data1,
        data2,
        data3,
        data4,
    })
}

/// Transport backed by the Windows Bluetooth LE stack.
pub struct WinRtTransport {
    data_uuid: GUID,
    command_uuid: GUID,
}

impl WinRtTransport {
    pub fn new(config: &GattConfig) -> Result<Self, TransportError> {
        Ok(Self {
            data_uuid: to_guid(&config.data_char_uuid)?,
            command_uuid: to_guid(&config.command_char_uuid)?,
        })
    }
}

#[async_trait]
impl PeripheralTransport for WinRtTransport {
    fn name(&self) -> &'static str {
        "winrt"
    }

    async fn connect(&self, address: MacAddress) -> Result<Box<dyn PeripheralLink>, TransportError> {
        info!("Connecting to Bluetooth device: {}", address);

        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address.to_u64())?
            .await
            .map_err(|_| TransportError::DeviceNotFound(address.to_string()))?;

        // Service discovery is what actually brings the link up on WinRT.
        let data_char = find_characteristic(&device, self.data_uuid).await?;
        let command_char = find_characteristic(&device, self.command_uuid).await?;
        info!("Found telemetry and command characteristics on {}", address);

        Ok(Box::new(WinRtLink {
            device,
            data_char,
            command_char,
            value_changed_token: Mutex::new(None),
            status_token: Mutex::new(None),
        }))
    }
}

async fn find_characteristic(
    device: &BluetoothLEDevice,
    uuid: GUID,
) -> Result<GattCharacteristic, TransportError> {
    let services_result = device.GetGattServicesAsync()?.await?;
    let status = services_result.Status()?;
    if status != GattCommunicationStatus::Success {
        return Err(TransportError::Gatt(format!(
            "Failed to get GATT services: {:?}",
            status
        )));
    }

    let services = services_result.Services()?;
    for i in 0..services.Size()? {
        let service = services.GetAt(i)?;
        let chars_result = service.GetCharacteristicsForUuidAsync(uuid)?.await?;
        if chars_result.Status()? != GattCommunicationStatus::Success {
            continue;
        }
        let characteristics = chars_result.Characteristics()?;
        if characteristics.Size()? > 0 {
            return Ok(characteristics.GetAt(0)?);
        }
    }

    Err(TransportError::CharacteristicNotFound(format!("{:?}", uuid)))
}

struct WinRtLink {
    device: BluetoothLEDevice,
    data_char: GattCharacteristic,
    command_char: GattCharacteristic,
    value_changed_token: Mutex<Option<i64>>,
    status_token: Mutex<Option<i64>>,
}

fn store_token(slot: &Mutex<Option<i64>>, token: i64) {
    if let Ok(mut guard) = slot.lock() {
        *guard = Some(token);
    }
}

fn take_token(slot: &Mutex<Option<i64>>) -> Option<i64> {
    slot.lock().ok().and_then(|mut guard| guard.take())
}

#[async_trait]
impl PeripheralLink for WinRtLink {
    async fn pair(&self) -> Result<(), TransportError> {
        let pairing = self.device.DeviceInformation()?.Pairing()?;
        if pairing.IsPaired()? {
            debug!("Device already paired");
            return Ok(());
        }

        let operation =
            pairing.PairWithProtectionLevelAsync(DevicePairingProtectionLevel::Encryption)?;
        let status = operation.await?.Status()?;
        if status == DevicePairingResultStatus::Paired
            || status == DevicePairingResultStatus::AlreadyPaired
        {
            info!("Pairing completed");
            Ok(())
        } else {
            Err(TransportError::Pairing(format!("{:?}", status)))
        }
    }

    async fn subscribe(&self, notifications: NotificationSender) -> Result<(), TransportError> {
        let data_handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = args.CharacteristicValue()?;
                    let reader = DataReader::FromBuffer(&value)?;
                    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                    reader.ReadBytes(&mut bytes)?;
                    forward_notification(&notifications, bytes);
                }
                Ok(())
            },
        );
        let token = self.data_char.ValueChanged(&data_handler)?;
        store_token(&self.value_changed_token, token);

        let operation = self
            .data_char
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )?;
        let status = operation.await?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Gatt(format!(
                "Notification subscription returned status: {:?}",
                status
            )));
        }

        info!("Notifications enabled");
        Ok(())
    }

    async fn write_command(&self, command: &[u8]) -> Result<(), TransportError> {
        let operation = {
            let writer = DataWriter::new()?;
            writer.WriteBytes(command)?;
            let buffer = writer.DetachBuffer()?;
            self.command_char.WriteValueAsync(&buffer)?
        };

        let status = operation.await?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Gatt(format!(
                "Command write returned status: {:?}",
                status
            )));
        }
        Ok(())
    }

    fn watch_disconnect(&self, lost: oneshot::Sender<()>) -> Result<(), TransportError> {
        let lost = Mutex::new(Some(lost));
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        if let Some(tx) = lost.lock().ok().and_then(|mut guard| guard.take()) {
                            let _ = tx.send(());
                        }
                    }
                }
                Ok(())
            });
        let token = self.device.ConnectionStatusChanged(&status_handler)?;
        store_token(&self.status_token, token);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(token) = take_token(&self.value_changed_token) {
            let _ = self.data_char.RemoveValueChanged(token);

            // Ask the puck to stop streaming; the link may already be gone.
            if let Ok(operation) = self
                .data_char
                .WriteClientCharacteristicConfigurationDescriptorAsync(
                    GattClientCharacteristicConfigurationDescriptorValue::None,
                )
            {
                if let Err(e) = operation.await {
                    debug!("Could not disable notifications: {}", e);
                }
            }
        }
        if let Some(token) = take_token(&self.status_token) {
            let _ = self.device.RemoveConnectionStatusChanged(token);
        }

        for characteristic in [&self.data_char, &self.command_char] {
            if let Ok(service) = characteristic.Service() {
                if let Err(e) = service.Close() {
                    warn!("Failed to close GATT service: {}", e);
                }
            }
        }
        self.device.Close()?;
        info!("Disconnected from device");
        Ok(())
    }
}
