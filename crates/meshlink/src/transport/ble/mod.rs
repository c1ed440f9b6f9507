//! Bluetooth LE transport
//!
//! Protocol logic talks to the radio stack only through [`BleAdapter`] and
//! [`BlePeripheral`], so the same connection and update code runs against
//! btleplug (feature `ble`) or the fakes in [`crate::test_utils`].
//!
//! # Feature Requirements
//!
//! - `ble`: Requires BlueZ development files on Linux
//!   ```bash
//!   apt install libdbus-1-dev
//!   ```

mod connection;
mod discovery;

#[cfg(feature = "ble")]
mod platform;

pub use connection::BleConnection;
pub use discovery::DiscoveryTracker;

#[cfg(feature = "ble")]
pub use platform::BtleplugAdapter;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::BleConfig;
use crate::connection::Connection;
use crate::device::{Device, DeviceId, TransportType};
use crate::error::{LinkError, Result};
use crate::event::{DiscoveryEvent, EventStream};
use crate::message::RadioMessage;
use crate::transport::Transport;

/// Radio API GATT service
pub const MESHTASTIC_SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1b218_15a8_461f_9fa8_5dcae273eafd);

/// Phone-to-radio characteristic (write)
pub const TORADIO_UUID: Uuid = Uuid::from_u128(0xf75c76d2_129e_4dad_a1dd_7866124401e7);

/// Radio-to-phone characteristic (read until empty)
pub const FROMRADIO_UUID: Uuid = Uuid::from_u128(0x2c55e69e_4993_11ed_b878_0242ac120002);

/// Pending-packet counter (notify)
pub const FROMNUM_UUID: Uuid = Uuid::from_u128(0xed9da18c_a800_4f66_a670_aa7547e34453);

/// Radio debug log (notify)
pub const LOGRADIO_UUID: Uuid = Uuid::from_u128(0x5a3d6e49_06e6_4423_9944_e9de8cdf9547);

const CHARACTERISTIC_NAMES: [(Uuid, &str); 4] = [
    (TORADIO_UUID, "TORADIO"),
    (FROMRADIO_UUID, "FROMRADIO"),
    (FROMNUM_UUID, "FROMNUM"),
    (LOGRADIO_UUID, "LOGRADIO"),
];

/// Human name of a radio API characteristic, for logs
pub fn characteristic_name(uuid: &Uuid) -> &'static str {
    CHARACTERISTIC_NAMES
        .iter()
        .find(|(known, _)| known == uuid)
        .map(|(_, name)| *name)
        .unwrap_or("UNKNOWN")
}

/// One received advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform peripheral identifier
    pub id: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength of this sighting
    pub rssi: Option<i16>,
}

/// A value pushed by the peripheral on a subscribed characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Characteristic the value arrived on
    pub characteristic: Uuid,
    /// Raw value
    pub value: Vec<u8>,
}

/// Write acknowledgement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Wait for the peripheral to acknowledge
    WithResponse,
    /// Fire and forget
    WithoutResponse,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteKind::WithResponse => write!(f, "with-response"),
            WriteKind::WithoutResponse => write!(f, "without-response"),
        }
    }
}

/// Central-role Bluetooth stack
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Suspend until the radio is powered on
    async fn wait_until_powered_on(&self) -> Result<()>;

    /// Scan for peripherals advertising `service`
    ///
    /// Repeated sightings of the same peripheral are delivered again so
    /// callers can track signal strength and staleness.
    async fn scan(&self, service: Uuid) -> Result<mpsc::Receiver<Advertisement>>;

    /// Stop the current scan
    async fn stop_scan(&self) -> Result<()>;

    /// Establish a link-level connection to a scanned peripheral
    async fn connect(&self, id: &str) -> Result<Arc<dyn BlePeripheral>>;
}

/// A connected peripheral
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// Platform identifier
    fn id(&self) -> String;

    /// Advertised name
    fn name(&self) -> Option<String>;

    /// Discover GATT services
    async fn discover_services(&self) -> Result<Vec<Uuid>>;

    /// Characteristics of a discovered service
    async fn discover_characteristics(&self, service: Uuid) -> Result<Vec<Uuid>>;

    /// Stream of notifications on every subscribed characteristic
    ///
    /// The stream ends when the peripheral disconnects.
    async fn notifications(&self) -> Result<mpsc::Receiver<Notification>>;

    /// Enable notifications on a characteristic
    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Disable notifications on a characteristic
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Read a characteristic value
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write a characteristic value
    async fn write(&self, characteristic: Uuid, data: &[u8], kind: WriteKind) -> Result<()>;

    /// Largest single write the link accepts
    fn max_write_len(&self) -> usize;

    /// Drop the link
    async fn disconnect(&self) -> Result<()>;
}

/// Stable id for a BLE peripheral
///
/// Platform ids that already are UUIDs are used as-is; anything else
/// (e.g. a MAC address) is hashed.
pub fn peripheral_device_id(id: &str) -> DeviceId {
    Uuid::parse_str(id)
        .map(DeviceId::from_uuid)
        .unwrap_or_else(|_| DeviceId::from_hash(id))
}

/// Device description for an advertisement
pub fn device_for_advertisement(adv: &Advertisement) -> Device {
    Device {
        id: peripheral_device_id(&adv.id),
        name: adv.name.clone().unwrap_or_else(|| "Unknown".to_string()),
        transport_type: TransportType::Ble,
        identifier: adv.id.clone(),
        is_manual: false,
        rssi: adv.rssi,
    }
}

/// Transport for radios over Bluetooth LE
#[derive(Clone)]
pub struct BleTransport {
    adapter: Arc<dyn BleAdapter>,
    config: BleConfig,
}

impl fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleTransport")
            .field("config", &self.config)
            .finish()
    }
}

impl BleTransport {
    /// Create a transport over an adapter
    pub fn new(adapter: Arc<dyn BleAdapter>, config: BleConfig) -> Self {
        Self { adapter, config }
    }

    /// Adapter this transport drives
    pub fn adapter(&self) -> &Arc<dyn BleAdapter> {
        &self.adapter
    }

    /// Scan for radios until the returned stream is dropped
    ///
    /// First sightings yield `DeviceFound`, later ones `DeviceUpdated`.
    /// Devices unseen for `stale_after` are reported lost by a periodic
    /// sweep. Dropping the stream stops the scan and forgets every
    /// candidate.
    pub fn discover_devices(&self) -> Result<EventStream<DiscoveryEvent>> {
        let (tx, stream) = EventStream::channel();
        let adapter = self.adapter.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            if let Err(e) = discovery::run_scan(adapter, config, tx).await {
                warn!(error = %e, "BLE discovery ended with error");
            }
        });
        Ok(stream)
    }

    /// Build an unconnected connection for a device
    pub fn connection_for<Tx, Rx>(&self, device: &Device) -> Result<BleConnection<Tx, Rx>>
    where
        Tx: RadioMessage,
        Rx: RadioMessage,
    {
        if device.transport_type != TransportType::Ble {
            return Err(LinkError::ConnectionFailed(format!(
                "{} is not a BLE device",
                device.name
            )));
        }
        Ok(BleConnection::new(
            self.adapter.clone(),
            device.identifier.clone(),
        ))
    }
}

#[async_trait]
impl<Tx, Rx> Transport<Tx, Rx> for BleTransport
where
    Tx: RadioMessage,
    Rx: RadioMessage,
{
    fn transport_type(&self) -> TransportType {
        TransportType::Ble
    }

    fn discover_devices(&self) -> Result<EventStream<DiscoveryEvent>> {
        BleTransport::discover_devices(self)
    }

    async fn connect(&self, device: &Device) -> Result<Box<dyn Connection<Tx, Rx>>> {
        info!(device = %device.name, identifier = %device.identifier, "Connecting to BLE device");
        Ok(Box::new(self.connection_for::<Tx, Rx>(device)?))
    }

    fn device_for_manual_connection(&self, _input: &str) -> Option<Device> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_constants() {
        assert_eq!(
            MESHTASTIC_SERVICE_UUID.to_string(),
            "6ba1b218-15a8-461f-9fa8-5dcae273eafd"
        );
        assert_eq!(
            LOGRADIO_UUID.to_string(),
            "5a3d6e49-06e6-4423-9944-e9de8cdf9547"
        );
        assert_eq!(characteristic_name(&FROMNUM_UUID), "FROMNUM");
    }

    #[test]
    fn test_peripheral_device_id() {
        let uuid = "6ba1b218-15a8-461f-9fa8-5dcae273eafd";
        assert_eq!(peripheral_device_id(uuid).to_string(), uuid);

        let mac = "AA:BB:CC:DD:EE:FF";
        assert_eq!(peripheral_device_id(mac), DeviceId::from_hash(mac));
    }

    #[test]
    fn test_device_for_advertisement() {
        let device = device_for_advertisement(&Advertisement {
            id: "AA:BB:CC:DD:EE:FF".to_string(),
            name: None,
            rssi: Some(-70),
        });
        assert_eq!(device.name, "Unknown");
        assert_eq!(device.rssi, Some(-70));
        assert_eq!(device.transport_type, TransportType::Ble);
    }
}
