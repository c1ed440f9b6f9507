//! Transports: device discovery and connection factories
//!
//! - [`tcp::TcpTransport`] - radios on the local network (mDNS discovery
//!   requires the `tcp` feature)
//! - [`ble::BleTransport`] - radios over Bluetooth LE, driven through a
//!   [`ble::BleAdapter`] (the btleplug adapter requires the `ble` feature)

pub mod ble;
pub mod tcp;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::device::{Device, TransportType};
use crate::error::Result;
use crate::event::{DiscoveryEvent, EventStream};
use crate::message::RadioMessage;

/// A physical medium able to find radios and open connections to them
#[async_trait]
pub trait Transport<Tx, Rx>: Send + Sync
where
    Tx: RadioMessage,
    Rx: RadioMessage,
{
    /// Medium this transport covers
    fn transport_type(&self) -> TransportType;

    /// Start a discovery session
    ///
    /// The session lasts until the returned stream is dropped, which stops
    /// the underlying scan or browse.
    fn discover_devices(&self) -> Result<EventStream<DiscoveryEvent>>;

    /// Create a connection for `device`
    ///
    /// The connection is returned unopened; call
    /// [`Connection::connect`] to establish it and obtain its events.
    async fn connect(&self, device: &Device) -> Result<Box<dyn Connection<Tx, Rx>>>;

    /// Device for a hand-entered connection string, if this medium supports one
    fn device_for_manual_connection(&self, input: &str) -> Option<Device>;
}
