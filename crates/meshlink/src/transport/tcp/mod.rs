//! TCP/IP transport for radios on the local network
//!
//! Discovery browses mDNS for the radio API service. Connections dial
//! `host[:port]` and speak the magic/length framed protocol.

mod connection;
pub mod discovery;

pub use connection::TcpConnection;
pub use discovery::{ServiceAnnouncement, ServiceRegistry};

use async_trait::async_trait;
use tracing::info;

use crate::config::TcpConfig;
use crate::connection::Connection;
use crate::device::{manual_tcp_device, parse_connection_string, Device, TransportType};
use crate::error::{LinkError, Result};
use crate::event::{DiscoveryEvent, EventStream};
use crate::message::RadioMessage;
use crate::transport::Transport;

/// Transport for radios reachable over TCP
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    /// Create a transport with the given settings
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }

    /// Transport settings
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Browse for radios until the returned stream is dropped
    ///
    /// A service is announced only once it resolves to a host and port.
    /// Dropping the stream stops the browse and forgets every candidate.
    #[cfg(feature = "tcp")]
    pub fn discover_devices(&self) -> Result<EventStream<DiscoveryEvent>> {
        let (tx, stream) = EventStream::channel();
        discovery::browse(self.config.service_type.clone(), tx)?;
        Ok(stream)
    }

    /// mDNS support is not compiled in
    #[cfg(not(feature = "tcp"))]
    pub fn discover_devices(&self) -> Result<EventStream<DiscoveryEvent>> {
        Err(LinkError::DiscoveryFailed(
            "built without the `tcp` feature".to_string(),
        ))
    }

    /// Build an unconnected connection for a device
    pub fn connection_for<Tx, Rx>(&self, device: &Device) -> Result<TcpConnection<Tx, Rx>>
    where
        Tx: RadioMessage,
        Rx: RadioMessage,
    {
        if device.transport_type != TransportType::Tcp {
            return Err(LinkError::ConnectionFailed(format!(
                "{} is not a TCP device",
                device.name
            )));
        }
        let target = parse_connection_string(&device.identifier, self.config.default_port)
            .map_err(|_| {
                LinkError::ConnectionFailed(format!(
                    "invalid identifier format: {}",
                    device.identifier
                ))
            })?;
        Ok(TcpConnection::new(target, self.config.connect_timeout))
    }

    /// Device for a hand-entered `host[:port]`
    pub fn device_for_manual_connection(&self, input: &str) -> Option<Device> {
        manual_tcp_device(input, self.config.default_port).ok()
    }
}

#[async_trait]
impl<Tx, Rx> Transport<Tx, Rx> for TcpTransport
where
    Tx: RadioMessage,
    Rx: RadioMessage,
{
    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    fn discover_devices(&self) -> Result<EventStream<DiscoveryEvent>> {
        TcpTransport::discover_devices(self)
    }

    async fn connect(&self, device: &Device) -> Result<Box<dyn Connection<Tx, Rx>>> {
        info!(device = %device.name, identifier = %device.identifier, "Connecting to TCP device");
        let connection = self.connection_for::<Tx, Rx>(device)?;
        Ok(Box::new(connection))
    }

    fn device_for_manual_connection(&self, input: &str) -> Option<Device> {
        TcpTransport::device_for_manual_connection(self, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RawFrame;

    #[test]
    fn test_manual_device() {
        let transport = TcpTransport::default();
        let device = transport.device_for_manual_connection("10.1.1.1").unwrap();
        assert_eq!(device.identifier, "10.1.1.1");
        assert!(transport.device_for_manual_connection("10.1.1.1:99999").is_none());
    }

    #[test]
    fn test_connection_uses_default_port() {
        let transport = TcpTransport::default();
        let device = transport.device_for_manual_connection("radio.lan").unwrap();
        let conn = transport
            .connection_for::<RawFrame, RawFrame>(&device)
            .unwrap();
        assert_eq!(conn.target().port, 4403);
        assert_eq!(conn.target().host, "radio.lan");
    }

    #[test]
    fn test_rejects_ble_device() {
        let transport = TcpTransport::default();
        let mut device = transport.device_for_manual_connection("radio.lan").unwrap();
        device.transport_type = TransportType::Ble;
        assert!(transport
            .connection_for::<RawFrame, RawFrame>(&device)
            .is_err());
    }
}
