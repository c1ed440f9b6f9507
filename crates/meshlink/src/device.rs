//! Device identity and manual connection strings

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::error::{LinkError, Result};

/// Physical medium a device is reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    /// Bluetooth Low Energy
    Ble,
    /// TCP/IP on the local network
    Tcp,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Ble => write!(f, "BLE"),
            TransportType::Tcp => write!(f, "TCP"),
        }
    }
}

/// Stable, content-derived device identifier
///
/// Built from the first 16 bytes of the SHA-256 digest of a normalized
/// string, so the same input always yields the same id across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Derive an id from a normalized identifier string
    pub fn from_hash(input: &str) -> Self {
        let digest = Sha256::digest(input.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        DeviceId(Uuid::from_bytes(bytes))
    }

    /// Wrap an id provided by the platform
    pub fn from_uuid(uuid: Uuid) -> Self {
        DeviceId(uuid)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// A discovered or manually entered endpoint
///
/// Immutable once built. Fresher discovery data produces a new value that
/// supersedes the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identifier
    pub id: DeviceId,
    /// Human-readable label
    pub name: String,
    /// Medium the device is reached over
    pub transport_type: TransportType,
    /// Transport-specific address (`host:port`, or a BLE peripheral id)
    pub identifier: String,
    /// Entered by hand rather than discovered
    pub is_manual: bool,
    /// Last signal-strength sample, if the medium reports one
    pub rssi: Option<i16>,
}

impl Device {
    /// Create a discovered device
    pub fn new(
        id: DeviceId,
        name: impl Into<String>,
        transport_type: TransportType,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            transport_type,
            identifier: identifier.into(),
            is_manual: false,
            rssi: None,
        }
    }

    /// Copy of this device with a fresh RSSI sample
    pub fn with_rssi(&self, rssi: Option<i16>) -> Self {
        Self {
            rssi,
            ..self.clone()
        }
    }
}

/// A parsed `host[:port]` connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    /// Host name or IPv4 address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl ConnectionTarget {
    /// Normalized `host:port` form
    pub fn normalized(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse `host` or `host:port`
///
/// The port must be all digits and fit in 16 bits. Anything with more than
/// one colon is rejected.
pub fn parse_connection_string(input: &str, default_port: u16) -> Result<ConnectionTarget> {
    let invalid = || LinkError::InvalidConnectionString(input.to_string());

    let parts: Vec<&str> = input.trim().split(':').collect();
    let (host, port) = match parts.as_slice() {
        [host] => (*host, default_port),
        [host, port] => {
            if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            let port: u16 = port.parse().map_err(|_| invalid())?;
            (*host, port)
        }
        _ => return Err(invalid()),
    };

    if host.is_empty() {
        return Err(invalid());
    }

    Ok(ConnectionTarget {
        host: host.to_string(),
        port,
    })
}

/// Build a device for a manually entered TCP connection string
pub fn manual_tcp_device(input: &str, default_port: u16) -> Result<Device> {
    let target = parse_connection_string(input, default_port)?;
    let input = input.trim();
    Ok(Device {
        id: DeviceId::from_hash(&target.normalized()),
        name: format!("{} (Manual)", input),
        transport_type: TransportType::Tcp,
        identifier: input.to_string(),
        is_manual: true,
        rssi: None,
    })
}
