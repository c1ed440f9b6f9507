//! Configuration types for radio links and firmware updates
//!
//! This module provides configuration structures for the TCP and BLE
//! transports and for both OTA updaters, plus the protocol constants they
//! share.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::{LinkError, Result};

/// Frame start marker on the TCP stream (first 2 bytes)
pub const FRAME_MAGIC: [u8; 2] = [0x94, 0xC3];

/// Size of the frame header (magic + big-endian length)
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload the 16-bit length prefix can describe
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Default port of the device's TCP API
pub const DEFAULT_TCP_PORT: u16 = 4403;

/// mDNS service type advertised by networked radios
pub const MESHTASTIC_SERVICE_TYPE: &str = "_meshtastic._tcp.local.";

/// UDP port the device listens on for WiFi OTA invitations
pub const WIFI_OTA_DEVICE_PORT: u16 = 3232;

/// WiFi OTA chunk size, sized for a common path MTU
pub const WIFI_OTA_CHUNK_SIZE: usize = 1460;

/// Bytes of ATT overhead subtracted from the negotiated write length
pub const BLE_OTA_CHUNK_OVERHEAD: usize = 3;

/// Default connection timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 10000;

/// Main configuration for the link layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    /// TCP transport settings
    #[serde(default)]
    pub tcp: TcpConfig,

    /// BLE transport settings
    #[serde(default)]
    pub ble: BleConfig,

    /// WiFi OTA settings
    #[serde(default)]
    pub wifi_ota: WifiOtaConfig,

    /// BLE OTA settings
    #[serde(default)]
    pub ble_ota: BleOtaConfig,
}

impl LinkConfig {
    /// Parse a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let config: LinkConfig =
            serde_json::from_str(json).map_err(|e| LinkError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the protocols cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.wifi_ota.chunk_size == 0 {
            return Err(LinkError::InvalidConfig(
                "wifi_ota.chunk_size must be non-zero".into(),
            ));
        }
        if self.wifi_ota.progress_every_chunks == 0 {
            return Err(LinkError::InvalidConfig(
                "wifi_ota.progress_every_chunks must be non-zero".into(),
            ));
        }
        if self.ble_ota.chunks_per_ack == 0 {
            return Err(LinkError::InvalidConfig(
                "ble_ota.chunks_per_ack must be non-zero".into(),
            ));
        }
        if self.ble.max_write_len <= BLE_OTA_CHUNK_OVERHEAD {
            return Err(LinkError::InvalidConfig(format!(
                "ble.max_write_len must exceed {} bytes",
                BLE_OTA_CHUNK_OVERHEAD
            )));
        }
        Ok(())
    }
}

/// TCP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Port used when a connection string omits one
    #[serde(default = "default_tcp_port")]
    pub default_port: u16,

    /// Time allowed for the socket to become ready
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// mDNS service type to browse
    #[serde(default = "default_service_type")]
    pub service_type: String,
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(DEFAULT_TIMEOUT_MS)
}

fn default_service_type() -> String {
    MESHTASTIC_SERVICE_TYPE.to_string()
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_TCP_PORT,
            connect_timeout: default_connect_timeout(),
            service_type: default_service_type(),
        }
    }
}

/// BLE transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleConfig {
    /// A discovered device is reported lost after this long without an advertisement
    #[serde(with = "humantime_serde", default = "default_stale_after")]
    pub stale_after: Duration,

    /// How often the stale-device sweep runs
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,

    /// Write length reported for every link, since btleplug does not expose
    /// the negotiated ATT MTU. The default fits a 247-byte MTU
    #[serde(default = "default_max_write_len")]
    pub max_write_len: usize,

    /// Time allowed for a peripheral to connect
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

fn default_stale_after() -> Duration {
    Duration::from_secs(30)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_max_write_len() -> usize {
    244
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
            sweep_interval: default_sweep_interval(),
            max_write_len: default_max_write_len(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// WiFi OTA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiOtaConfig {
    /// Device UDP port receiving invitations
    #[serde(default = "default_wifi_ota_port")]
    pub device_port: u16,

    /// Local address the transfer listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Bulk transfer chunk size
    #[serde(default = "default_wifi_chunk_size")]
    pub chunk_size: usize,

    /// Delay between invitation broadcasts
    #[serde(with = "humantime_serde", default = "default_retry_interval")]
    pub retry_interval: Duration,

    /// Total time allowed for the UDP handshake
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,

    /// Time allowed for the device to connect back after `OK`
    #[serde(with = "humantime_serde", default = "default_accept_timeout")]
    pub accept_timeout: Duration,

    /// Pause after the final chunk before closing the connection
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,

    /// Progress is published once per this many chunks
    #[serde(default = "default_progress_every")]
    pub progress_every_chunks: usize,
}

fn default_wifi_ota_port() -> u16 {
    WIFI_OTA_DEVICE_PORT
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_wifi_chunk_size() -> usize {
    WIFI_OTA_CHUNK_SIZE
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_accept_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_progress_every() -> usize {
    10
}

impl Default for WifiOtaConfig {
    fn default() -> Self {
        Self {
            device_port: WIFI_OTA_DEVICE_PORT,
            bind_address: default_bind_address(),
            chunk_size: WIFI_OTA_CHUNK_SIZE,
            retry_interval: default_retry_interval(),
            handshake_timeout: default_handshake_timeout(),
            accept_timeout: default_accept_timeout(),
            settle_delay: default_settle_delay(),
            progress_every_chunks: default_progress_every(),
        }
    }
}

/// BLE OTA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleOtaConfig {
    /// Time allowed to find a device advertising the update service
    #[serde(with = "humantime_serde", default = "default_scan_timeout")]
    pub scan_timeout: Duration,

    /// Chunks written per `READY_FOR_CHUNK` / `CHUNK_ACK`
    #[serde(default = "default_chunks_per_ack")]
    pub chunks_per_ack: usize,
}

fn default_scan_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_chunks_per_ack() -> usize {
    1
}

impl Default for BleOtaConfig {
    fn default() -> Self {
        Self {
            scan_timeout: default_scan_timeout(),
            chunks_per_ack: default_chunks_per_ack(),
        }
    }
}

/// Builder for LinkConfig
#[derive(Debug, Default)]
pub struct LinkConfigBuilder {
    config: LinkConfig,
}

impl LinkConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TCP and BLE connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.tcp.connect_timeout = timeout;
        self.config.ble.connect_timeout = timeout;
        self
    }

    /// Set the port assumed when a connection string has none
    pub fn default_tcp_port(mut self, port: u16) -> Self {
        self.config.tcp.default_port = port;
        self
    }

    /// Set the WiFi OTA device port
    pub fn wifi_ota_device_port(mut self, port: u16) -> Self {
        self.config.wifi_ota.device_port = port;
        self
    }

    /// Set the WiFi OTA listener bind address
    pub fn wifi_ota_bind_address(mut self, address: IpAddr) -> Self {
        self.config.wifi_ota.bind_address = address;
        self
    }

    /// Set the WiFi OTA handshake timings
    pub fn wifi_ota_timing(mut self, retry_interval: Duration, handshake_timeout: Duration) -> Self {
        self.config.wifi_ota.retry_interval = retry_interval;
        self.config.wifi_ota.handshake_timeout = handshake_timeout;
        self
    }

    /// Set the pause after the final WiFi OTA chunk
    pub fn wifi_ota_settle_delay(mut self, delay: Duration) -> Self {
        self.config.wifi_ota.settle_delay = delay;
        self
    }

    /// Set the BLE OTA scan timeout
    pub fn ble_ota_scan_timeout(mut self, timeout: Duration) -> Self {
        self.config.ble_ota.scan_timeout = timeout;
        self
    }

    /// Set how many chunks are written per device acknowledgement (min 1)
    pub fn chunks_per_ack(mut self, chunks: usize) -> Self {
        self.config.ble_ota.chunks_per_ack = chunks.max(1);
        self
    }

    /// Set the fallback BLE maximum write length
    pub fn ble_max_write_len(mut self, len: usize) -> Self {
        self.config.ble.max_write_len = len;
        self
    }

    /// Build the configuration
    pub fn build(self) -> LinkConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
