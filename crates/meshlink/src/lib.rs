//! Link layer between an application and a single Meshtastic LoRa radio
//!
//! This crate moves framed protobuf payloads between the host and one
//! physically reachable radio, and pushes firmware images to a radio that
//! has been rebooted into update mode.
//!
//! # Architecture
//!
//! The crate is split into four layers:
//!
//! 1. **Transports** - discover radios (mDNS for TCP, advertisement scans
//!    for BLE) and build connections for them
//! 2. **Connections** - one task per open link owns the socket or
//!    peripheral; callers send through a handle and read an event stream
//!    that ends with exactly one terminal event
//! 3. **Framing** - `0x94 0xC3`, big-endian `u16` length, payload
//! 4. **Firmware updates** - the WiFi (UDP invitation + TCP push) and BLE
//!    (status-driven chunk writes) update protocols
//!
//! Retry policy is left to the caller: terminal events and errors say
//! whether reconnecting makes sense, nothing here retries on its own.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use meshlink::{Connection, ConnectionEvent, RawFrame, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> meshlink::Result<()> {
//!     let transport = TcpTransport::default();
//!     let device = transport
//!         .device_for_manual_connection("192.168.1.40")
//!         .expect("valid host");
//!
//!     let mut connection = transport.connection_for::<RawFrame, RawFrame>(&device)?;
//!     let mut events = connection.connect().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             ConnectionEvent::Data(frame) => println!("{} bytes", frame.len()),
//!             other if other.is_terminal() => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `tcp` (default) - mDNS discovery for the TCP transport (`mdns-sd`)
//! - `ble` - btleplug platform adapter (requires `libdbus-1-dev` on Linux)
//! - `full` - everything

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;

// Data model
pub mod device;
pub mod event;
pub mod message;

// Wire format
pub mod frame;

// Connections and transports
pub mod bridge;
pub mod connection;
pub mod transport;

// Firmware updates
pub mod ota;

// Testing utilities
pub mod test_utils;

// Re-exports for convenience
pub use config::{
    BleConfig, BleOtaConfig, LinkConfig, LinkConfigBuilder, TcpConfig, WifiOtaConfig,
};
pub use error::{LinkError, Result};

pub use device::{
    manual_tcp_device, parse_connection_string, ConnectionTarget, Device, DeviceId, TransportType,
};
pub use event::{ConnectionEvent, DiscoveryEvent, EventStream};
pub use message::{RadioMessage, RawFrame};

pub use frame::{encode_frame, FrameDecoder};

pub use bridge::{OperationKind, OperationSlots, PendingOperation, PendingSlot};
pub use connection::{Connection, LinkState};
pub use transport::ble::{BleAdapter, BleConnection, BlePeripheral, BleTransport};
pub use transport::tcp::{TcpConnection, TcpTransport};
pub use transport::Transport;

#[cfg(feature = "ble")]
pub use transport::ble::BtleplugAdapter;

pub use ota::ble::BleOtaUpdater;
pub use ota::wifi::WifiOtaUpdater;
pub use ota::{IdleTimer, NoopIdleTimer, OtaState, OtaStatus};

pub use test_utils::{MockAdapter, MockPeripheral, RecordingIdleTimer};

// Protocol constants re-exports
pub use config::{
    DEFAULT_TCP_PORT, FRAME_MAGIC, MAX_FRAME_PAYLOAD, MESHTASTIC_SERVICE_TYPE,
    WIFI_OTA_DEVICE_PORT,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
