//! Bluetooth LE firmware update
//!
//! The device exposes a status characteristic (notify) and an OTA
//! characteristic (write without response). After the invitation is
//! written, every step is driven by a one-byte status notification: the
//! device asks for each chunk, so writes never outrun it.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::invitation::{sha256_hex, Invitation};
use super::{IdleTimer, IdleTimerGuard, NoopIdleTimer, OtaSession, OtaState, OtaStatus};
use crate::config::{BleOtaConfig, BLE_OTA_CHUNK_OVERHEAD};
use crate::error::{LinkError, Result};
use crate::transport::ble::{Advertisement, BleAdapter, BlePeripheral, Notification, WriteKind};

/// OTA GATT service
pub const OTA_SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Device-to-phone status characteristic (notify)
pub const OTA_STATUS_UUID: Uuid = Uuid::from_u128(0x62ec0272_3ec5_11eb_b378_0242ac130003);

/// Phone-to-device image characteristic (write without response)
pub const OTA_WRITE_UUID: Uuid = Uuid::from_u128(0x62ec0272_3ec5_11eb_b378_0242ac130005);

/// Status byte reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OtaStatusCode {
    /// Waiting for the invitation
    WaitingForSize = 0,
    /// Erasing the update partition
    ErasingFlash = 1,
    /// Ready for the first chunk
    ReadyForChunk = 2,
    /// Previous chunk stored; ready for the next
    ChunkAck = 3,
    /// Image verified
    OtaComplete = 4,
    /// Update failed on the device
    Error = 5,
}

impl OtaStatusCode {
    /// Decode a status byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(OtaStatusCode::WaitingForSize),
            1 => Some(OtaStatusCode::ErasingFlash),
            2 => Some(OtaStatusCode::ReadyForChunk),
            3 => Some(OtaStatusCode::ChunkAck),
            4 => Some(OtaStatusCode::OtaComplete),
            5 => Some(OtaStatusCode::Error),
            _ => None,
        }
    }
}

/// What the updater should do after a status notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStep {
    /// Nothing to do
    Wait,
    /// Device is erasing
    Preparing,
    /// Write these chunks, in order
    Send(Vec<Bytes>),
    /// Device asked for more but the image is exhausted
    Stalled,
    /// Update finished successfully
    Complete,
    /// Device reported an error
    Failed,
}

/// Chunking and completion bookkeeping for one image
///
/// Pure state machine: feed it status codes, perform the returned steps.
/// Once it reaches completion or failure every further code is ignored.
#[derive(Debug)]
pub struct BleOtaTransfer {
    image: Bytes,
    offset: usize,
    chunk_size: usize,
    chunks_per_ack: usize,
    finished: bool,
}

impl BleOtaTransfer {
    /// Create a transfer of `image` in chunks of `chunk_size`
    pub fn new(image: Bytes, chunk_size: usize, chunks_per_ack: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(LinkError::InvalidConfig("chunk size must be non-zero".to_string()));
        }
        Ok(Self {
            image,
            offset: 0,
            chunk_size,
            chunks_per_ack: chunks_per_ack.max(1),
            finished: false,
        })
    }

    /// Bytes not yet handed out
    pub fn remaining(&self) -> usize {
        self.image.len() - self.offset
    }

    /// Percent of the image handed out
    pub fn progress(&self) -> f64 {
        let total = self.image.len();
        if total == 0 {
            return 100.0;
        }
        100.0 * (1.0 - self.remaining() as f64 / total as f64)
    }

    /// Whether the transfer reached a final state
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Advance on one status code
    pub fn handle(&mut self, code: OtaStatusCode) -> TransferStep {
        if self.finished {
            return TransferStep::Wait;
        }
        match code {
            OtaStatusCode::WaitingForSize => TransferStep::Wait,
            OtaStatusCode::ErasingFlash => TransferStep::Preparing,
            OtaStatusCode::ReadyForChunk | OtaStatusCode::ChunkAck => {
                let mut chunks = Vec::with_capacity(self.chunks_per_ack);
                while chunks.len() < self.chunks_per_ack && self.remaining() > 0 {
                    let end = (self.offset + self.chunk_size).min(self.image.len());
                    chunks.push(self.image.slice(self.offset..end));
                    self.offset = end;
                }
                if chunks.is_empty() {
                    TransferStep::Stalled
                } else {
                    TransferStep::Send(chunks)
                }
            }
            OtaStatusCode::OtaComplete => {
                self.finished = true;
                TransferStep::Complete
            }
            OtaStatusCode::Error => {
                self.finished = true;
                TransferStep::Failed
            }
        }
    }
}

/// Pushes firmware to a device over Bluetooth LE
pub struct BleOtaUpdater {
    adapter: Arc<dyn BleAdapter>,
    config: BleOtaConfig,
    idle_timer: Arc<dyn IdleTimer>,
    session: OtaSession,
}

impl BleOtaUpdater {
    /// Create an updater over an adapter
    pub fn new(adapter: Arc<dyn BleAdapter>, config: BleOtaConfig) -> Self {
        Self {
            adapter,
            config,
            idle_timer: Arc::new(NoopIdleTimer),
            session: OtaSession::new(),
        }
    }

    /// Use a host idle timer, kept disabled while the image is sent
    pub fn with_idle_timer(mut self, timer: Arc<dyn IdleTimer>) -> Self {
        self.idle_timer = timer;
        self
    }

    /// Status updates for the current or last session
    pub fn status(&self) -> watch::Receiver<OtaStatus> {
        self.session.subscribe()
    }

    /// Latest status snapshot
    pub fn current_status(&self) -> OtaStatus {
        self.session.current()
    }

    /// Cancel the running session; refused while chunks are in flight
    pub fn cancel(&self) -> Result<()> {
        self.session.cancel()
    }

    /// Find the first device advertising the update service and flash it
    pub async fn run(&self, firmware: &[u8]) -> Result<()> {
        let _run = self.session.start()?;
        info!(size = firmware.len(), "Starting BLE OTA");

        match self.update(firmware).await {
            Ok(()) => {
                self.session.set_state(OtaState::Completed, "OTA Complete!");
                info!("BLE OTA complete");
                Ok(())
            }
            Err(e) => {
                self.session.fail(&e);
                Err(e)
            }
        }
    }

    async fn update(&self, firmware: &[u8]) -> Result<()> {
        if firmware.is_empty() {
            return Err(LinkError::InvalidFirmware("image is empty".to_string()));
        }

        self.or_cancel(self.adapter.wait_until_powered_on()).await?;
        let found = self.find_device().await?;
        let name = found.name.clone().unwrap_or_else(|| "unknown".to_string());
        self.session.set_device_name(name.clone());

        let peripheral = self.or_cancel(self.adapter.connect(&found.id)).await?;
        self.session.set_state(OtaState::Connected, format!("Connected to {name}"));

        let result = self.flash(&peripheral, firmware).await;

        if let Err(e) = peripheral.unsubscribe(OTA_STATUS_UUID).await {
            debug!(error = %e, "Status unsubscribe failed");
        }
        if let Err(e) = peripheral.disconnect().await {
            debug!(error = %e, "Peripheral disconnect failed");
        }
        result
    }

    /// Scan raced against the scan timeout; the scan is stopped either way
    async fn find_device(&self) -> Result<Advertisement> {
        let mut sightings = self.adapter.scan(OTA_SERVICE_UUID).await?;
        let timeout = self.config.scan_timeout;

        let found = tokio::select! {
            sighting = sightings.recv() => sighting
                .ok_or_else(|| LinkError::Bluetooth("scan ended unexpectedly".to_string())),
            _ = tokio::time::sleep(timeout) => Err(LinkError::ScanTimeout {
                duration_ms: timeout.as_millis() as u64,
            }),
            _ = self.session.cancelled() => Err(LinkError::Cancelled),
        };
        drop(sightings);

        if let Err(e) = self.adapter.stop_scan().await {
            debug!(error = %e, "Stopping scan failed");
        }
        let found = found?;
        info!(id = %found.id, name = ?found.name, "Found device in update mode");
        Ok(found)
    }

    async fn flash(&self, peripheral: &Arc<dyn BlePeripheral>, firmware: &[u8]) -> Result<()> {
        let services = self.or_cancel(peripheral.discover_services()).await?;
        if !services.contains(&OTA_SERVICE_UUID) {
            return Err(LinkError::ServiceMissing(OTA_SERVICE_UUID.to_string()));
        }
        let characteristics = self
            .or_cancel(peripheral.discover_characteristics(OTA_SERVICE_UUID))
            .await?;
        for required in [OTA_STATUS_UUID, OTA_WRITE_UUID] {
            if !characteristics.contains(&required) {
                return Err(LinkError::CharacteristicMissing(required.to_string()));
            }
        }

        // Listen before inviting so no status byte is missed
        let notifications = self.or_cancel(peripheral.notifications()).await?;
        self.or_cancel(peripheral.subscribe(OTA_STATUS_UUID)).await?;

        let _awake = IdleTimerGuard::new(self.idle_timer.clone());

        let chunk_size = peripheral
            .max_write_len()
            .saturating_sub(BLE_OTA_CHUNK_OVERHEAD);
        let mut transfer = BleOtaTransfer::new(
            Bytes::copy_from_slice(firmware),
            chunk_size,
            self.config.chunks_per_ack,
        )?;

        let invitation = Invitation::flash(0, firmware.len(), sha256_hex(firmware));
        debug!(invitation = %invitation, chunk_size, "Writing invitation");
        peripheral
            .write(OTA_WRITE_UUID, &invitation.to_bytes(), WriteKind::WithoutResponse)
            .await?;

        self.drive(peripheral, notifications, &mut transfer).await
    }

    async fn drive(
        &self,
        peripheral: &Arc<dyn BlePeripheral>,
        mut notifications: mpsc::Receiver<Notification>,
        transfer: &mut BleOtaTransfer,
    ) -> Result<()> {
        loop {
            let notification = tokio::select! {
                notification = notifications.recv() => notification,
                _ = self.session.cancelled() => return Err(LinkError::Cancelled),
            };
            let Some(notification) = notification else {
                return Err(LinkError::Disconnected(
                    "status notifications ended before completion".to_string(),
                ));
            };
            if notification.characteristic != OTA_STATUS_UUID {
                continue;
            }
            let Some(&byte) = notification.value.first() else {
                continue;
            };
            let Some(code) = OtaStatusCode::from_byte(byte) else {
                warn!(status = byte, "Unknown OTA status byte");
                continue;
            };

            match transfer.handle(code) {
                TransferStep::Wait => {
                    debug!(?code, "Device status");
                    if code == OtaStatusCode::WaitingForSize {
                        self.session
                            .set_state(OtaState::WaitingForConnection, "About to start...");
                    }
                }
                TransferStep::Preparing => {
                    self.session
                        .set_state(OtaState::Preparing, "Preparing flash partition...");
                }
                TransferStep::Send(chunks) => {
                    self.session
                        .set_state(OtaState::Transferring, "Transfer in progress...");
                    for chunk in chunks {
                        peripheral
                            .write(OTA_WRITE_UUID, &chunk, WriteKind::WithoutResponse)
                            .await?;
                    }
                    self.session.set_progress(transfer.progress());
                }
                TransferStep::Stalled => debug!("Image exhausted; waiting for completion"),
                TransferStep::Complete => return Ok(()),
                TransferStep::Failed => return Err(LinkError::DeviceReportedError),
            }
        }
    }

    async fn or_cancel<T>(&self, operation: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            result = operation => result,
            _ = self.session.cancelled() => Err(LinkError::Cancelled),
        }
    }
}
