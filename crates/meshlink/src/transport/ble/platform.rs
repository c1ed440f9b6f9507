//! btleplug-backed [`BleAdapter`]
//!
//! btleplug reports power changes and connection completions on a separate
//! central event stream. A pump task owned by the adapter forwards those
//! into [`OperationSlots`], so each awaiting call resolves exactly once.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{Advertisement, BleAdapter, BlePeripheral, Notification, WriteKind};
use crate::bridge::{OperationKind, OperationSlots, PendingOperation};
use crate::config::BleConfig;
use crate::error::{LinkError, Result};

const SIGHTING_BUFFER: usize = 64;
const NOTIFICATION_BUFFER: usize = 64;

/// State shared between the adapter and its event pump
#[derive(Default)]
struct PumpState {
    slots: OperationSlots,
    sightings: Mutex<Option<mpsc::Sender<Advertisement>>>,
    connecting: Mutex<Option<PeripheralId>>,
}

/// First local Bluetooth adapter, driven through btleplug
pub struct BtleplugAdapter {
    adapter: Adapter,
    config: BleConfig,
    shared: Arc<PumpState>,
    scan: Mutex<Option<PendingOperation<()>>>,
    pump: JoinHandle<()>,
}

impl BtleplugAdapter {
    /// Open the first adapter the platform reports
    pub async fn new(config: BleConfig) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::BluetoothUnavailable("no adapter found".to_string()))?;

        if let Ok(info) = adapter.adapter_info().await {
            info!(adapter = %info, "Using Bluetooth adapter");
        }

        let shared = Arc::new(PumpState::default());
        let events = adapter.events().await?;
        let pump = tokio::spawn(run_pump(adapter.clone(), events, shared.clone()));

        Ok(Self {
            adapter,
            config,
            shared,
            scan: Mutex::new(None),
            pump,
        })
    }

    async fn find_peripheral(&self, id: &str) -> Result<Peripheral> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == id)
            .ok_or_else(|| LinkError::DeviceNotFound(id.to_string()))
    }
}

impl Drop for BtleplugAdapter {
    fn drop(&mut self) {
        self.pump.abort();
        self.shared
            .slots
            .fail_all(|| LinkError::BluetoothUnavailable("adapter closed".to_string()));
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn wait_until_powered_on(&self) -> Result<()> {
        if matches!(self.adapter.adapter_state().await?, CentralState::PoweredOn) {
            return Ok(());
        }
        let pending = self.shared.slots.begin(OperationKind::PowerOn)?;
        // The state may have flipped between the check and registering
        if matches!(self.adapter.adapter_state().await?, CentralState::PoweredOn) {
            self.shared.slots.resolve(OperationKind::PowerOn, Ok(()));
        }
        info!("Waiting for Bluetooth to power on");
        pending.wait().await
    }

    async fn scan(&self, service: Uuid) -> Result<mpsc::Receiver<Advertisement>> {
        let guard = self.shared.slots.begin(OperationKind::Scan)?;
        let (tx, rx) = mpsc::channel(SIGHTING_BUFFER);
        *self.shared.sightings.lock() = Some(tx);

        if let Err(e) = self
            .adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
        {
            self.shared.sightings.lock().take();
            return Err(e.into());
        }
        *self.scan.lock() = Some(guard);
        debug!(service = %service, "Scan started");
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<()> {
        self.shared.sightings.lock().take();
        self.scan.lock().take();
        self.shared.slots.resolve(OperationKind::Scan, Ok(()));
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<Arc<dyn BlePeripheral>> {
        let peripheral = self.find_peripheral(id).await?;
        let pending = self.shared.slots.begin(OperationKind::Connect)?;
        *self.shared.connecting.lock() = Some(peripheral.id());

        let timeout = self.config.connect_timeout;
        let outcome = match tokio::time::timeout(timeout, peripheral.connect()).await {
            Ok(Ok(())) => {
                // Some backends complete `connect` without a central event
                if peripheral.is_connected().await.unwrap_or(false) {
                    self.shared.slots.resolve(OperationKind::Connect, Ok(()));
                }
                pending.wait_timeout(timeout).await
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(LinkError::ConnectionTimeout {
                duration_ms: timeout.as_millis() as u64,
            }),
        };
        self.shared.connecting.lock().take();

        if let Err(e) = outcome {
            warn!(peripheral = %id, error = %e, "BLE connect failed");
            if let Err(e) = peripheral.disconnect().await {
                debug!(peripheral = %id, error = %e, "Disconnect after failed connect");
            }
            return Err(e);
        }

        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name);
        info!(peripheral = %id, name = ?name, "BLE peripheral connected");

        Ok(Arc::new(BtleplugPeripheral {
            adapter: self.adapter.clone(),
            peripheral,
            name,
            max_write_len: self.config.max_write_len,
            slots: OperationSlots::default(),
        }))
    }
}

async fn run_pump(
    adapter: Adapter,
    mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    shared: Arc<PumpState>,
) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::StateUpdate(state) => {
                debug!(state = ?state, "Adapter state changed");
                if matches!(state, CentralState::PoweredOn) {
                    shared.slots.resolve(OperationKind::PowerOn, Ok(()));
                }
            }
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Some(tx) = shared.sightings.lock().clone() else {
                    continue;
                };
                if let Some(adv) = advertisement(&adapter, &id).await {
                    if tx.try_send(adv).is_err() {
                        trace!(peripheral = %id, "Sighting dropped");
                    }
                }
            }
            CentralEvent::DeviceConnected(id) => {
                if shared.connecting.lock().as_ref() == Some(&id) {
                    shared.slots.resolve(OperationKind::Connect, Ok(()));
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                if shared.connecting.lock().as_ref() == Some(&id) {
                    shared.slots.resolve(
                        OperationKind::Connect,
                        Err(LinkError::Disconnected("peripheral disconnected".to_string())),
                    );
                }
            }
            _ => {}
        }
    }
    debug!("Central event stream ended");
}

async fn advertisement(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    Some(Advertisement {
        id: id.to_string(),
        name: properties.local_name,
        rssi: properties.rssi,
    })
}

/// A connected btleplug peripheral
struct BtleplugPeripheral {
    adapter: Adapter,
    peripheral: Peripheral,
    name: Option<String>,
    max_write_len: usize,
    /// GATT operations are exclusive per peripheral, not per adapter
    slots: OperationSlots,
}

impl BtleplugPeripheral {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| LinkError::CharacteristicMissing(uuid.to_string()))
    }

    fn begin(&self, kind: OperationKind) -> Result<PendingOperation<()>> {
        self.slots.begin(kind)
    }
}

#[async_trait]
impl BlePeripheral for BtleplugPeripheral {
    fn id(&self) -> String {
        self.peripheral.id().to_string()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn discover_services(&self) -> Result<Vec<Uuid>> {
        let _op = self.begin(OperationKind::DiscoverServices)?;
        self.peripheral.discover_services().await?;
        Ok(self.peripheral.services().iter().map(|s| s.uuid).collect())
    }

    async fn discover_characteristics(&self, service: Uuid) -> Result<Vec<Uuid>> {
        let _op = self.begin(OperationKind::DiscoverCharacteristics)?;
        self.peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| s.characteristics.iter().map(|c| c.uuid).collect())
            .ok_or_else(|| LinkError::ServiceMissing(service.to_string()))
    }

    async fn notifications(&self) -> Result<mpsc::Receiver<Notification>> {
        let mut values = self.peripheral.notifications().await?;
        let mut central = self.adapter.events().await?;
        let id = self.peripheral.id();
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    value = values.next() => {
                        let Some(value) = value else { break };
                        let notification = Notification {
                            characteristic: value.uuid,
                            value: value.value,
                        };
                        if tx.send(notification).await.is_err() {
                            break;
                        }
                    }
                    event = central.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => break,
                        Some(_) => {}
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }
            debug!(peripheral = %id, "Notification stream ended");
        });
        Ok(rx)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        let _op = self.begin(OperationKind::SetNotify)?;
        self.peripheral.subscribe(&c).await?;
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        let _op = self.begin(OperationKind::SetNotify)?;
        self.peripheral.unsubscribe(&c).await?;
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let c = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&c).await?)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8], kind: WriteKind) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        let _op = self.begin(OperationKind::Write)?;
        self.peripheral.write(&c, data, write_type).await?;
        Ok(())
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        debug!(peripheral = %self.peripheral.id(), "Peripheral disconnected");
        Ok(())
    }
}
