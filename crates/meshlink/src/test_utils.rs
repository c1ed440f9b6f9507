//! Test utilities for exercising the link and update protocols without radios
//!
//! [`MockAdapter`] and [`MockPeripheral`] implement the BLE traits in memory:
//! tests queue advertisements and `FROMRADIO` values, push notifications, and
//! inspect every write the code under test performed. A peripheral can also
//! be given a responder closure that answers writes with notifications, which
//! is how a device-side protocol is emulated.
//!
//! # Example
//!
//! ```rust,ignore
//! let peripheral = Arc::new(MockPeripheral::radio("AA:BB:CC:DD:EE:FF"));
//! peripheral.queue_read(payload);
//!
//! let adapter = Arc::new(MockAdapter::new());
//! adapter.add_peripheral(Some("radio"), peripheral.clone());
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bridge::{OperationKind, OperationSlots};
use crate::error::{LinkError, Result};
use crate::ota::ble::{OTA_SERVICE_UUID, OTA_STATUS_UUID, OTA_WRITE_UUID};
use crate::ota::IdleTimer;
use crate::transport::ble::{
    Advertisement, BleAdapter, BlePeripheral, Notification, WriteKind, FROMNUM_UUID,
    FROMRADIO_UUID, LOGRADIO_UUID, MESHTASTIC_SERVICE_UUID, TORADIO_UUID,
};

const NOTIFICATION_BUFFER: usize = 1024;

type Responder = Box<dyn FnMut(Uuid, &[u8]) -> Vec<Notification> + Send>;

/// One write performed against a [`MockPeripheral`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    /// Target characteristic
    pub characteristic: Uuid,
    /// Written bytes
    pub data: Vec<u8>,
    /// Acknowledgement mode
    pub kind: WriteKind,
}

/// In-memory peripheral
pub struct MockPeripheral {
    id: String,
    name: Option<String>,
    gatt: HashMap<Uuid, Vec<Uuid>>,
    max_write_len: usize,
    reads: Mutex<VecDeque<Vec<u8>>>,
    writes: Mutex<Vec<RecordedWrite>>,
    notify_tx: Mutex<Option<mpsc::Sender<Notification>>>,
    subscribed: Mutex<HashSet<Uuid>>,
    unsubscribes: AtomicUsize,
    disconnected: AtomicBool,
    fail_writes: AtomicBool,
    responder: Mutex<Option<Responder>>,
    latency: Option<Duration>,
    slots: OperationSlots,
}

impl std::fmt::Debug for MockPeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeripheral")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl MockPeripheral {
    /// Create a peripheral with no services
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            gatt: HashMap::new(),
            max_write_len: 512,
            reads: Mutex::new(VecDeque::new()),
            writes: Mutex::new(Vec::new()),
            notify_tx: Mutex::new(None),
            subscribed: Mutex::new(HashSet::new()),
            unsubscribes: AtomicUsize::new(0),
            disconnected: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            responder: Mutex::new(None),
            latency: None,
            slots: OperationSlots::new(),
        }
    }

    /// A radio exposing the full API service
    pub fn radio(id: impl Into<String>) -> Self {
        Self::new(id).with_service(
            MESHTASTIC_SERVICE_UUID,
            vec![TORADIO_UUID, FROMRADIO_UUID, FROMNUM_UUID, LOGRADIO_UUID],
        )
    }

    /// A device booted into BLE update mode
    pub fn ota_device(id: impl Into<String>) -> Self {
        Self::new(id).with_service(OTA_SERVICE_UUID, vec![OTA_STATUS_UUID, OTA_WRITE_UUID])
    }

    /// Add a service and its characteristics
    pub fn with_service(mut self, service: Uuid, characteristics: Vec<Uuid>) -> Self {
        self.gatt.insert(service, characteristics);
        self
    }

    /// Set the advertised name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the negotiated write length
    pub fn with_max_write_len(mut self, len: usize) -> Self {
        self.max_write_len = len;
        self
    }

    /// Delay service discovery and every write by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    async fn stall(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Answer writes with notifications
    pub fn on_write<F>(self, responder: F) -> Self
    where
        F: FnMut(Uuid, &[u8]) -> Vec<Notification> + Send + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
        self
    }

    /// Queue a value for the next read (reads of an empty queue return nothing)
    pub fn queue_read(&self, value: Vec<u8>) {
        self.reads.lock().push_back(value);
    }

    /// Push a notification to the code under test
    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) -> bool {
        let tx = self.notify_tx.lock().clone();
        match tx {
            Some(tx) => tx
                .try_send(Notification {
                    characteristic,
                    value,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Simulate the link dropping: the notification stream ends
    pub fn drop_link(&self) {
        self.notify_tx.lock().take();
    }

    /// Make every subsequent write fail
    pub fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    /// Writes performed so far
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().clone()
    }

    /// Whether notifications are enabled on `characteristic`
    pub fn is_subscribed(&self, characteristic: Uuid) -> bool {
        self.subscribed.lock().contains(&characteristic)
    }

    /// Number of unsubscribe calls
    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    /// Whether `disconnect` was called
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlePeripheral for MockPeripheral {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn discover_services(&self) -> Result<Vec<Uuid>> {
        let _op = self.slots.begin(OperationKind::DiscoverServices)?;
        self.stall().await;
        Ok(self.gatt.keys().copied().collect())
    }

    async fn discover_characteristics(&self, service: Uuid) -> Result<Vec<Uuid>> {
        self.gatt
            .get(&service)
            .cloned()
            .ok_or_else(|| LinkError::ServiceMissing(service.to_string()))
    }

    async fn notifications(&self) -> Result<mpsc::Receiver<Notification>> {
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        *self.notify_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        self.subscribed.lock().insert(characteristic);
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.subscribed.lock().remove(&characteristic);
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        if self.is_disconnected() {
            return Err(LinkError::NotConnected);
        }
        if characteristic != FROMRADIO_UUID {
            return Ok(Vec::new());
        }
        Ok(self.reads.lock().pop_front().unwrap_or_default())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8], kind: WriteKind) -> Result<()> {
        if self.is_disconnected() {
            return Err(LinkError::NotConnected);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LinkError::Bluetooth("simulated write failure".to_string()));
        }
        let _op = self.slots.begin(OperationKind::Write)?;
        self.stall().await;
        self.writes.lock().push(RecordedWrite {
            characteristic,
            data: data.to_vec(),
            kind,
        });

        let replies = match self.responder.lock().as_mut() {
            Some(respond) => respond(characteristic, data),
            None => Vec::new(),
        };
        for reply in replies {
            self.notify(reply.characteristic, reply.value);
        }
        Ok(())
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        self.notify_tx.lock().take();
        Ok(())
    }
}

/// In-memory central
#[derive(Debug, Default)]
pub struct MockAdapter {
    advertisements: Mutex<Vec<Advertisement>>,
    peripherals: Mutex<HashMap<String, Arc<MockPeripheral>>>,
    scan_tx: Mutex<Option<mpsc::Sender<Advertisement>>>,
    scans: AtomicUsize,
    stop_scans: AtomicUsize,
}

impl MockAdapter {
    /// Create an adapter with nothing in range
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a peripheral in range, advertised with `name`
    pub fn add_peripheral(&self, name: Option<&str>, peripheral: Arc<MockPeripheral>) {
        let adv = Advertisement {
            id: peripheral.id.clone(),
            name: name.map(str::to_string),
            rssi: Some(-60),
        };
        self.peripherals
            .lock()
            .insert(peripheral.id.clone(), peripheral);
        self.advertisements.lock().push(adv);
    }

    /// Deliver an advertisement to the running scan
    pub fn advertise(&self, adv: Advertisement) -> bool {
        let tx = self.scan_tx.lock().clone();
        tx.map(|tx| tx.try_send(adv).is_ok()).unwrap_or(false)
    }

    /// Number of scans started
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Number of scans stopped
    pub fn stop_scan_count(&self) -> usize {
        self.stop_scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn wait_until_powered_on(&self) -> Result<()> {
        Ok(())
    }

    async fn scan(&self, _service: Uuid) -> Result<mpsc::Receiver<Advertisement>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        for adv in self.advertisements.lock().iter() {
            let _ = tx.try_send(adv.clone());
        }
        *self.scan_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<()> {
        self.stop_scans.fetch_add(1, Ordering::SeqCst);
        self.scan_tx.lock().take();
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<Arc<dyn BlePeripheral>> {
        let peripheral = self
            .peripherals
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| LinkError::DeviceNotFound(id.to_string()))?;
        peripheral.disconnected.store(false, Ordering::SeqCst);
        Ok(peripheral)
    }
}

/// Idle timer that remembers every call
#[derive(Debug, Default)]
pub struct RecordingIdleTimer {
    calls: Mutex<Vec<bool>>,
}

impl RecordingIdleTimer {
    /// Values passed to `set_idle_timer_disabled`, in order
    pub fn calls(&self) -> Vec<bool> {
        self.calls.lock().clone()
    }
}

impl IdleTimer for RecordingIdleTimer {
    fn set_idle_timer_disabled(&self, disabled: bool) {
        self.calls.lock().push(disabled);
    }
}
