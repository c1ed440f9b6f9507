//! Bridging callback-style completions into awaitable operations
//!
//! Platform radio stacks report completion of connect, discovery, and
//! similar operations through a separate event pump. Each operation kind
//! gets one [`PendingSlot`]: starting the operation registers a waiter,
//! the pump resolves it exactly once, and a second start of the same kind
//! while the first is outstanding is rejected.

use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{LinkError, Result};

/// Operations that may have at most one outstanding waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Adapter reaching the powered-on state
    PowerOn,
    /// Advertisement scan
    Scan,
    /// Peripheral connection
    Connect,
    /// GATT service discovery
    DiscoverServices,
    /// GATT characteristic discovery
    DiscoverCharacteristics,
    /// Enabling or disabling notifications
    SetNotify,
    /// Characteristic write
    Write,
}

impl OperationKind {
    /// Every kind, in slot order
    pub const ALL: [OperationKind; 7] = [
        OperationKind::PowerOn,
        OperationKind::Scan,
        OperationKind::Connect,
        OperationKind::DiscoverServices,
        OperationKind::DiscoverCharacteristics,
        OperationKind::SetNotify,
        OperationKind::Write,
    ];

    /// Stable name for logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::PowerOn => "power_on",
            OperationKind::Scan => "scan",
            OperationKind::Connect => "connect",
            OperationKind::DiscoverServices => "discover_services",
            OperationKind::DiscoverCharacteristics => "discover_characteristics",
            OperationKind::SetNotify => "set_notify",
            OperationKind::Write => "write",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registration slot for a single operation kind
#[derive(Debug)]
pub struct PendingSlot<T> {
    kind: OperationKind,
    waiter: Mutex<Option<oneshot::Sender<Result<T>>>>,
}

impl<T> PendingSlot<T> {
    /// Create an empty slot
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            waiter: Mutex::new(None),
        }
    }

    /// Register a waiter
    ///
    /// Fails with [`LinkError::OperationInProgress`] while another waiter of
    /// this kind is outstanding. A waiter that was dropped no longer holds
    /// the slot.
    pub fn begin(&self) -> Result<PendingOperation<T>> {
        let mut waiter = self.waiter.lock();
        if let Some(existing) = waiter.as_ref() {
            if !existing.is_closed() {
                return Err(LinkError::OperationInProgress(self.kind.as_str()));
            }
        }
        let (tx, rx) = oneshot::channel();
        *waiter = Some(tx);
        trace!(operation = %self.kind, "Operation pending");
        Ok(PendingOperation {
            kind: self.kind,
            rx,
        })
    }

    /// Complete the outstanding waiter
    ///
    /// Returns `false` if nothing was waiting or the waiter already left.
    pub fn resolve(&self, outcome: Result<T>) -> bool {
        match self.waiter.lock().take() {
            Some(tx) => {
                trace!(operation = %self.kind, ok = outcome.is_ok(), "Operation resolved");
                tx.send(outcome).is_ok()
            }
            None => false,
        }
    }

    /// Whether a live waiter holds the slot
    pub fn is_pending(&self) -> bool {
        self.waiter
            .lock()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }
}

/// Awaitable side of a [`PendingSlot`] registration
#[derive(Debug)]
pub struct PendingOperation<T> {
    kind: OperationKind,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> PendingOperation<T> {
    /// Kind this waiter was registered for
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Wait for the slot to be resolved
    pub async fn wait(self) -> Result<T> {
        self.rx.await.map_err(|_| LinkError::ChannelClosed)?
    }

    /// Wait with an upper bound; the slot is freed if the bound elapses
    pub async fn wait_timeout(self, limit: Duration) -> Result<T> {
        tokio::time::timeout(limit, self.wait()).await?
    }
}

/// One slot per [`OperationKind`]
#[derive(Debug)]
pub struct OperationSlots {
    slots: Vec<PendingSlot<()>>,
}

impl Default for OperationSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationSlots {
    /// Create a full set of empty slots
    pub fn new() -> Self {
        Self {
            slots: OperationKind::ALL.iter().map(|k| PendingSlot::new(*k)).collect(),
        }
    }

    /// Slot for one kind
    pub fn slot(&self, kind: OperationKind) -> &PendingSlot<()> {
        &self.slots[kind.index()]
    }

    /// Register a waiter for `kind`
    pub fn begin(&self, kind: OperationKind) -> Result<PendingOperation<()>> {
        self.slot(kind).begin()
    }

    /// Resolve the waiter for `kind`
    pub fn resolve(&self, kind: OperationKind, outcome: Result<()>) -> bool {
        self.slot(kind).resolve(outcome)
    }

    /// Whether `kind` is outstanding
    pub fn is_pending(&self, kind: OperationKind) -> bool {
        self.slot(kind).is_pending()
    }

    /// Fail every outstanding waiter, e.g. when the link drops
    pub fn fail_all(&self, error: impl Fn() -> LinkError) {
        for slot in &self.slots {
            slot.resolve(Err(error()));
        }
    }
}
