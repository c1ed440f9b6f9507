//! Firmware updates over the air
//!
//! Two independent updaters push an image to a radio that has already been
//! rebooted into update mode:
//!
//! - [`wifi::WifiOtaUpdater`] - UDP invitation handshake, then the device
//!   connects back to a local TCP listener for the bulk transfer
//! - [`ble::BleOtaUpdater`] - status notifications drive chunked writes on a
//!   dedicated GATT service
//!
//! Both publish [`OtaStatus`] snapshots on a watch channel and accept
//! cancellation except while bytes are in flight.

pub mod ble;
pub mod invitation;
pub mod wifi;

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::error::{LinkError, Result};

/// Phase of an update session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OtaState {
    /// No session running
    #[default]
    Idle,
    /// Looking for the device or waiting for it to answer
    WaitingForConnection,
    /// Link to the device established
    Connected,
    /// Device is erasing its update partition
    Preparing,
    /// Image bytes are being sent
    Transferring,
    /// Device accepted the whole image
    Completed,
    /// Session ended with an error
    Error,
}

impl OtaState {
    /// Whether the session has ended
    pub fn is_finished(&self) -> bool {
        matches!(self, OtaState::Completed | OtaState::Error)
    }
}

impl fmt::Display for OtaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OtaState::Idle => "idle",
            OtaState::WaitingForConnection => "waiting for connection",
            OtaState::Connected => "connected",
            OtaState::Preparing => "preparing",
            OtaState::Transferring => "transferring",
            OtaState::Completed => "completed",
            OtaState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of an update session for display
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OtaStatus {
    /// Current phase
    pub state: OtaState,
    /// Transfer progress in percent, `0.0..=100.0`
    pub progress: f64,
    /// Human-readable status line
    pub message: String,
    /// Name of the device being updated, once known
    pub device_name: Option<String>,
}

/// Host hook that keeps the display awake during a transfer
pub trait IdleTimer: Send + Sync {
    /// Disable (`true`) or restore (`false`) the idle-sleep timer
    fn set_idle_timer_disabled(&self, disabled: bool);
}

/// Idle timer for hosts without one
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIdleTimer;

impl IdleTimer for NoopIdleTimer {
    fn set_idle_timer_disabled(&self, _disabled: bool) {}
}

/// Keeps the idle timer disabled while alive
pub(crate) struct IdleTimerGuard {
    timer: Arc<dyn IdleTimer>,
}

impl IdleTimerGuard {
    pub(crate) fn new(timer: Arc<dyn IdleTimer>) -> Self {
        timer.set_idle_timer_disabled(true);
        Self { timer }
    }
}

impl Drop for IdleTimerGuard {
    fn drop(&mut self) {
        self.timer.set_idle_timer_disabled(false);
    }
}

/// Status publication, cancellation and single-run enforcement for one updater
#[derive(Debug)]
pub(crate) struct OtaSession {
    status: watch::Sender<OtaStatus>,
    running: AtomicBool,
    cancelled: AtomicBool,
    cancel: Notify,
    // Serializes cancel checks against state changes
    state_lock: Mutex<()>,
}

impl OtaSession {
    pub(crate) fn new() -> Self {
        let (status, _) = watch::channel(OtaStatus::default());
        Self {
            status,
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cancel: Notify::new(),
            state_lock: Mutex::new(()),
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<OtaStatus> {
        self.status.subscribe()
    }

    pub(crate) fn current(&self) -> OtaStatus {
        self.status.borrow().clone()
    }

    /// Claim the session; fails while another run is active
    pub(crate) fn start(&self) -> Result<RunGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LinkError::UpdateInProgress);
        }
        self.cancelled.store(false, Ordering::Release);
        self.status.send_replace(OtaStatus {
            state: OtaState::WaitingForConnection,
            progress: 0.0,
            message: "Connecting...".to_string(),
            device_name: None,
        });
        Ok(RunGuard { session: self })
    }

    pub(crate) fn set_state(&self, state: OtaState, message: impl Into<String>) {
        let message = message.into();
        let _lock = self.state_lock.lock();
        debug!(state = %state, message = %message, "OTA state");
        self.status.send_modify(|status| {
            status.state = state;
            status.message = message;
        });
    }

    pub(crate) fn set_progress(&self, progress: f64) {
        self.status
            .send_modify(|status| status.progress = progress.clamp(0.0, 100.0));
    }

    pub(crate) fn set_device_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.status
            .send_modify(|status| status.device_name = Some(name));
    }

    pub(crate) fn fail(&self, error: &LinkError) {
        warn!(error = %error, code = error.error_code(), "OTA session failed");
        self.set_state(OtaState::Error, error.to_string());
    }

    /// Request cancellation of the running session
    pub(crate) fn cancel(&self) -> Result<()> {
        let _lock = self.state_lock.lock();
        if self.status.borrow().state == OtaState::Transferring {
            return Err(LinkError::TransferInFlight);
        }
        if self.running.load(Ordering::Acquire) {
            info!("OTA cancellation requested");
            self.cancelled.store(true, Ordering::Release);
            self.cancel.notify_waiters();
        }
        Ok(())
    }

    /// Resolves once the running session is cancelled
    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.cancel.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.cancelled.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// Marks the session idle again when a run ends
pub(crate) struct RunGuard<'a> {
    session: &'a OtaSession,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.session.running.store(false, Ordering::Release);
    }
}
