//! BLE scan session: sightings in, discovery events out

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{device_for_advertisement, Advertisement, BleAdapter, MESHTASTIC_SERVICE_UUID};
use crate::config::BleConfig;
use crate::device::DeviceId;
use crate::error::Result;
use crate::event::DiscoveryEvent;

/// Candidates seen during one scan session
#[derive(Debug)]
pub struct DiscoveryTracker {
    stale_after: Duration,
    last_seen: HashMap<String, (DeviceId, Instant)>,
}

impl DiscoveryTracker {
    /// Create a tracker that drops devices unseen for `stale_after`
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            last_seen: HashMap::new(),
        }
    }

    /// Record a sighting
    pub fn observe(&mut self, adv: &Advertisement, now: Instant) -> DiscoveryEvent {
        let device = device_for_advertisement(adv);
        match self.last_seen.insert(adv.id.clone(), (device.id, now)) {
            None => {
                debug!(device = %device.name, id = %adv.id, "Discovered BLE device");
                DiscoveryEvent::DeviceFound(device)
            }
            Some(_) => DiscoveryEvent::DeviceUpdated(device),
        }
    }

    /// Drop devices whose last sighting is older than the stale limit
    pub fn sweep(&mut self, now: Instant) -> Vec<DiscoveryEvent> {
        let stale_after = self.stale_after;
        let mut lost = Vec::new();
        self.last_seen.retain(|id, (device_id, seen)| {
            let fresh = now.saturating_duration_since(*seen) <= stale_after;
            if !fresh {
                debug!(id = %id, "BLE device went stale");
                lost.push(DiscoveryEvent::DeviceLost(*device_id));
            }
            fresh
        });
        lost
    }

    /// Number of tracked devices
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    /// Forget every candidate
    pub fn clear(&mut self) {
        self.last_seen.clear();
    }
}

/// Run one scan session until the consumer drops its stream
pub(crate) async fn run_scan(
    adapter: Arc<dyn BleAdapter>,
    config: BleConfig,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
) -> Result<()> {
    tokio::select! {
        powered = adapter.wait_until_powered_on() => powered?,
        _ = events.closed() => return Ok(()),
    }

    let mut sightings = adapter.scan(MESHTASTIC_SERVICE_UUID).await?;
    info!("BLE scan started");

    let mut tracker = DiscoveryTracker::new(config.stale_after);
    let mut sweep = tokio::time::interval_at(Instant::now() + config.sweep_interval, config.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            sighting = sightings.recv() => {
                let Some(adv) = sighting else {
                    warn!("BLE scan ended by adapter");
                    break;
                };
                if events.send(tracker.observe(&adv, Instant::now())).is_err() {
                    break;
                }
            }

            _ = sweep.tick() => {
                let lost = tracker.sweep(Instant::now());
                if lost.into_iter().any(|event| events.send(event).is_err()) {
                    break;
                }
            }

            _ = events.closed() => break,
        }
    }

    tracker.clear();
    if let Err(e) = adapter.stop_scan().await {
        debug!(error = %e, "Stopping BLE scan failed");
    }
    info!("BLE scan stopped");
    Ok(())
}
