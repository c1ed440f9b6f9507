//! BLE connection to a radio's GATT API
//!
//! A `FROMNUM` notification means packets are waiting; the connection task
//! then reads `FROMRADIO` until it returns an empty value. Writes go to
//! `TORADIO`, and `LOGRADIO` notifications surface as log events.

use async_trait::async_trait;
use bytes::Bytes;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{
    characteristic_name, BleAdapter, BlePeripheral, Notification, WriteKind, FROMNUM_UUID,
    FROMRADIO_UUID, LOGRADIO_UUID, MESHTASTIC_SERVICE_UUID, TORADIO_UUID,
};
use crate::connection::{
    shared_state, Connection, ConnectionCommand, ConnectionHandle, EventSink, LinkState,
    SharedLinkState, Shutdown, COMMAND_BUFFER,
};
use crate::device::TransportType;
use crate::error::{LinkError, Result};
use crate::event::{ConnectionEvent, EventStream};
use crate::message::RadioMessage;

/// Connection to one radio over BLE
pub struct BleConnection<Tx, Rx> {
    adapter: Arc<dyn BleAdapter>,
    peripheral_id: String,
    state: SharedLinkState,
    handle: Option<ConnectionHandle>,
    _messages: PhantomData<fn(Tx) -> Rx>,
}

impl<Tx, Rx> BleConnection<Tx, Rx>
where
    Tx: RadioMessage,
    Rx: RadioMessage,
{
    /// Create an unconnected connection to the peripheral with `peripheral_id`
    pub fn new(adapter: Arc<dyn BleAdapter>, peripheral_id: impl Into<String>) -> Self {
        Self {
            adapter,
            peripheral_id: peripheral_id.into(),
            state: shared_state(),
            handle: None,
            _messages: PhantomData,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    /// Discover the radio service and subscribe to its notify channels
    async fn prepare(
        peripheral: &Arc<dyn BlePeripheral>,
    ) -> Result<(mpsc::Receiver<Notification>, bool)> {
        let services = peripheral.discover_services().await?;
        if !services.contains(&MESHTASTIC_SERVICE_UUID) {
            return Err(LinkError::ServiceMissing(MESHTASTIC_SERVICE_UUID.to_string()));
        }

        let characteristics = peripheral
            .discover_characteristics(MESHTASTIC_SERVICE_UUID)
            .await?;
        for required in [TORADIO_UUID, FROMRADIO_UUID, FROMNUM_UUID] {
            if !characteristics.contains(&required) {
                return Err(LinkError::CharacteristicMissing(
                    characteristic_name(&required).to_string(),
                ));
            }
        }
        let has_log = characteristics.contains(&LOGRADIO_UUID);

        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(FROMNUM_UUID).await?;
        if has_log {
            peripheral.subscribe(LOGRADIO_UUID).await?;
        }
        Ok((notifications, has_log))
    }
}

#[async_trait]
impl<Tx, Rx> Connection<Tx, Rx> for BleConnection<Tx, Rx>
where
    Tx: RadioMessage,
    Rx: RadioMessage,
{
    fn transport_type(&self) -> TransportType {
        TransportType::Ble
    }

    async fn connect(&mut self) -> Result<EventStream<ConnectionEvent<Rx>>> {
        if let Some(handle) = &self.handle {
            if handle.is_connected() {
                return Err(LinkError::ConnectionFailed("already connected".to_string()));
            }
            debug!(peripheral = %self.peripheral_id, "Replacing finished connection task");
            self.handle = None;
        }

        *self.state.write() = LinkState::Connecting;
        info!(peripheral = %self.peripheral_id, "Connecting to radio over BLE");

        let peripheral = match self.adapter.connect(&self.peripheral_id).await {
            Ok(p) => p,
            Err(e) => {
                *self.state.write() = LinkState::Idle;
                return Err(e);
            }
        };

        let (notifications, has_log) = match Self::prepare(&peripheral).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(peripheral = %self.peripheral_id, error = %e, "BLE setup failed");
                if let Err(e) = peripheral.disconnect().await {
                    debug!(error = %e, "Disconnect after failed setup");
                }
                *self.state.write() = LinkState::Idle;
                return Err(e);
            }
        };

        let (event_tx, events) = EventStream::channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        *self.state.write() = LinkState::Streaming;
        let actor = BleConnectionActor::<Rx> {
            peripheral,
            has_log,
            notifications,
            commands: command_rx,
            events: EventSink::new(event_tx),
            state: self.state.clone(),
        };
        tokio::spawn(actor.run());

        self.handle = Some(ConnectionHandle::new(command_tx, self.state.clone()));
        info!(peripheral = %self.peripheral_id, "BLE connection ready");
        Ok(events)
    }

    async fn send(&self, message: Tx) -> Result<()> {
        let handle = self.handle.as_ref().ok_or(LinkError::NotConnected)?;
        handle.send(Bytes::from(message.encode_payload())).await
    }

    async fn disconnect(&self, error: Option<LinkError>, should_reconnect: bool) -> Result<()> {
        match &self.handle {
            Some(handle) => handle.disconnect(error, should_reconnect).await,
            None => Ok(()),
        }
    }

    fn is_connected(&self) -> bool {
        self.handle
            .as_ref()
            .map(ConnectionHandle::is_connected)
            .unwrap_or(false)
    }
}

/// Whether a link failure should be followed by a reconnect attempt
///
/// Timeouts and drops (radio out of range, rebooted) are worth retrying;
/// protocol and permission errors are not.
fn reconnect_after(error: &LinkError) -> bool {
    matches!(
        error,
        LinkError::ConnectionTimeout { .. }
            | LinkError::Timeout
            | LinkError::Disconnected(_)
            | LinkError::NotConnected
    )
}

/// Task owning one connected peripheral
struct BleConnectionActor<Rx> {
    peripheral: Arc<dyn BlePeripheral>,
    has_log: bool,
    notifications: mpsc::Receiver<Notification>,
    commands: mpsc::Receiver<ConnectionCommand>,
    events: EventSink<Rx>,
    state: SharedLinkState,
}

impl<Rx: RadioMessage> BleConnectionActor<Rx> {
    async fn run(mut self) {
        // Packets may already be queued from before we subscribed
        let mut shutdown = self.drain().await;

        let shutdown = loop {
            if let Some(s) = shutdown.take() {
                break s;
            }
            tokio::select! {
                command = self.commands.recv() => {
                    shutdown = self.handle_command(command).await;
                }

                notification = self.notifications.recv() => {
                    shutdown = match notification {
                        Some(n) => self.handle_notification(n).await,
                        None => Some(Shutdown::failed(
                            LinkError::Disconnected("peripheral disconnected".to_string()),
                            true,
                        )),
                    };
                }

                _ = self.events.closed() => {
                    debug!("Event stream dropped by consumer");
                    shutdown = Some(Shutdown::failed(LinkError::EventStreamCancelled, true));
                }
            }
        };

        self.release().await;
        *self.state.write() = LinkState::Disconnected;
        info!(peripheral = %self.peripheral.id(), "BLE connection closed");
        self.events.finish(shutdown);
    }

    async fn release(&self) {
        let mut subscribed = vec![FROMNUM_UUID];
        if self.has_log {
            subscribed.push(LOGRADIO_UUID);
        }
        for characteristic in subscribed {
            if let Err(e) = self.peripheral.unsubscribe(characteristic).await {
                debug!(characteristic = characteristic_name(&characteristic), error = %e, "Unsubscribe failed");
            }
        }
        if let Err(e) = self.peripheral.disconnect().await {
            debug!(error = %e, "Peripheral disconnect failed");
        }
    }

    async fn handle_command(&mut self, command: Option<ConnectionCommand>) -> Option<Shutdown> {
        match command {
            Some(ConnectionCommand::Send { payload, reply }) => {
                match self
                    .peripheral
                    .write(TORADIO_UUID, &payload, WriteKind::WithResponse)
                    .await
                {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "TORADIO write failed");
                        let _ = reply.send(Err(LinkError::Disconnected(e.to_string())));
                        let reconnect = reconnect_after(&e);
                        Some(Shutdown::failed(e, reconnect))
                    }
                }
            }
            Some(ConnectionCommand::Disconnect {
                error,
                should_reconnect,
                reply,
            }) => {
                debug!(should_reconnect, "Disconnect requested");
                Some(Shutdown::requested(error, should_reconnect, reply))
            }
            None => Some(Shutdown::abandoned()),
        }
    }

    async fn handle_notification(&mut self, notification: Notification) -> Option<Shutdown> {
        trace!(
            characteristic = characteristic_name(&notification.characteristic),
            len = notification.value.len(),
            "Notification"
        );
        match notification.characteristic {
            c if c == FROMNUM_UUID => self.drain().await,
            c if c == LOGRADIO_UUID => {
                let line = String::from_utf8_lossy(&notification.value).into_owned();
                if self.events.emit(ConnectionEvent::LogMessage(line)) {
                    None
                } else {
                    Some(Shutdown::failed(LinkError::EventStreamCancelled, true))
                }
            }
            other => {
                debug!(characteristic = %other, "Ignoring notification");
                None
            }
        }
    }

    /// Read FROMRADIO until it comes back empty
    async fn drain(&mut self) -> Option<Shutdown> {
        loop {
            let value = match self.peripheral.read(FROMRADIO_UUID).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "FROMRADIO read failed");
                    let reconnect = reconnect_after(&e);
                    return Some(Shutdown::failed(e, reconnect));
                }
            };
            if value.is_empty() {
                trace!("FROMRADIO drained");
                return None;
            }
            match Rx::decode_payload(&value) {
                Ok(message) => {
                    if !self.events.emit(ConnectionEvent::Data(message)) {
                        return Some(Shutdown::failed(LinkError::EventStreamCancelled, true));
                    }
                }
                Err(e) => {
                    warn!(error = %e, len = value.len(), "Corrupt FROMRADIO packet");
                    return Some(Shutdown::failed(e, true));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_policy() {
        assert!(reconnect_after(&LinkError::ConnectionTimeout { duration_ms: 1 }));
        assert!(reconnect_after(&LinkError::Disconnected("gone".into())));
        assert!(!reconnect_after(&LinkError::Bluetooth("att error".into())));
        assert!(!reconnect_after(&LinkError::BluetoothUnavailable("off".into())));
    }
}
