//! Event types delivered to the link's single consumer

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::device::{Device, DeviceId};
use crate::error::LinkError;

/// One inbound occurrence on an open connection
///
/// `Data` and `LogMessage` may repeat. Exactly one of the remaining
/// variants ends the stream; nothing follows it.
#[derive(Debug)]
pub enum ConnectionEvent<M> {
    /// A decoded message from the radio
    Data(M),
    /// A line from the radio's debug log channel
    LogMessage(String),
    /// Clean shutdown
    Disconnected {
        /// Whether the orchestrator should re-establish the link
        should_reconnect: bool,
    },
    /// Failure after which a reconnect is desired
    Error(LinkError),
    /// Failure that should not be retried
    ErrorWithoutReconnect(LinkError),
}

impl<M> ConnectionEvent<M> {
    /// Build the terminal event for a shutdown reason
    pub fn terminal(error: Option<LinkError>, should_reconnect: bool) -> Self {
        match error {
            Some(err) if should_reconnect => ConnectionEvent::Error(err),
            Some(err) => ConnectionEvent::ErrorWithoutReconnect(err),
            None => ConnectionEvent::Disconnected { should_reconnect },
        }
    }

    /// Whether this event closes the stream
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ConnectionEvent::Data(_) | ConnectionEvent::LogMessage(_)
        )
    }

    /// Reconnect intent carried by a terminal event
    pub fn should_reconnect(&self) -> Option<bool> {
        match self {
            ConnectionEvent::Disconnected { should_reconnect } => Some(*should_reconnect),
            ConnectionEvent::Error(_) => Some(true),
            ConnectionEvent::ErrorWithoutReconnect(_) => Some(false),
            _ => None,
        }
    }
}

/// Change in the set of candidate devices during a discovery session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// First sighting of a device
    DeviceFound(Device),
    /// Fresher data for an already announced device
    DeviceUpdated(Device),
    /// A previously announced device went away
    DeviceLost(DeviceId),
}

impl DiscoveryEvent {
    /// Id of the device this event concerns
    pub fn device_id(&self) -> DeviceId {
        match self {
            DiscoveryEvent::DeviceFound(d) | DiscoveryEvent::DeviceUpdated(d) => d.id,
            DiscoveryEvent::DeviceLost(id) => *id,
        }
    }
}

/// Receiving half of an event channel
///
/// Dropping the stream tells the producer its consumer is gone.
#[derive(Debug)]
pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> EventStream<T> {
    /// Create a connected sender/stream pair
    pub fn channel() -> (mpsc::UnboundedSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Wait for the next event; `None` once the producer is done
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take an event if one is ready
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting events while still draining what is queued
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
