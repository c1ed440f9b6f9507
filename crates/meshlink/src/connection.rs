//! Connection abstraction and the actor plumbing shared by every transport
//!
//! Each open connection is owned by exactly one spawned task. Callers talk
//! to it through a [`ConnectionHandle`] (command channel in) and read from
//! an [`EventStream`] (event channel out). Every shutdown path, whether an
//! explicit `disconnect`, a socket failure, or the consumer dropping the
//! stream, is funnelled through that task, so only one terminal event can
//! ever be produced.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::device::TransportType;
use crate::error::{LinkError, Result};
use crate::event::{ConnectionEvent, EventStream};
use crate::message::RadioMessage;

/// Commands buffered between callers and a connection task
pub(crate) const COMMAND_BUFFER: usize = 64;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not yet connected
    Idle,
    /// Link establishment in progress
    Connecting,
    /// Receive loop running
    Streaming,
    /// Terminal event emitted
    Disconnected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Idle => write!(f, "idle"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Streaming => write!(f, "streaming"),
            LinkState::Disconnected => write!(f, "disconnected"),
        }
    }
}

pub(crate) type SharedLinkState = Arc<RwLock<LinkState>>;

pub(crate) fn shared_state() -> SharedLinkState {
    Arc::new(RwLock::new(LinkState::Idle))
}

/// An established, message-oriented channel to one device
#[async_trait]
pub trait Connection<Tx, Rx>: Send + Sync
where
    Tx: RadioMessage,
    Rx: RadioMessage,
{
    /// Medium this connection runs over
    fn transport_type(&self) -> TransportType;

    /// Establish the link and hand back its event stream
    ///
    /// Suspends until the link is ready or has failed.
    async fn connect(&mut self) -> Result<EventStream<ConnectionEvent<Rx>>>;

    /// Serialize and write one message; resolves once the write completes
    async fn send(&self, message: Tx) -> Result<()>;

    /// Tear the link down and emit one terminal event
    ///
    /// Safe to call repeatedly and from several tasks at once; calls after
    /// the first are no-ops.
    async fn disconnect(&self, error: Option<LinkError>, should_reconnect: bool) -> Result<()>;

    /// Whether the receive loop is running
    fn is_connected(&self) -> bool;
}

/// Commands accepted by a connection task
#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    /// Write one serialized message
    Send {
        payload: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Shut down with the given reason
    Disconnect {
        error: Option<LinkError>,
        should_reconnect: bool,
        reply: oneshot::Sender<()>,
    },
}

/// Caller-side handle to a connection task
#[derive(Debug, Clone)]
pub(crate) struct ConnectionHandle {
    command_tx: mpsc::Sender<ConnectionCommand>,
    state: SharedLinkState,
}

impl ConnectionHandle {
    pub(crate) fn new(command_tx: mpsc::Sender<ConnectionCommand>, state: SharedLinkState) -> Self {
        Self { command_tx, state }
    }

    /// Hand a serialized message to the task and wait for the write
    pub(crate) async fn send(&self, payload: Bytes) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(ConnectionCommand::Send { payload, reply })
            .await
            .map_err(|_| LinkError::NotConnected)?;
        rx.await.map_err(|_| LinkError::NotConnected)?
    }

    /// Ask the task to shut down; a task that already stopped counts as done
    pub(crate) async fn disconnect(&self, error: Option<LinkError>, should_reconnect: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let command = ConnectionCommand::Disconnect {
            error,
            should_reconnect,
            reply,
        };
        if self.command_tx.send(command).await.is_err() {
            trace!("Disconnect requested after connection task exited");
            return Ok(());
        }
        // A dropped reply means another path already shut the task down
        let _ = rx.await;
        Ok(())
    }

    pub(crate) fn is_connected(&self) -> bool {
        *self.state.read() == LinkState::Streaming
    }
}

/// Why a connection task is stopping
#[derive(Debug)]
pub(crate) struct Shutdown {
    pub error: Option<LinkError>,
    pub should_reconnect: bool,
    pub reply: Option<oneshot::Sender<()>>,
}

impl Shutdown {
    pub(crate) fn requested(
        error: Option<LinkError>,
        should_reconnect: bool,
        reply: oneshot::Sender<()>,
    ) -> Self {
        Self {
            error,
            should_reconnect,
            reply: Some(reply),
        }
    }

    pub(crate) fn failed(error: LinkError, should_reconnect: bool) -> Self {
        Self {
            error: Some(error),
            should_reconnect,
            reply: None,
        }
    }

    /// All handles dropped without an explicit disconnect
    pub(crate) fn abandoned() -> Self {
        Self {
            error: None,
            should_reconnect: false,
            reply: None,
        }
    }
}

/// Producer side of a connection's event stream
///
/// `finish` consumes the sink, so at most one terminal event can be sent.
#[derive(Debug)]
pub(crate) struct EventSink<M> {
    tx: mpsc::UnboundedSender<ConnectionEvent<M>>,
}

impl<M> EventSink<M> {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ConnectionEvent<M>>) -> Self {
        Self { tx }
    }

    /// Deliver a non-terminal event; `false` once the consumer is gone
    pub(crate) fn emit(&self, event: ConnectionEvent<M>) -> bool {
        debug_assert!(!event.is_terminal());
        self.tx.send(event).is_ok()
    }

    /// Resolves when the consumer drops the stream
    pub(crate) async fn closed(&self) {
        self.tx.closed().await
    }

    /// Emit the terminal event and close the stream
    pub(crate) fn finish(self, shutdown: Shutdown) {
        let Shutdown {
            error,
            should_reconnect,
            reply,
        } = shutdown;
        debug!(should_reconnect, error = ?error, "Connection finished");
        let event = ConnectionEvent::terminal(error, should_reconnect);
        let _ = self.tx.send(event);
        drop(self.tx);
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }
}
