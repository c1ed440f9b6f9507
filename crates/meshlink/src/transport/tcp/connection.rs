//! TCP connection to a radio's network API
//!
//! One spawned task owns the socket. It reads with a cancel-safe
//! `read_buf`, feeds a [`FrameDecoder`], and serves write/disconnect
//! commands between reads.

use async_trait::async_trait;
use bytes::Bytes;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{
    shared_state, Connection, ConnectionCommand, ConnectionHandle, EventSink, LinkState,
    SharedLinkState, Shutdown, COMMAND_BUFFER,
};
use crate::device::{ConnectionTarget, TransportType};
use crate::error::{LinkError, Result};
use crate::event::{ConnectionEvent, EventStream};
use crate::frame::{encode_frame, FrameDecoder};
use crate::message::RadioMessage;

/// Connection to one radio over TCP
pub struct TcpConnection<Tx, Rx> {
    target: ConnectionTarget,
    connect_timeout: Duration,
    state: SharedLinkState,
    handle: Option<ConnectionHandle>,
    _messages: PhantomData<fn(Tx) -> Rx>,
}

impl<Tx, Rx> TcpConnection<Tx, Rx>
where
    Tx: RadioMessage,
    Rx: RadioMessage,
{
    /// Create an unconnected connection to `target`
    pub fn new(target: ConnectionTarget, connect_timeout: Duration) -> Self {
        Self {
            target,
            connect_timeout,
            state: shared_state(),
            handle: None,
            _messages: PhantomData,
        }
    }

    /// Address this connection dials
    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Current lifecycle state
    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    async fn open_socket(&self) -> Result<TcpStream> {
        let dial = TcpStream::connect((self.target.host.as_str(), self.target.port));
        let stream = tokio::time::timeout(self.connect_timeout, dial)
            .await
            .map_err(|_| LinkError::ConnectionTimeout {
                duration_ms: self.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| LinkError::ConnectionFailed(format!("{}: {}", self.target, e)))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl<Tx, Rx> Connection<Tx, Rx> for TcpConnection<Tx, Rx>
where
    Tx: RadioMessage,
    Rx: RadioMessage,
{
    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    async fn connect(&mut self) -> Result<EventStream<ConnectionEvent<Rx>>> {
        if let Some(handle) = &self.handle {
            if handle.is_connected() {
                return Err(LinkError::ConnectionFailed("already connected".to_string()));
            }
            debug!(peer = %self.target, "Replacing finished connection task");
            self.handle = None;
        }

        *self.state.write() = LinkState::Connecting;
        info!(peer = %self.target, "Connecting to radio over TCP");

        let stream = match self.open_socket().await {
            Ok(stream) => stream,
            Err(e) => {
                *self.state.write() = LinkState::Idle;
                return Err(e);
            }
        };

        let (event_tx, events) = EventStream::channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (reader, writer) = stream.into_split();

        *self.state.write() = LinkState::Streaming;
        let actor = TcpConnectionActor::<Rx> {
            target: self.target.clone(),
            reader,
            writer,
            decoder: FrameDecoder::new(),
            commands: command_rx,
            events: EventSink::new(event_tx),
            state: self.state.clone(),
        };
        tokio::spawn(actor.run());

        self.handle = Some(ConnectionHandle::new(command_tx, self.state.clone()));
        info!(peer = %self.target, "TCP connection ready");
        Ok(events)
    }

    async fn send(&self, message: Tx) -> Result<()> {
        let handle = self.handle.as_ref().ok_or(LinkError::NotConnected)?;
        let frame = encode_frame(&message.encode_payload())?;
        handle.send(frame).await
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

/// Task owning the socket of one TCP connection
struct TcpConnectionActor<Rx> {
    target: ConnectionTarget,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    decoder: FrameDecoder,
    commands: mpsc::Receiver<ConnectionCommand>,
    events: EventSink<Rx>,
    state: SharedLinkState,
}

impl<Rx: RadioMessage> TcpConnectionActor<Rx> {
    async fn run(mut self) {
        let shutdown = loop {
            tokio::select! {
                command = self.commands.recv() => {
                    if let Some(shutdown) = self.handle_command(command).await {
                        break shutdown;
                    }
                }

                read = self.reader.read_buf(self.decoder.buffer_mut()) => {
                    if let Some(shutdown) = self.handle_read(read) {
                        break shutdown;
                    }
                }

                _ = self.events.closed() => {
                    debug!(peer = %self.target, "Event stream dropped by consumer");
                    break Shutdown::failed(LinkError::EventStreamCancelled, true);
                }
            }
        };

        // Release the socket before anyone hears about the shutdown
        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "Socket shutdown failed");
        }
        drop(self.reader);
        drop(self.writer);
        *self.state.write() = LinkState::Disconnected;
        info!(peer = %self.target, "TCP connection closed");
        self.events.finish(shutdown);
    }

    async fn handle_command(&mut self, command: Option<ConnectionCommand>) -> Option<Shutdown> {
        match command {
            Some(ConnectionCommand::Send { payload, reply }) => {
                match self.write_frame(&payload).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        None
                    }
                    Err(e) => {
                        warn!(peer = %self.target, error = %e, "Write failed");
                        let _ = reply.send(Err(LinkError::Disconnected(e.to_string())));
                        Some(Shutdown::failed(LinkError::Io(e), true))
                    }
                }
            }
            Some(ConnectionCommand::Disconnect {
                error,
                should_reconnect,
                reply,
            }) => {
                debug!(peer = %self.target, should_reconnect, "Disconnect requested");
                Some(Shutdown::requested(error, should_reconnect, reply))
            }
            None => Some(Shutdown::abandoned()),
        }
    }

    async fn write_frame(&mut self, frame: &Bytes) -> std::io::Result<()> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await
    }

    fn handle_read(&mut self, read: std::io::Result<usize>) -> Option<Shutdown> {
        match read {
            Ok(0) => {
                info!(peer = %self.target, "Peer closed the connection");
                Some(Shutdown::failed(
                    LinkError::Disconnected("connection closed by peer".to_string()),
                    true,
                ))
            }
            Ok(_) => {
                while let Some(payload) = self.decoder.next_frame() {
                    match Rx::decode_payload(&payload) {
                        Ok(message) => {
                            if !self.events.emit(ConnectionEvent::Data(message)) {
                                return Some(Shutdown::failed(LinkError::EventStreamCancelled, true));
                            }
                        }
                        Err(e) => {
                            warn!(peer = %self.target, error = %e, len = payload.len(), "Corrupt frame");
                            return Some(Shutdown::failed(e, true));
                        }
                    }
                }
                None
            }
            Err(e) => {
                warn!(peer = %self.target, error = %e, "Read failed");
                Some(Shutdown::failed(LinkError::Io(e), true))
            }
        }
    }
}
