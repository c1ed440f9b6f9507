//! WiFi firmware update
//!
//! The phone opens a TCP listener first, then invites the device over UDP
//! to connect back to it. The invitation is rebroadcast until the device
//! answers `OK`, an `AUTH <nonce>` challenge swaps in an authenticated
//! payload, and the whole handshake is bounded by a timeout. Once the device
//! connects, the image is streamed in fixed-size chunks.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::invitation::{auth_hash, md5_hex, DeviceReply, Invitation};
use super::{OtaSession, OtaState, OtaStatus};
use crate::config::WifiOtaConfig;
use crate::error::{LinkError, Result};

const DATAGRAM_BUFFER: usize = 1024;

/// Pushes firmware to a device over the local network
#[derive(Debug)]
pub struct WifiOtaUpdater {
    config: WifiOtaConfig,
    session: OtaSession,
}

impl WifiOtaUpdater {
    /// Create an updater with the given settings
    pub fn new(config: WifiOtaConfig) -> Self {
        Self {
            config,
            session: OtaSession::new(),
        }
    }

    /// Status updates for the current or last session
    pub fn status(&self) -> watch::Receiver<OtaStatus> {
        self.session.subscribe()
    }

    /// Latest status snapshot
    pub fn current_status(&self) -> OtaStatus {
        self.session.current()
    }

    /// Cancel the running session
    ///
    /// Refused with [`LinkError::TransferInFlight`] once the image is being
    /// sent; a no-op when nothing is running.
    pub fn cancel(&self) -> Result<()> {
        self.session.cancel()
    }

    /// Run one update against `host`
    ///
    /// The listener and UDP socket are closed on every exit path before
    /// this returns.
    pub async fn run(&self, host: &str, firmware: &[u8], password: Option<&str>) -> Result<()> {
        let _run = self.session.start()?;
        info!(host, size = firmware.len(), "Starting WiFi OTA");

        match self.update(host, firmware, password).await {
            Ok(()) => {
                self.session.set_state(OtaState::Completed, "Success!");
                info!(host, "WiFi OTA complete");
                Ok(())
            }
            Err(e) => {
                self.session.fail(&e);
                Err(e)
            }
        }
    }

    async fn update(&self, host: &str, firmware: &[u8], password: Option<&str>) -> Result<()> {
        if firmware.is_empty() {
            return Err(LinkError::InvalidFirmware("image is empty".to_string()));
        }

        let device = resolve(host, self.config.device_port).await?;
        let listener = TcpListener::bind((self.config.bind_address, 0)).await?;
        let local_port = listener.local_addr()?.port();
        debug!(port = local_port, "Transfer listener bound");

        let invitation = Invitation::flash(local_port, firmware.len(), md5_hex(firmware));
        self.session
            .set_state(OtaState::WaitingForConnection, "Waiting for device. This can take a while...");

        {
            let socket = UdpSocket::bind(unspecified_for(&device)).await?;
            socket.connect(device).await?;
            self.handshake(&socket, invitation, password).await?;
        }

        self.session.set_state(OtaState::Connected, "Device accepted the update");
        let stream = self.accept(&listener).await?;
        drop(listener);

        self.transfer(stream, firmware).await
    }

    /// Broadcast, listen and time out concurrently; the first to finish wins
    async fn handshake(
        &self,
        socket: &UdpSocket,
        invitation: Invitation,
        password: Option<&str>,
    ) -> Result<()> {
        let (payload_tx, payload_rx) = watch::channel(invitation.to_bytes());
        let timeout = self.config.handshake_timeout;

        tokio::select! {
            result = self.broadcast(socket, payload_rx) => result,
            result = self.listen(socket, &invitation, password, &payload_tx) => {
                if result.is_ok() {
                    info!("Handshake OK received");
                }
                result
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Device did not answer the invitation");
                Err(LinkError::HandshakeTimeout {
                    duration_ms: timeout.as_millis() as u64,
                })
            }
            _ = self.session.cancelled() => Err(LinkError::Cancelled),
        }
    }

    async fn broadcast(&self, socket: &UdpSocket, payload: watch::Receiver<Vec<u8>>) -> Result<()> {
        loop {
            let datagram = payload.borrow().clone();
            match socket.send(&datagram).await {
                Ok(_) => trace!(len = datagram.len(), "Sent invitation"),
                // Nothing is listening yet while the device reboots
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    trace!("Invitation refused")
                }
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    async fn listen(
        &self,
        socket: &UdpSocket,
        invitation: &Invitation,
        password: Option<&str>,
        payload: &watch::Sender<Vec<u8>>,
    ) -> Result<()> {
        let mut buf = [0u8; DATAGRAM_BUFFER];
        loop {
            let len = match socket.recv(&mut buf).await {
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                Err(e) => return Err(e.into()),
            };
            match DeviceReply::parse(&buf[..len]) {
                DeviceReply::Ok => return Ok(()),
                DeviceReply::Auth(nonce) => {
                    let password = password.ok_or(LinkError::AuthenticationRequired)?;
                    info!("Authentication challenge received");
                    let answered = invitation.clone().with_auth(auth_hash(password, &nonce));
                    payload.send_replace(answered.to_bytes());
                }
                DeviceReply::Erase => {
                    info!("Device is erasing the update partition");
                    self.session
                        .set_state(OtaState::Preparing, "Preparing flash partition...");
                }
                DeviceReply::Other(text) => debug!(reply = %text, "Ignoring datagram"),
            }
        }
    }

    async fn accept(&self, listener: &TcpListener) -> Result<TcpStream> {
        let timeout = self.config.accept_timeout;
        tokio::select! {
            accepted = tokio::time::timeout(timeout, listener.accept()) => {
                let (stream, peer) = accepted.map_err(|_| LinkError::ConnectionTimeout {
                    duration_ms: timeout.as_millis() as u64,
                })??;
                info!(peer = %peer, "Device connected for transfer");
                Ok(stream)
            }
            _ = self.session.cancelled() => Err(LinkError::Cancelled),
        }
    }

    async fn transfer(&self, mut stream: TcpStream, firmware: &[u8]) -> Result<()> {
        stream.set_nodelay(true)?;
        self.session
            .set_state(OtaState::Transferring, "Please stay on this screen while update completes...");

        let total = firmware.len();
        let every = self.config.progress_every_chunks.max(1);
        let mut sent = 0usize;
        for (index, chunk) in firmware.chunks(self.config.chunk_size.max(1)).enumerate() {
            stream.write_all(chunk).await?;
            sent += chunk.len();
            if (index + 1) % every == 0 {
                self.session.set_progress(100.0 * sent as f64 / total as f64);
            }
        }
        stream.flush().await?;
        self.session.set_progress(100.0);
        self.session.set_state(OtaState::Transferring, "Done...");
        debug!(bytes = sent, "Image sent");

        // Give the device time to act on the final bytes
        tokio::time::sleep(self.config.settle_delay).await;
        if let Err(e) = stream.shutdown().await {
            debug!(error = %e, "Transfer socket shutdown failed");
        }
        Ok(())
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| LinkError::ConnectionFailed(format!("cannot resolve {host}")))
}

fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    let ip = match peer {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}
