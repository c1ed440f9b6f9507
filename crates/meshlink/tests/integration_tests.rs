//! Integration tests for the radio link and firmware updaters
//!
//! These tests drive the public API end to end:
//! - TCP connections against a local listener playing the radio, including
//!   undecodable frames and reconnects
//! - Single terminal event under concurrent shutdown requests
//! - BLE connections, discovery and OTA against the in-memory adapter
//! - WiFi OTA against a local UDP socket playing the device

use meshlink::ota::ble::{OtaStatusCode, OTA_STATUS_UUID, OTA_WRITE_UUID};
use meshlink::ota::invitation::{auth_hash, md5_hex, sha256_hex};
use meshlink::transport::ble::{Notification, WriteKind, FROMNUM_UUID, LOGRADIO_UUID, TORADIO_UUID};
use meshlink::{
    encode_frame, manual_tcp_device, BleConfig, BleOtaConfig, BleOtaUpdater, BleTransport,
    Connection, ConnectionEvent, DiscoveryEvent, LinkError, MockAdapter, MockPeripheral, OtaState,
    RadioMessage, RawFrame, RecordingIdleTimer, TcpTransport, TransportType, WifiOtaConfig, WifiOtaUpdater,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

async fn next_event<M>(events: &mut meshlink::EventStream<ConnectionEvent<M>>) -> ConnectionEvent<M> {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event within timeout")
        .expect("stream still open")
}

fn frame(payload: &[u8]) -> Vec<u8> {
    encode_frame(payload).unwrap().to_vec()
}

#[derive(Clone, PartialEq, prost::Message)]
struct Telemetry {
    #[prost(uint32, tag = "1")]
    battery: u32,
}

// ============================================================================
// TCP Connections
// ============================================================================

async fn local_radio() -> (TcpListener, meshlink::Device) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let device = manual_tcp_device(&format!("127.0.0.1:{port}"), 4403).unwrap();
    (listener, device)
}

#[tokio::test]
async fn test_tcp_frames_survive_noise_and_split_reads() {
    let (listener, device) = local_radio().await;

    let radio = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut wire = b"boot log\r\n".to_vec();
        wire.extend(frame(b"first"));
        // Interrupted header, then a real frame
        wire.extend([0x94, 0x00]);
        wire.extend(frame(b"second"));

        let (head, tail) = wire.split_at(7);
        socket.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.write_all(tail).await.unwrap();

        let mut header = [0u8; 4];
        socket.read_exact(&mut header).await.unwrap();
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; len];
        socket.read_exact(&mut payload).await.unwrap();

        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await.unwrap();
        (header, payload)
    });

    let transport = TcpTransport::default();
    let mut connection = transport
        .connection_for::<RawFrame, RawFrame>(&device)
        .unwrap();
    let mut events = connection.connect().await.unwrap();
    assert!(connection.is_connected());
    assert_eq!(connection.transport_type(), TransportType::Tcp);

    match next_event(&mut events).await {
        ConnectionEvent::Data(frame) => assert_eq!(&frame.0[..], b"first"),
        other => panic!("unexpected {other:?}"),
    }
    match next_event(&mut events).await {
        ConnectionEvent::Data(frame) => assert_eq!(&frame.0[..], b"second"),
        other => panic!("unexpected {other:?}"),
    }

    connection.send(RawFrame::from(&b"ping"[..])).await.unwrap();
    connection.disconnect(None, false).await.unwrap();

    match next_event(&mut events).await {
        ConnectionEvent::Disconnected { should_reconnect } => assert!(!should_reconnect),
        other => panic!("unexpected {other:?}"),
    }
    assert!(events.recv().await.is_none());
    assert!(!connection.is_connected());

    let (header, payload) = radio.await.unwrap();
    assert_eq!(header, [0x94, 0xC3, 0x00, 0x04]);
    assert_eq!(payload, b"ping");
}

#[tokio::test]
async fn test_tcp_concurrent_disconnects_emit_one_terminal_event() {
    let (listener, device) = local_radio().await;
    let radio = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
    });

    let mut connection = TcpTransport::default()
        .connection_for::<RawFrame, RawFrame>(&device)
        .unwrap();
    let mut events = connection.connect().await.unwrap();
    let connection = Arc::new(connection);

    let mut tasks = Vec::new();
    for i in 0..8 {
        let connection = connection.clone();
        tasks.push(tokio::spawn(async move {
            let error = (i % 2 == 0).then(|| LinkError::Disconnected(format!("caller {i}")));
            connection.disconnect(error, i % 3 == 0).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let mut terminal = 0;
    while let Some(event) = tokio::time::timeout(WAIT, events.recv()).await.unwrap() {
        assert!(event.is_terminal(), "only terminal events expected, got {event:?}");
        terminal += 1;
    }
    assert_eq!(terminal, 1);

    // Later calls are no-ops
    connection.disconnect(None, false).await.unwrap();
    radio.await.unwrap();
}

#[tokio::test]
async fn test_tcp_peer_close_requests_reconnect() {
    let (listener, device) = local_radio().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(&frame(b"bye")).await.unwrap();
        // Dropping the socket closes the stream
    });

    let mut connection = TcpTransport::default()
        .connection_for::<RawFrame, RawFrame>(&device)
        .unwrap();
    let mut events = connection.connect().await.unwrap();

    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Data(_)));
    let terminal = next_event(&mut events).await;
    assert!(matches!(terminal, ConnectionEvent::Error(_)));
    assert_eq!(terminal.should_reconnect(), Some(true));
    assert!(events.recv().await.is_none());

    let result = connection.send(RawFrame::from(&b"late"[..])).await;
    assert!(matches!(result, Err(LinkError::NotConnected)));
}

#[tokio::test]
async fn test_tcp_undecodable_frame_ends_stream() {
    let (listener, device) = local_radio().await;
    let radio = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket
            .write_all(&frame(&Telemetry { battery: 64 }.encode_payload()))
            .await
            .unwrap();
        // Truncated varint
        socket.write_all(&frame(&[0x08, 0xFF, 0xFF])).await.unwrap();
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
    });

    let mut connection = TcpTransport::default()
        .connection_for::<Telemetry, Telemetry>(&device)
        .unwrap();
    let mut events = connection.connect().await.unwrap();

    match next_event(&mut events).await {
        ConnectionEvent::Data(msg) => assert_eq!(msg.battery, 64),
        other => panic!("unexpected {other:?}"),
    }
    let terminal = next_event(&mut events).await;
    assert!(matches!(terminal, ConnectionEvent::Error(_)));
    assert_eq!(terminal.should_reconnect(), Some(true));
    assert!(events.recv().await.is_none());

    tokio::time::timeout(WAIT, radio).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_tcp_reconnect_after_peer_close() {
    let (listener, device) = local_radio().await;
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);

        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(&frame(b"again")).await.unwrap();
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
    });

    let mut connection = TcpTransport::default()
        .connection_for::<RawFrame, RawFrame>(&device)
        .unwrap();
    let mut events = connection.connect().await.unwrap();
    assert!(next_event(&mut events).await.is_terminal());
    assert!(events.recv().await.is_none());

    let mut events = connection.connect().await.unwrap();
    match next_event(&mut events).await {
        ConnectionEvent::Data(frame) => assert_eq!(&frame.0[..], b"again"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(connection.is_connected());

    // A live connection still refuses a second connect
    let result = connection.connect().await;
    assert!(matches!(result, Err(LinkError::ConnectionFailed(_))));
    connection.disconnect(None, false).await.unwrap();
}

#[tokio::test]
async fn test_tcp_dropping_events_stops_the_connection() {
    let (listener, device) = local_radio().await;
    let radio = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await.unwrap();
    });

    let mut connection = TcpTransport::default()
        .connection_for::<RawFrame, RawFrame>(&device)
        .unwrap();
    let events = connection.connect().await.unwrap();
    drop(events);

    // The radio sees EOF once the connection task has released the socket
    tokio::time::timeout(WAIT, radio).await.unwrap().unwrap();
    tokio::time::timeout(WAIT, async {
        while connection.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_tcp_refused_connect_fails() {
    let (listener, device) = local_radio().await;
    drop(listener);

    let mut connection = TcpTransport::default()
        .connection_for::<RawFrame, RawFrame>(&device)
        .unwrap();
    let result = connection.connect().await;
    assert!(matches!(result, Err(LinkError::ConnectionFailed(_))));
    assert!(!connection.is_connected());
}

// ============================================================================
// BLE Connections
// ============================================================================

fn radio_with_adapter(id: &str) -> (Arc<MockPeripheral>, BleTransport) {
    let peripheral = Arc::new(MockPeripheral::radio(id).with_name("radio"));
    let adapter = Arc::new(MockAdapter::new());
    adapter.add_peripheral(Some("radio"), peripheral.clone());
    (peripheral, BleTransport::new(adapter, BleConfig::default()))
}

fn ble_device(id: &str) -> meshlink::Device {
    meshlink::Device::new(
        meshlink::transport::ble::peripheral_device_id(id),
        "radio",
        TransportType::Ble,
        id,
    )
}

#[tokio::test]
async fn test_ble_connection_drains_mailbox() {
    let (peripheral, transport) = radio_with_adapter("AA:BB:CC:DD:EE:01");
    peripheral.queue_read(b"queued-1".to_vec());
    peripheral.queue_read(b"queued-2".to_vec());

    let mut connection = transport
        .connection_for::<RawFrame, RawFrame>(&ble_device("AA:BB:CC:DD:EE:01"))
        .unwrap();
    let mut events = connection.connect().await.unwrap();
    assert!(peripheral.is_subscribed(FROMNUM_UUID));
    assert!(peripheral.is_subscribed(LOGRADIO_UUID));

    // Whatever was waiting before the subscription is read straight away
    for expected in [&b"queued-1"[..], &b"queued-2"[..]] {
        match next_event(&mut events).await {
            ConnectionEvent::Data(frame) => assert_eq!(&frame.0[..], expected),
            other => panic!("unexpected {other:?}"),
        }
    }

    peripheral.queue_read(b"after-notify".to_vec());
    assert!(peripheral.notify(FROMNUM_UUID, vec![1, 0, 0, 0]));
    match next_event(&mut events).await {
        ConnectionEvent::Data(frame) => assert_eq!(&frame.0[..], b"after-notify"),
        other => panic!("unexpected {other:?}"),
    }

    assert!(peripheral.notify(LOGRADIO_UUID, b"INFO  | booted".to_vec()));
    match next_event(&mut events).await {
        ConnectionEvent::LogMessage(line) => assert_eq!(line, "INFO  | booted"),
        other => panic!("unexpected {other:?}"),
    }

    connection.send(RawFrame::from(&b"to-radio"[..])).await.unwrap();
    let writes = peripheral.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].characteristic, TORADIO_UUID);
    assert_eq!(writes[0].data, b"to-radio");
    assert_eq!(writes[0].kind, WriteKind::WithResponse);

    connection.disconnect(None, false).await.unwrap();
    match next_event(&mut events).await {
        ConnectionEvent::Disconnected { should_reconnect } => assert!(!should_reconnect),
        other => panic!("unexpected {other:?}"),
    }
    assert!(events.recv().await.is_none());
    assert_eq!(peripheral.unsubscribe_count(), 2);
    assert!(peripheral.is_disconnected());
}

#[tokio::test]
async fn test_ble_link_drop_requests_reconnect() {
    let (peripheral, transport) = radio_with_adapter("AA:BB:CC:DD:EE:02");
    let mut connection = transport
        .connection_for::<RawFrame, RawFrame>(&ble_device("AA:BB:CC:DD:EE:02"))
        .unwrap();
    let mut events = connection.connect().await.unwrap();

    peripheral.drop_link();
    let terminal = next_event(&mut events).await;
    assert!(matches!(terminal, ConnectionEvent::Error(LinkError::Disconnected(_))));
    assert!(events.recv().await.is_none());
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_ble_reconnect_after_link_drop() {
    let (peripheral, transport) = radio_with_adapter("AA:BB:CC:DD:EE:05");
    let mut connection = transport
        .connection_for::<RawFrame, RawFrame>(&ble_device("AA:BB:CC:DD:EE:05"))
        .unwrap();
    let mut events = connection.connect().await.unwrap();

    peripheral.drop_link();
    assert!(next_event(&mut events).await.is_terminal());
    assert!(events.recv().await.is_none());

    peripheral.queue_read(b"after-reconnect".to_vec());
    let mut events = connection.connect().await.unwrap();
    match next_event(&mut events).await {
        ConnectionEvent::Data(frame) => assert_eq!(&frame.0[..], b"after-reconnect"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(connection.is_connected());
    connection.disconnect(None, false).await.unwrap();
}

#[tokio::test]
async fn test_ble_undecodable_payload_ends_stream() {
    let (peripheral, transport) = radio_with_adapter("AA:BB:CC:DD:EE:03");
    let mut connection = transport
        .connection_for::<Telemetry, Telemetry>(&ble_device("AA:BB:CC:DD:EE:03"))
        .unwrap();
    let mut events = connection.connect().await.unwrap();

    peripheral.queue_read(Telemetry { battery: 87 }.encode_payload());
    peripheral.notify(FROMNUM_UUID, vec![1]);
    match next_event(&mut events).await {
        ConnectionEvent::Data(msg) => assert_eq!(msg.battery, 87),
        other => panic!("unexpected {other:?}"),
    }

    // Truncated varint
    peripheral.queue_read(vec![0x08, 0xFF, 0xFF]);
    peripheral.notify(FROMNUM_UUID, vec![2]);
    let terminal = next_event(&mut events).await;
    assert!(terminal.is_terminal());
    assert_eq!(terminal.should_reconnect(), Some(true));
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn test_ble_missing_characteristic_rejected() {
    let peripheral = Arc::new(MockPeripheral::new("AA:BB:CC:DD:EE:04").with_service(
        meshlink::transport::ble::MESHTASTIC_SERVICE_UUID,
        vec![TORADIO_UUID, FROMNUM_UUID],
    ));
    let adapter = Arc::new(MockAdapter::new());
    adapter.add_peripheral(None, peripheral.clone());
    let transport = BleTransport::new(adapter, BleConfig::default());

    let mut connection = transport
        .connection_for::<RawFrame, RawFrame>(&ble_device("AA:BB:CC:DD:EE:04"))
        .unwrap();
    let result = connection.connect().await;
    assert!(matches!(result, Err(LinkError::CharacteristicMissing(_))));
    assert!(peripheral.is_disconnected());
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_ble_discovery_reports_found_then_updated() {
    let peripheral = Arc::new(MockPeripheral::radio("AA:BB:CC:DD:EE:05"));
    let adapter = Arc::new(MockAdapter::new());
    adapter.add_peripheral(Some("Meshtastic_ee05"), peripheral);
    let transport = BleTransport::new(adapter.clone(), BleConfig::default());

    let mut events = transport.discover_devices().unwrap();
    let found = match tokio::time::timeout(WAIT, events.recv()).await.unwrap() {
        Some(DiscoveryEvent::DeviceFound(device)) => device,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(found.name, "Meshtastic_ee05");
    assert_eq!(found.transport_type, TransportType::Ble);
    assert_eq!(found.rssi, Some(-60));

    assert!(adapter.advertise(meshlink::transport::ble::Advertisement {
        id: "AA:BB:CC:DD:EE:05".to_string(),
        name: Some("Meshtastic_ee05".to_string()),
        rssi: Some(-42),
    }));
    match tokio::time::timeout(WAIT, events.recv()).await.unwrap() {
        Some(DiscoveryEvent::DeviceUpdated(device)) => {
            assert_eq!(device.id, found.id);
            assert_eq!(device.rssi, Some(-42));
        }
        other => panic!("unexpected {other:?}"),
    }

    drop(events);
    tokio::time::timeout(WAIT, async {
        while adapter.stop_scan_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(adapter.scan_count(), 1);
}

// ============================================================================
// BLE Firmware Update
// ============================================================================

fn status(code: OtaStatusCode) -> Notification {
    Notification {
        characteristic: OTA_STATUS_UUID,
        value: vec![code as u8],
    }
}

/// Device side of the update: erase, then acknowledge each chunk
fn emulated_ota_device(
    received: Arc<Mutex<Vec<u8>>>,
    invitations: Arc<Mutex<Vec<String>>>,
    fail_first_chunk: bool,
) -> impl FnMut(Uuid, &[u8]) -> Vec<Notification> + Send + 'static {
    let mut expected: Option<usize> = None;
    move |characteristic, data| {
        if characteristic != OTA_WRITE_UUID {
            return Vec::new();
        }
        match expected {
            None => {
                let text = String::from_utf8_lossy(data).to_string();
                expected = text.split_whitespace().nth(2).and_then(|s| s.parse().ok());
                invitations.lock().unwrap().push(text);
                vec![
                    status(OtaStatusCode::ErasingFlash),
                    status(OtaStatusCode::ReadyForChunk),
                ]
            }
            Some(_) if fail_first_chunk => vec![status(OtaStatusCode::Error)],
            Some(size) => {
                let mut buf = received.lock().unwrap();
                buf.extend_from_slice(data);
                if buf.len() >= size {
                    vec![status(OtaStatusCode::OtaComplete)]
                } else {
                    vec![status(OtaStatusCode::ChunkAck)]
                }
            }
        }
    }
}

fn firmware(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

#[tokio::test]
async fn test_ble_ota_full_transfer() {
    let image = firmware(1000);
    let received = Arc::new(Mutex::new(Vec::new()));
    let invitations = Arc::new(Mutex::new(Vec::new()));

    let peripheral = Arc::new(
        MockPeripheral::ota_device("AA:BB:CC:DD:EE:10")
            .with_max_write_len(103)
            .on_write(emulated_ota_device(received.clone(), invitations.clone(), false)),
    );
    let adapter = Arc::new(MockAdapter::new());
    adapter.add_peripheral(Some("radio-ota"), peripheral.clone());
    let timer = Arc::new(RecordingIdleTimer::default());

    let updater =
        BleOtaUpdater::new(adapter.clone(), BleOtaConfig::default()).with_idle_timer(timer.clone());
    updater.run(&image).await.unwrap();

    assert_eq!(*received.lock().unwrap(), image);
    assert_eq!(
        invitations.lock().unwrap().as_slice(),
        [format!("0 0 1000 {}", sha256_hex(&image))]
    );

    let writes = peripheral.writes();
    // Invitation plus ten chunks of at most 100 bytes
    assert_eq!(writes.len(), 11);
    assert!(writes[1..].iter().all(|w| w.data.len() <= 100));
    assert!(writes.iter().all(|w| w.kind == WriteKind::WithoutResponse));

    let status = updater.current_status();
    assert_eq!(status.state, OtaState::Completed);
    assert_eq!(status.progress, 100.0);
    assert_eq!(status.device_name.as_deref(), Some("radio-ota"));

    assert_eq!(timer.calls(), vec![true, false]);
    assert_eq!(adapter.stop_scan_count(), 1);
    assert_eq!(peripheral.unsubscribe_count(), 1);
    assert!(peripheral.is_disconnected());
}

#[tokio::test]
async fn test_ble_ota_device_error() {
    let peripheral = Arc::new(MockPeripheral::ota_device("AA:BB:CC:DD:EE:11").on_write(
        emulated_ota_device(Arc::default(), Arc::default(), true),
    ));
    let adapter = Arc::new(MockAdapter::new());
    adapter.add_peripheral(Some("radio-ota"), peripheral.clone());
    let timer = Arc::new(RecordingIdleTimer::default());

    let updater = BleOtaUpdater::new(adapter, BleOtaConfig::default()).with_idle_timer(timer.clone());
    let result = updater.run(&firmware(2000)).await;

    assert!(matches!(result, Err(LinkError::DeviceReportedError)));
    // Invitation and the one chunk the device rejected
    assert_eq!(peripheral.writes().len(), 2);
    assert_eq!(updater.current_status().state, OtaState::Error);
    assert_eq!(timer.calls(), vec![true, false]);
    assert!(peripheral.is_disconnected());
}

#[tokio::test]
async fn test_ble_ota_scan_timeout() {
    let adapter = Arc::new(MockAdapter::new());
    let config = BleOtaConfig {
        scan_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let updater = BleOtaUpdater::new(adapter.clone(), config);

    let result = updater.run(&firmware(10)).await;
    assert!(matches!(result, Err(LinkError::ScanTimeout { .. })));
    assert_eq!(adapter.stop_scan_count(), 1);
    assert_eq!(updater.current_status().state, OtaState::Error);
}

#[tokio::test]
async fn test_ble_ota_link_loss_mid_transfer() {
    // The device never answers, so the updater sits waiting for status
    let peripheral = Arc::new(MockPeripheral::ota_device("AA:BB:CC:DD:EE:12"));
    let adapter = Arc::new(MockAdapter::new());
    adapter.add_peripheral(Some("radio-ota"), peripheral.clone());
    let updater = Arc::new(BleOtaUpdater::new(adapter, BleOtaConfig::default()));

    let run = {
        let updater = updater.clone();
        tokio::spawn(async move { updater.run(&firmware(500)).await })
    };

    tokio::time::timeout(WAIT, async {
        while peripheral.writes().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    peripheral.drop_link();

    let result = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
    assert!(matches!(result, Err(LinkError::Disconnected(_))));
    assert!(peripheral.is_disconnected());
}

#[tokio::test]
async fn test_ble_ota_cancel_while_waiting_for_device() {
    let peripheral = Arc::new(MockPeripheral::ota_device("AA:BB:CC:DD:EE:13"));
    let adapter = Arc::new(MockAdapter::new());
    adapter.add_peripheral(Some("radio-ota"), peripheral.clone());
    let updater = Arc::new(BleOtaUpdater::new(adapter, BleOtaConfig::default()));

    let run = {
        let updater = updater.clone();
        tokio::spawn(async move { updater.run(&firmware(500)).await })
    };
    tokio::time::timeout(WAIT, async {
        while peripheral.writes().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    updater.cancel().unwrap();
    let result = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
    assert!(matches!(result, Err(LinkError::Cancelled)));
    assert!(peripheral.is_disconnected());
}

#[tokio::test]
async fn test_ble_ota_cancel_during_service_discovery() {
    let peripheral = Arc::new(
        MockPeripheral::ota_device("AA:BB:CC:DD:EE:14").with_latency(Duration::from_secs(30)),
    );
    let adapter = Arc::new(MockAdapter::new());
    adapter.add_peripheral(Some("radio-ota"), peripheral.clone());
    let updater = Arc::new(BleOtaUpdater::new(adapter, BleOtaConfig::default()));

    let run = {
        let updater = updater.clone();
        tokio::spawn(async move { updater.run(&firmware(500)).await })
    };
    tokio::time::timeout(WAIT, async {
        while updater.current_status().state != OtaState::Connected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    updater.cancel().unwrap();
    let result = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
    assert!(matches!(result, Err(LinkError::Cancelled)));
    assert!(peripheral.writes().is_empty());
    assert!(peripheral.is_disconnected());
}

// ============================================================================
// WiFi Firmware Update
// ============================================================================

async fn fake_device() -> (UdpSocket, WifiOtaConfig) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = WifiOtaConfig {
        device_port: socket.local_addr().unwrap().port(),
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        retry_interval: Duration::from_millis(50),
        handshake_timeout: Duration::from_secs(3),
        accept_timeout: Duration::from_secs(3),
        settle_delay: Duration::from_millis(10),
        ..Default::default()
    };
    (socket, config)
}

async fn recv_invitation(socket: &UdpSocket) -> (Vec<String>, std::net::SocketAddr) {
    let mut buf = [0u8; 512];
    let (len, from) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let fields = String::from_utf8_lossy(&buf[..len])
        .split_whitespace()
        .map(str::to_string)
        .collect();
    (fields, from)
}

#[tokio::test]
async fn test_wifi_ota_with_authentication() {
    let image = firmware(1460 * 25 + 17);
    let (socket, config) = fake_device().await;

    let expected = image.clone();
    let device = tokio::spawn(async move {
        let (first, phone) = recv_invitation(&socket).await;
        assert_eq!(first.len(), 4);
        assert_eq!(first[0], "0");
        assert_eq!(first[2], expected.len().to_string());
        assert_eq!(first[3], md5_hex(&expected));
        let port: u16 = first[1].parse().unwrap();

        socket.send_to(b"AUTH nonce123", phone).await.unwrap();
        let answered = loop {
            let (fields, _) = recv_invitation(&socket).await;
            if fields.len() == 5 {
                break fields;
            }
        };
        assert_eq!(answered[4], auth_hash("secret", "nonce123"));

        socket.send_to(b"ERASE", phone).await.unwrap();
        socket.send_to(b"OK", phone).await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        received
    });

    let updater = WifiOtaUpdater::new(config);
    updater.run("127.0.0.1", &image, Some("secret")).await.unwrap();

    let received = tokio::time::timeout(WAIT, device).await.unwrap().unwrap();
    assert_eq!(received, image);

    let status = updater.current_status();
    assert_eq!(status.state, OtaState::Completed);
    assert_eq!(status.progress, 100.0);
}

#[tokio::test]
async fn test_wifi_ota_erase_reports_preparing_before_transfer() {
    let image = firmware(4000);
    let (socket, mut config) = fake_device().await;
    // Keep Transferring visible long enough for the watcher
    config.settle_delay = Duration::from_millis(300);
    let updater = Arc::new(WifiOtaUpdater::new(config));
    let mut status = updater.status();

    let device = {
        let updater = updater.clone();
        tokio::spawn(async move {
            let (fields, phone) = recv_invitation(&socket).await;
            let port: u16 = fields[1].parse().unwrap();

            socket.send_to(b"ERASE", phone).await.unwrap();
            // Hold the OK until the erase has been reported
            tokio::time::timeout(WAIT, async {
                while updater.current_status().state != OtaState::Preparing {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
            socket.send_to(b"OK", phone).await.unwrap();

            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received.len()
        })
    };

    let watcher = tokio::spawn(async move {
        let mut seen = Vec::new();
        while status.changed().await.is_ok() {
            let state = status.borrow_and_update().state;
            if seen.last() != Some(&state) {
                seen.push(state);
            }
            if state == OtaState::Completed || state == OtaState::Error {
                break;
            }
        }
        seen
    });

    updater.run("127.0.0.1", &image, None).await.unwrap();
    assert_eq!(tokio::time::timeout(WAIT, device).await.unwrap().unwrap(), image.len());

    let seen = tokio::time::timeout(WAIT, watcher).await.unwrap().unwrap();
    let preparing = seen.iter().position(|s| *s == OtaState::Preparing).unwrap();
    let transferring = seen.iter().position(|s| *s == OtaState::Transferring).unwrap();
    assert!(preparing < transferring, "states seen: {seen:?}");
    assert_eq!(seen.last(), Some(&OtaState::Completed));
}

#[tokio::test]
async fn test_wifi_ota_auth_without_password_fails() {
    let (socket, config) = fake_device().await;
    tokio::spawn(async move {
        let (_, phone) = recv_invitation(&socket).await;
        socket.send_to(b"AUTH 77aa", phone).await.unwrap();
        // Keep the socket open until the updater gives up
        tokio::time::sleep(WAIT).await;
    });

    let updater = WifiOtaUpdater::new(config);
    let result = updater.run("127.0.0.1", &firmware(64), None).await;
    assert!(matches!(result, Err(LinkError::AuthenticationRequired)));
    assert_eq!(updater.current_status().state, OtaState::Error);
}

#[tokio::test]
async fn test_wifi_ota_handshake_timeout_closes_listener() {
    let (socket, mut config) = fake_device().await;
    config.handshake_timeout = Duration::from_millis(300);

    let silent = tokio::spawn(async move {
        let (fields, _) = recv_invitation(&socket).await;
        let port: u16 = fields[1].parse().unwrap();
        (socket, port)
    });

    let updater = WifiOtaUpdater::new(config);
    let result = updater.run("127.0.0.1", &firmware(64), None).await;
    assert!(matches!(result, Err(LinkError::HandshakeTimeout { .. })));

    let (_socket, port) = silent.await.unwrap();
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_wifi_ota_cancel_during_handshake() {
    let (socket, config) = fake_device().await;
    let updater = Arc::new(WifiOtaUpdater::new(config));

    let run = {
        let updater = updater.clone();
        tokio::spawn(async move { updater.run("127.0.0.1", &firmware(64), None).await })
    };

    // First invitation proves the handshake is underway
    let _ = recv_invitation(&socket).await;

    // A second session is refused while the first runs
    let second = updater.run("127.0.0.1", &firmware(64), None).await;
    assert!(matches!(second, Err(LinkError::UpdateInProgress)));

    updater.cancel().unwrap();
    let result = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
    assert!(matches!(result, Err(LinkError::Cancelled)));
}
