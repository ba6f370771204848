//! Session tests against an in-process mock receiver.
//!
//! The mock speaks the receiver's side of the protocol: it accepts the `sdr`
//! subprotocol, reports every text command it gets, and pushes binary frames
//! or closes the connection when told to.

use futures_util::{SinkExt, StreamExt};
use sdr_remote::buffer_queue::{self, BufferReader};
use sdr_remote::client::{Client, ClientHandle, SessionConfig};
use sdr_remote::commands::{Command, Mode};
use sdr_remote::connection::{ConnectionError, ConnectionState};
use sdr_remote::protocol::{encode_frame, StatusRecord};
use sdr_remote::SdrError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

const WAIT: Duration = Duration::from_secs(5);

enum ServerAction {
    Frame(Vec<u8>),
    /// Close with a proper close handshake
    Close,
    /// Drop the TCP connection without a close frame
    Drop,
}

struct MockReceiver {
    addr: SocketAddr,
    commands: mpsc::UnboundedReceiver<String>,
    actions: mpsc::UnboundedSender<ServerAction>,
}

impl MockReceiver {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (actions, mut action_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            // One connection at a time, like the receiver
            while let Ok((stream, _)) = listener.accept().await {
                let echo_protocol = |request: &Request,
                                     mut response: Response|
                 -> Result<Response, ErrorResponse> {
                    if let Some(protocol) = request.headers().get("Sec-WebSocket-Protocol") {
                        response
                            .headers_mut()
                            .insert("Sec-WebSocket-Protocol", protocol.clone());
                    }
                    Ok(response)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, echo_protocol).await
                else {
                    continue;
                };
                let (mut write, mut read) = ws.split();

                loop {
                    tokio::select! {
                        message = read.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                let _ = command_tx.send(text.as_str().to_string());
                            }
                            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                            Some(Ok(_)) => {}
                        },
                        action = action_rx.recv() => match action {
                            Some(ServerAction::Frame(data)) => {
                                if write.send(Message::Binary(data.into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(ServerAction::Close) => {
                                let _ = write.close().await;
                                // Let the client answer the close frame
                                while let Some(Ok(_)) = read.next().await {}
                                break;
                            }
                            Some(ServerAction::Drop) | None => break,
                        },
                    }
                }
            }
        });

        Self {
            addr,
            commands,
            actions,
        }
    }

    fn endpoint(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn send(&self, action: ServerAction) {
        self.actions.send(action).unwrap();
    }

    async fn next_command(&mut self) -> String {
        tokio::time::timeout(WAIT, self.commands.recv())
            .await
            .expect("timed out waiting for a command")
            .expect("mock receiver stopped")
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start_client(buffer_size: usize) -> (Client, ClientHandle, BufferReader) {
    init_logging();
    let (writer, reader) = buffer_queue::channel(buffer_size, 16);
    let client = Client::spawn(SessionConfig::default(), writer, None);
    let handle = client.handle();
    (client, handle, reader)
}

async fn wait_for_state(handle: &ClientHandle, expected: ConnectionState) {
    let mut state = handle.subscribe_state();
    tokio::time::timeout(WAIT, state.wait_for(|state| *state == expected))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", expected))
        .unwrap();
}

async fn wait_for_ready(reader: &BufferReader, count: usize) {
    tokio::time::timeout(WAIT, async {
        while reader.ready_count() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for audio buffers");
}

async fn connected(
    receiver: &mut MockReceiver,
    buffer_size: usize,
) -> (Client, ClientHandle, BufferReader) {
    let (client, handle, reader) = start_client(buffer_size);
    handle.connect(&receiver.endpoint()).await.unwrap();
    wait_for_state(&handle, ConnectionState::Connected).await;
    assert_eq!(receiver.next_command().await, "-f 90700000");
    (client, handle, reader)
}

#[tokio::test]
async fn test_initial_tuning_on_open() {
    let mut receiver = MockReceiver::start().await;
    let (client, handle, _reader) = start_client(4);
    assert_eq!(handle.state(), ConnectionState::Unknown);

    handle.connect(&receiver.endpoint()).await.unwrap();
    wait_for_state(&handle, ConnectionState::Connected).await;

    assert_eq!(receiver.next_command().await, "-f 90700000");
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_commands_are_sent_verbatim() {
    let mut receiver = MockReceiver::start().await;
    let (client, handle, _reader) = connected(&mut receiver, 4).await;

    handle.send(Command::SetMode(Mode::Am)).await.unwrap();
    handle.send(Command::SetFrequency(1_010_000)).await.unwrap();
    handle.send(Command::seek("up").unwrap()).await.unwrap();

    assert_eq!(receiver.next_command().await, "-m am");
    assert_eq!(receiver.next_command().await, "-f 1010000");
    assert_eq!(receiver.next_command().await, "-s up");
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_frames_fill_queue_and_publish_status() {
    let mut receiver = MockReceiver::start().await;
    let (client, handle, mut reader) = connected(&mut receiver, 4).await;
    let mut status = handle.subscribe_status();

    let record = StatusRecord {
        center_frequency_hz: 90_700_000,
        sample_rate_hz: 1_000_000,
        mode: "fm".to_string(),
        signal_to_noise_ratio: 14.5,
        ..Default::default()
    };
    let pcm: Vec<i16> = (1..=10).map(|n| n * 1000).collect();
    receiver.send(ServerAction::Frame(encode_frame(Some(&record), &pcm).unwrap()));

    // 10 samples in buffers of 4: two complete, two left in the partial
    wait_for_ready(&reader, 2).await;
    let first = reader.take_one().unwrap();
    assert_eq!(first.len(), 4);
    assert!((first[0] - 1000.0 / 32767.0).abs() < 1e-6);
    let second = reader.take_one().unwrap();
    assert!((second[3] - 8000.0 / 32767.0).abs() < 1e-6);
    assert!(reader.take_one().is_none());

    let update = tokio::time::timeout(WAIT, status.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap()
        .clone()
        .unwrap();
    assert_eq!(update.record.center_frequency_hz, 90_700_000);
    assert_eq!(update.record.mode, "fm");

    let stats = handle.stats();
    assert_eq!(stats.frames(), 1);
    assert_eq!(stats.samples(), 10);
    assert_eq!(stats.decode_faults(), 0);
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bad_metadata_keeps_samples() {
    let mut receiver = MockReceiver::start().await;
    let (client, handle, reader) = connected(&mut receiver, 2).await;

    let mut frame = 3u32.to_le_bytes().to_vec();
    frame.extend_from_slice(b"{x}");
    frame.extend_from_slice(&[0x00, 0x40, 0x00, 0xc0]);
    receiver.send(ServerAction::Frame(frame));

    // A frame too short for its header is dropped outright
    receiver.send(ServerAction::Frame(vec![0x01, 0x00]));

    wait_for_ready(&reader, 1).await;
    tokio::time::timeout(WAIT, async {
        while handle.stats().decode_faults() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(handle.subscribe_status().borrow().is_none());
    assert_eq!(handle.stats().samples(), 2);
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_send_requires_connection() {
    let (client, handle, _reader) = start_client(4);

    let result = handle.send(Command::SetFrequency(90_700_000)).await;
    assert!(matches!(
        result,
        Err(SdrError::Connection(ConnectionError::NotConnected(
            ConnectionState::Unknown
        )))
    ));
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_endpoint_keeps_state() {
    let (client, handle, _reader) = start_client(4);

    for endpoint in ["http://radio:8080", "ws://my-radio:8080", "radio:8080", ""] {
        let result = handle.connect(endpoint).await;
        assert!(
            matches!(
                result,
                Err(SdrError::Connection(ConnectionError::InvalidEndpoint(_)))
            ),
            "{endpoint:?} should be rejected"
        );
    }
    assert_eq!(handle.state(), ConnectionState::Unknown);
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refused_connection_ends_in_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (client, handle, _reader) = start_client(4);
    handle.connect(&format!("ws://{}", addr)).await.unwrap();
    wait_for_state(&handle, ConnectionState::Error).await;

    // The close that follows the error must not move us to disconnected
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.state(), ConnectionState::Error);

    // Error allows a new attempt
    let receiver = MockReceiver::start().await;
    handle.connect(&receiver.endpoint()).await.unwrap();
    wait_for_state(&handle, ConnectionState::Connected).await;
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_user_disconnect_resets_queue() {
    let mut receiver = MockReceiver::start().await;
    let (client, handle, reader) = connected(&mut receiver, 2).await;

    receiver.send(ServerAction::Frame(encode_frame(None, &[1, 2, 3, 4, 5, 6]).unwrap()));
    wait_for_ready(&reader, 3).await;

    handle.disconnect().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert_eq!(reader.ready_count(), 0);

    let result = handle.send(Command::SetFrequency(1)).await;
    assert!(matches!(
        result,
        Err(SdrError::Connection(ConnectionError::NotConnected(
            ConnectionState::Disconnected
        )))
    ));

    // Disconnecting twice is refused
    assert!(handle.disconnect().await.is_err());

    handle.connect(&receiver.endpoint()).await.unwrap();
    wait_for_state(&handle, ConnectionState::Connected).await;
    assert_eq!(receiver.next_command().await, "-f 90700000");
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_close_disconnects() {
    let mut receiver = MockReceiver::start().await;
    let (client, handle, reader) = connected(&mut receiver, 2).await;

    receiver.send(ServerAction::Frame(encode_frame(None, &[1, 2, 3, 4]).unwrap()));
    wait_for_ready(&reader, 2).await;

    receiver.send(ServerAction::Close);
    wait_for_state(&handle, ConnectionState::Disconnected).await;
    assert_eq!(reader.ready_count(), 0);
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dropped_connection_is_an_error() {
    let mut receiver = MockReceiver::start().await;
    let (client, handle, reader) = connected(&mut receiver, 2).await;

    receiver.send(ServerAction::Frame(encode_frame(None, &[1, 2]).unwrap()));
    wait_for_ready(&reader, 1).await;

    receiver.send(ServerAction::Drop);
    wait_for_state(&handle, ConnectionState::Error).await;
    assert_eq!(reader.ready_count(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.state(), ConnectionState::Error);
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_finalizes_recording() {
    init_logging();
    let mut receiver = MockReceiver::start().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.wav");

    let (writer, _reader) = buffer_queue::channel(4, 16);
    let recorder = sdr_remote::recorder::WavRecorder::create(&path, 48_000).unwrap();
    let client = Client::spawn(SessionConfig::default(), writer, Some(recorder));
    let handle = client.handle();

    handle.connect(&receiver.endpoint()).await.unwrap();
    wait_for_state(&handle, ConnectionState::Connected).await;
    assert_eq!(receiver.next_command().await, "-f 90700000");

    receiver.send(ServerAction::Frame(encode_frame(None, &[100, -100, 200]).unwrap()));
    tokio::time::timeout(WAIT, async {
        while handle.stats().samples() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    client.shutdown().await.unwrap();

    let mut wav = hound::WavReader::open(&path).unwrap();
    let samples: Vec<i16> = wav.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(samples, vec![100, -100, 200]);
}
