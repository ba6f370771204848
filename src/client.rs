//! The receiver session.
//!
//! One tokio task owns the [`ConnectionMachine`], the queue's
//! [`BufferWriter`] and the WebSocket write half. Each connect attempt spawns
//! a reader task that forwards transport events and binary frames tagged with
//! the attempt id. Callers talk to the session through a [`ClientHandle`].

use crate::buffer_queue::BufferWriter;
use crate::commands::Command;
use crate::connection::{
    Action, AttemptId, ConnectionError, ConnectionMachine, ConnectionState, Endpoint,
    Transition, TransportEvent,
};
use crate::error::{Result, SdrError};
use crate::protocol::{self, StatusRecord};
use crate::recorder::WavRecorder;
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// WebSocket subprotocol spoken by the receiver.
pub const SUBPROTOCOL: &str = "sdr";

const INBOUND_CHANNEL_SIZE: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Tuned to as soon as a connection opens
    pub initial_frequency_hz: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_frequency_hz: crate::config::DEFAULT_INITIAL_FREQUENCY_HZ,
        }
    }
}

/// A status record and when it arrived.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub record: StatusRecord,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SessionStats {
    frames: AtomicU64,
    decode_faults: AtomicU64,
    discarded_frames: AtomicU64,
    samples: AtomicU64,
    dropped_buffers: AtomicU64,
}

impl SessionStats {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Frames whose metadata or structure could not be decoded
    pub fn decode_faults(&self) -> u64 {
        self.decode_faults.load(Ordering::Relaxed)
    }

    /// Frames that arrived while the pipeline was disabled
    pub fn discarded_frames(&self) -> u64 {
        self.discarded_frames.load(Ordering::Relaxed)
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Completed buffers dropped because the playback queue was full
    pub fn dropped_buffers(&self) -> u64 {
        self.dropped_buffers.load(Ordering::Relaxed)
    }
}

enum Request {
    Connect {
        endpoint: String,
        reply: oneshot::Sender<std::result::Result<(), ConnectionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<std::result::Result<(), ConnectionError>>,
    },
    Send {
        command: Command,
        reply: oneshot::Sender<std::result::Result<(), ConnectionError>>,
    },
    Shutdown,
}

enum Inbound {
    Opened(WsSink),
    Event(TransportEvent),
    Frame(Vec<u8>),
}

struct Transport {
    attempt: AttemptId,
    cancel: CancellationToken,
    sink: Option<WsSink>,
}

/// Cheap handle to a running session.
#[derive(Clone)]
pub struct ClientHandle {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
    status: watch::Receiver<Option<StatusUpdate>>,
    stats: Arc<SessionStats>,
}

impl ClientHandle {
    /// Validate `endpoint` and start connecting. Returns once the attempt has
    /// started; watch [`subscribe_state`](Self::subscribe_state) for the outcome.
    pub async fn connect(&self, endpoint: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Connect {
            endpoint: endpoint.to_string(),
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| SdrError::SessionClosed)??)
    }

    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Disconnect { reply }).await?;
        Ok(rx.await.map_err(|_| SdrError::SessionClosed)??)
    }

    /// Send a command; fails with `NotConnected` unless connected.
    pub async fn send(&self, command: Command) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Send { command, reply }).await?;
        Ok(rx.await.map_err(|_| SdrError::SessionClosed)??)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Option<StatusUpdate>> {
        self.status.clone()
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    async fn request(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| SdrError::SessionClosed)
    }
}

/// Owner of the session task.
pub struct Client {
    handle: ClientHandle,
    task: JoinHandle<Result<()>>,
}

impl Client {
    /// Spawn the session onto the current tokio runtime.
    pub fn spawn(
        config: SessionConfig,
        writer: BufferWriter,
        recorder: Option<WavRecorder>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Unknown);
        let (status_tx, status_rx) = watch::channel(None);
        let stats = Arc::new(SessionStats::default());

        let session = Session {
            config,
            machine: ConnectionMachine::new(),
            writer,
            recorder,
            transport: None,
            pipeline_enabled: false,
            requests: request_rx,
            inbound_tx,
            inbound_rx,
            state_tx,
            status_tx,
            stats: Arc::clone(&stats),
        };
        let task = tokio::spawn(session.run());

        Self {
            handle: ClientHandle {
                requests: request_tx,
                state: state_rx,
                status: status_rx,
                stats,
            },
            task,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Close any open connection, finalize the recording and stop the task.
    ///
    /// Fails when the recording could not be finalized.
    pub async fn shutdown(self) -> Result<()> {
        // The session may already be gone; either way we wait for it
        let _ = self.handle.requests.send(Request::Shutdown).await;
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Session: Task failed: {}", e);
                Err(SdrError::SessionClosed)
            }
        }
    }
}

struct Session {
    config: SessionConfig,
    machine: ConnectionMachine,
    writer: BufferWriter,
    recorder: Option<WavRecorder>,
    transport: Option<Transport>,
    pipeline_enabled: bool,
    requests: mpsc::Receiver<Request>,
    inbound_tx: mpsc::Sender<(AttemptId, Inbound)>,
    inbound_rx: mpsc::Receiver<(AttemptId, Inbound)>,
    state_tx: watch::Sender<ConnectionState>,
    status_tx: watch::Sender<Option<StatusUpdate>>,
    stats: Arc<SessionStats>,
}

impl Session {
    async fn run(mut self) -> Result<()> {
        log::debug!("Session: Started");
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle_request(request).await,
                },
                Some((attempt, inbound)) = self.inbound_rx.recv() => {
                    self.handle_inbound(attempt, inbound).await;
                }
            }
        }

        if self.machine.is_active() {
            if let Ok(transition) = self.machine.disconnect() {
                self.apply(transition).await;
            }
        } else if let Some(transport) = self.transport.take() {
            transport.cancel.cancel();
        }

        let finalized = match self.recorder.take() {
            Some(recorder) => recorder.finalize().map_err(|e| {
                log::error!("Session: Failed to finalize recording: {}", e);
                SdrError::from(e)
            }),
            None => Ok(()),
        };
        log::debug!("Session: Stopped");
        finalized
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect { endpoint, reply } => {
                let result = match self.machine.connect(&endpoint) {
                    Ok(transition) => {
                        self.apply(transition).await;
                        Ok(())
                    }
                    Err(e) => {
                        log::warn!("Session: Connect rejected: {}", e);
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            Request::Disconnect { reply } => {
                let result = match self.machine.disconnect() {
                    Ok(transition) => {
                        self.apply(transition).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Request::Send { command, reply } => {
                let _ = reply.send(self.send_command(command).await);
            }
            Request::Shutdown => {}
        }
    }

    async fn handle_inbound(&mut self, attempt: AttemptId, inbound: Inbound) {
        match inbound {
            Inbound::Opened(sink) => {
                match self.transport.as_mut() {
                    Some(transport) if transport.attempt == attempt => {
                        transport.sink = Some(sink);
                    }
                    _ => {
                        log::debug!("Session: Dropping transport of stale attempt {}", attempt);
                        return;
                    }
                }
                if let Some(transition) =
                    self.machine.on_transport_event(attempt, TransportEvent::Open)
                {
                    self.apply(transition).await;
                }
            }
            Inbound::Event(event) => {
                if let Some(transition) = self.machine.on_transport_event(attempt, event) {
                    self.apply(transition).await;
                }
                // Reader is gone; drop our write half so the socket closes
                let current = self.transport.as_ref().map(|t| t.attempt) == Some(attempt);
                if event == TransportEvent::Close && current {
                    if let Some(transport) = self.transport.take() {
                        transport.cancel.cancel();
                    }
                }
            }
            Inbound::Frame(data) => self.handle_frame(attempt, &data),
        }
    }

    fn handle_frame(&mut self, attempt: AttemptId, data: &[u8]) {
        if attempt != self.machine.attempt() || !self.pipeline_enabled {
            self.stats.discarded_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.stats.frames.fetch_add(1, Ordering::Relaxed);

        let frame = match protocol::decode_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.decode_faults.fetch_add(1, Ordering::Relaxed);
                log::warn!("Session: Dropping frame: {}", e);
                return;
            }
        };

        if let Some(fault) = &frame.metadata_fault {
            self.stats.decode_faults.fetch_add(1, Ordering::Relaxed);
            log::warn!("Session: Bad metadata, keeping samples: {}", fault);
        }

        if let Some(record) = frame.status {
            log::trace!("Session: Status {:?}", record);
            self.status_tx.send_replace(Some(StatusUpdate {
                record,
                received_at: Utc::now(),
            }));
        }

        if frame.samples.is_empty() {
            return;
        }
        self.stats
            .samples
            .fetch_add(frame.samples.len() as u64, Ordering::Relaxed);
        self.writer.append(&frame.samples);
        self.stats
            .dropped_buffers
            .store(self.writer.dropped_buffers(), Ordering::Relaxed);

        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.write(&frame.samples) {
                log::error!("Session: Recording failed, stopping it: {}", e);
                self.recorder = None;
            }
        }
    }

    async fn apply(&mut self, transition: Transition) {
        self.state_tx.send_replace(transition.to);

        for action in transition.actions {
            match action {
                Action::OpenTransport { attempt, endpoint } => {
                    self.open_transport(attempt, endpoint)
                }
                Action::CloseTransport => self.close_transport().await,
                Action::ResetQueue => self.writer.reset(),
                Action::SendInitialTuning => {
                    let command = Command::SetFrequency(self.config.initial_frequency_hz);
                    if let Err(e) = self.send_command(command).await {
                        log::warn!("Session: Initial tuning failed: {}", e);
                    }
                }
                Action::EnablePipeline => {
                    log::debug!("Session: Pipeline enabled");
                    self.pipeline_enabled = true;
                }
                Action::DisablePipeline => {
                    log::debug!("Session: Pipeline disabled");
                    self.pipeline_enabled = false;
                }
            }
        }
    }

    fn open_transport(&mut self, attempt: AttemptId, endpoint: Endpoint) {
        if let Some(previous) = self.transport.take() {
            previous.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        self.transport = Some(Transport {
            attempt,
            cancel: cancel.clone(),
            sink: None,
        });

        log::info!("Session: Connecting to {} (attempt {})", endpoint, attempt);
        let inbound = self.inbound_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Session: Reader for attempt {} cancelled", attempt);
                }
                _ = run_transport(attempt, endpoint, inbound) => {}
            }
        });
    }

    async fn close_transport(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };

        if let Some(mut sink) = transport.sink.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => log::debug!("Session: Transport closed"),
                Ok(Err(e)) => log::debug!("Session: Close handshake failed: {}", e),
                Err(_) => log::debug!("Session: Close handshake timed out"),
            }
        }
        transport.cancel.cancel();
    }

    async fn send_command(&mut self, command: Command) -> std::result::Result<(), ConnectionError> {
        if !self.machine.is_active() {
            return Err(ConnectionError::NotConnected(self.machine.state()));
        }
        let sink = self
            .transport
            .as_mut()
            .and_then(|transport| transport.sink.as_mut())
            .ok_or(ConnectionError::NotConnected(self.machine.state()))?;

        let text = command.encode();
        log::debug!("Session: Sending command '{}'", text);
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }
}

/// Connect and pump one transport until it ends.
///
/// Mirrors what a browser WebSocket reports: a failure surfaces as an error
/// followed by a close, a clean shutdown as a close alone.
async fn run_transport(
    attempt: AttemptId,
    endpoint: Endpoint,
    inbound: mpsc::Sender<(AttemptId, Inbound)>,
) {
    let emit = |item: Inbound| inbound.send((attempt, item));

    let stream = match open(&endpoint).await {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("Session: Failed to connect to {}: {}", endpoint, e);
            if emit(Inbound::Event(TransportEvent::Error)).await.is_ok() {
                let _ = emit(Inbound::Event(TransportEvent::Close)).await;
            }
            return;
        }
    };

    log::info!("Session: Connected to {}", endpoint);
    let (sink, mut read) = stream.split();
    if emit(Inbound::Opened(sink)).await.is_err() {
        return;
    }

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                if emit(Inbound::Frame(data.to_vec())).await.is_err() {
                    return;
                }
            }
            Ok(Message::Text(text)) => {
                log::debug!("Session: Ignoring text message: {}", text.as_str());
            }
            Ok(Message::Close(frame)) => {
                log::info!("Session: Server closed connection: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("Session: Transport error: {}", e);
                let _ = emit(Inbound::Event(TransportEvent::Error)).await;
                break;
            }
        }
    }

    let _ = emit(Inbound::Event(TransportEvent::Close)).await;
}

async fn open(endpoint: &Endpoint) -> std::result::Result<WsStream, ConnectionError> {
    let mut request = endpoint
        .url()
        .as_str()
        .into_client_request()
        .map_err(|e| ConnectionError::Transport(e.to_string()))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

    let (stream, _response) = connect_async(request)
        .await
        .map_err(|e| ConnectionError::Transport(e.to_string()))?;
    Ok(stream)
}
