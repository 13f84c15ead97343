//! Long-lived streaming connection with exponential reconnect backoff.
//!
//! The connector owns one background task. It connects, sends the main
//! channel subscription, then hands each text frame to a [`FrameHandler`] in
//! arrival order. Consecutive failures wait `min(base * 2^n, max)`; once the
//! streak exceeds `max_consecutive_failures` the connector stops for good and
//! the owner sees [`StopReason::BackoffExhausted`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use riina_core::{current_unix_timestamp_ms, write_text_atomic};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

pub const SUBSCRIBE_MAIN_CHANNEL: &str =
    r#"{"type":"connect","body":{"channel":"main","id":"main"}}"#;
pub const STREAM_HEALTH_FILE_NAME: &str = "stream-health.json";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect stream: {0}")]
    Connect(String),
    #[error("failed to subscribe to channel: {0}")]
    Handshake(String),
    #[error("stream read failed: {0}")]
    Read(String),
    #[error("stream closed by server ({})", .0.as_deref().unwrap_or("no reason"))]
    Closed(Option<String>),
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, TransportError>;
}

#[async_trait]
pub trait StreamSession: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;
    /// Next application text frame. Control frames are consumed internally.
    async fn next_frame(&mut self) -> Result<String, TransportError>;
    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    Handled,
    Malformed,
}

#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle_frame(&self, raw: &str) -> FrameDisposition;
}

/// Misskey streaming endpoint over tokio-tungstenite.
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, TransportError> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        Ok(Box::new(WebSocketSession { stream }))
    }
}

struct WebSocketSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamSession for WebSocketSession {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Text(text.to_string().into()))
            .await
            .map_err(|error| TransportError::Handshake(error.to_string()))
    }

    async fn next_frame(&mut self) -> Result<String, TransportError> {
        loop {
            let Some(message) = self.stream.next().await else {
                return Err(TransportError::Closed(None));
            };
            match message.map_err(|error| TransportError::Read(error.to_string()))? {
                WsMessage::Text(text) => return Ok(text.as_str().to_owned()),
                WsMessage::Binary(bytes) => {
                    return Ok(String::from_utf8_lossy(&bytes).into_owned())
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                WsMessage::Close(frame) => {
                    return Err(TransportError::Closed(
                        frame.map(|frame| frame.reason.as_str().to_owned()),
                    ))
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(error) = self.stream.close(None).await {
            debug!(error = %error, "stream close handshake failed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_consecutive_failures: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Wait before reconnecting after the `attempt`-th consecutive failure.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.min(31);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    BackoffExhausted { failures: u32, last_error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Connecting { attempt: u32 },
    Subscribed,
    Backoff { attempt: u32, delay: Duration },
    Stopped(StopReason),
}

impl ConnectorState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting { .. } => "connecting",
            Self::Subscribed => "subscribed",
            Self::Backoff { .. } => "backoff",
            Self::Stopped(_) => "stopped",
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHealthSnapshot {
    pub updated_unix_ms: u64,
    pub state: String,
    pub failure_streak: u32,
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub reconnects: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backoff_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Default)]
struct ControlSlot {
    cancel: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

pub struct StreamConnector {
    transport: Arc<dyn StreamTransport>,
    handler: Arc<dyn FrameHandler>,
    policy: ReconnectPolicy,
    health_path: Option<PathBuf>,
    state: Arc<watch::Sender<ConnectorState>>,
    control: Mutex<ControlSlot>,
}

impl StreamConnector {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        handler: Arc<dyn FrameHandler>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectorState::Idle);
        Self {
            transport,
            handler,
            policy,
            health_path: None,
            state: Arc::new(state),
            control: Mutex::new(ControlSlot::default()),
        }
    }

    /// Persist a [`StreamHealthSnapshot`] under `state_dir` on every transition.
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.health_path = Some(state_dir.into().join(STREAM_HEALTH_FILE_NAME));
        self
    }

    pub fn state(&self) -> ConnectorState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectorState> {
        self.state.subscribe()
    }

    pub fn start(&self) {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state.borrow().is_stopped() {
            warn!("stream connector already stopped; start ignored");
            return;
        }
        if control.task.is_some() {
            warn!("stream connector already running");
            return;
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let worker = ConnectorLoop {
            transport: self.transport.clone(),
            handler: self.handler.clone(),
            policy: self.policy,
            health_path: self.health_path.clone(),
            state: self.state.clone(),
            cancel: cancel_rx,
            health: StreamHealthSnapshot::default(),
        };
        control.cancel = Some(cancel_tx);
        control.task = Some(tokio::spawn(worker.run()));
    }

    /// Cancels the connection or backoff sleep and waits for the task to end.
    /// A frame already being handled finishes first.
    pub async fn stop(&self) {
        let (cancel, task) = {
            let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
            (control.cancel.take(), control.task.take())
        };
        if let Some(cancel) = cancel {
            let _ = cancel.send(true);
        }
        if let Some(task) = task {
            if let Err(error) = task.await {
                error!(error = %error, "stream connector task failed");
            }
        }
        if !self.state.borrow().is_stopped() {
            self.state
                .send_replace(ConnectorState::Stopped(StopReason::Requested));
        }
    }

    pub async fn wait_until_stopped(&self) -> StopReason {
        let mut receiver = self.state.subscribe();
        loop {
            if let ConnectorState::Stopped(reason) = &*receiver.borrow_and_update() {
                return reason.clone();
            }
            if receiver.changed().await.is_err() {
                return StopReason::Requested;
            }
        }
    }
}

enum SessionEnd {
    Cancelled,
    Failed(TransportError),
}

struct ConnectorLoop {
    transport: Arc<dyn StreamTransport>,
    handler: Arc<dyn FrameHandler>,
    policy: ReconnectPolicy,
    health_path: Option<PathBuf>,
    state: Arc<watch::Sender<ConnectorState>>,
    cancel: watch::Receiver<bool>,
    health: StreamHealthSnapshot,
}

impl ConnectorLoop {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        loop {
            if *self.cancel.borrow() {
                break;
            }
            self.transition(ConnectorState::Connecting { attempt: failures }, failures);
            let error = match self.run_session(&mut failures).await {
                SessionEnd::Cancelled => break,
                SessionEnd::Failed(error) => error,
            };

            failures = failures.saturating_add(1);
            self.health.last_error = Some(error.to_string());
            if failures > self.policy.max_consecutive_failures {
                error!(failures, error = %error, "stream reconnect attempts exhausted");
                self.transition(
                    ConnectorState::Stopped(StopReason::BackoffExhausted {
                        failures,
                        last_error: error.to_string(),
                    }),
                    failures,
                );
                return;
            }

            let delay = self.policy.delay_for_attempt(failures);
            warn!(
                attempt = failures,
                delay_secs = delay.as_secs(),
                error = %error,
                "stream disconnected; backing off"
            );
            self.health.last_backoff_secs = Some(delay.as_secs());
            self.transition(ConnectorState::Backoff { attempt: failures, delay }, failures);
            let cancelled = tokio::select! {
                biased;
                _ = wait_for_cancel(&mut self.cancel) => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                break;
            }
        }
        info!("stream connector stopped");
        self.transition(ConnectorState::Stopped(StopReason::Requested), failures);
    }

    async fn run_session(&mut self, failures: &mut u32) -> SessionEnd {
        let connected = tokio::select! {
            biased;
            _ = wait_for_cancel(&mut self.cancel) => None,
            result = self.transport.connect() => Some(result),
        };
        let mut session = match connected {
            None => return SessionEnd::Cancelled,
            Some(Err(error)) => return SessionEnd::Failed(error),
            Some(Ok(session)) => session,
        };
        if let Err(error) = session.send_text(SUBSCRIBE_MAIN_CHANNEL).await {
            session.close().await;
            return SessionEnd::Failed(error);
        }

        if self.health.frames_received > 0 || self.health.last_error.is_some() {
            self.health.reconnects += 1;
        }
        *failures = 0;
        info!("stream subscribed to main channel");
        self.transition(ConnectorState::Subscribed, 0);

        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_cancel(&mut self.cancel) => None,
                frame = session.next_frame() => Some(frame),
            };
            let frame = match next {
                None => {
                    session.close().await;
                    return SessionEnd::Cancelled;
                }
                Some(Err(error)) => {
                    session.close().await;
                    return SessionEnd::Failed(error);
                }
                Some(Ok(frame)) => frame,
            };
            self.health.frames_received += 1;
            if self.handler.handle_frame(&frame).await == FrameDisposition::Malformed {
                self.health.malformed_frames += 1;
            }
        }
    }

    fn transition(&mut self, next: ConnectorState, failures: u32) {
        debug!(state = next.label(), failures, "stream connector transition");
        self.health.updated_unix_ms = current_unix_timestamp_ms();
        self.health.state = next.label().to_string();
        self.health.failure_streak = failures;
        self.state.send_replace(next);
        self.persist_health();
    }

    fn persist_health(&self) {
        let Some(path) = &self.health_path else {
            return;
        };
        let result = serde_json::to_string_pretty(&self.health)
            .map_err(anyhow::Error::from)
            .and_then(|payload| write_text_atomic(path, &payload));
        if let Err(error) = result {
            warn!(path = %path.display(), error = %error, "failed to persist stream health");
        }
    }
}

/// Resolves once the flag is set or its sender is gone.
pub(crate) async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}
