//! Recognition session engine
//!
//! Owns the single duplex connection and the lifecycle of the recognition
//! task running on it. Three background workers run per connection: a writer
//! draining the outbound queue in order, a receive loop parsing server events,
//! and a heartbeat queueing keepalive pings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use secrecy::SecretString;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::protocol::{ControlMessage, Fragment, ServerEvent, TaskOptions, TranslationFragment};
use super::transport::{ConnectRequest, Connector, WireMessage, WireSink, WireStream};
use crate::config::AsrConfig;
use crate::voice::{AudioFrame, FrameSink};
use crate::{Error, Result};

/// Whether the duplex channel is usable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Open,
}

/// Lifecycle of the recognition task on the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    /// `run-task` sent, waiting for `task-started`
    Starting(String),
    /// Accepting audio
    Active(String),
    /// `finish-task` sent, waiting for `task-finished`
    Finishing(String),
}

impl TaskState {
    /// Id of the open task, if any
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Starting(id) | Self::Active(id) | Self::Finishing(id) => Some(id),
        }
    }

    /// Whether a task is open in any phase
    #[must_use]
    pub const fn is_open(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Whether the task accepts audio
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }
}

/// Event delivered to the engine's consumer
///
/// Every event names the task it belongs to, so a consumer can discard
/// output of a task it has already moved past.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsrEvent {
    TaskStarted {
        task_id: String,
    },
    Transcript {
        task_id: String,
        fragment: Fragment,
    },
    Translation {
        task_id: String,
        fragment: TranslationFragment,
    },
    TaskFinished {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        code: String,
        message: String,
    },
    /// Transport closed while a task was open
    ConnectionLost {
        task_id: String,
        reason: String,
    },
}

impl AsrEvent {
    /// Task this event belongs to
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Self::TaskStarted { task_id }
            | Self::Transcript { task_id, .. }
            | Self::Translation { task_id, .. }
            | Self::TaskFinished { task_id }
            | Self::TaskFailed { task_id, .. }
            | Self::ConnectionLost { task_id, .. } => task_id,
        }
    }
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Audio(Vec<u8>),
    Ping,
    Close,
}

/// State shared between the engine and its workers
struct Shared {
    task: watch::Sender<TaskState>,
    connection: watch::Sender<ConnectionState>,
    /// Identifies the live connection; workers of older connections stay silent
    epoch: AtomicU64,
    last_failure: Mutex<Option<(String, String)>>,
    events: mpsc::UnboundedSender<AsrEvent>,
}

impl Shared {
    fn emit(&self, event: AsrEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("recognition event dropped: no consumer");
        }
    }

    fn is_current_epoch(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Whether an event for `task_id` belongs to the open task
    fn is_current_task(&self, task_id: Option<&str>) -> bool {
        let state = self.task.borrow();
        match (state.task_id(), task_id) {
            (Some(current), Some(id)) => current == id,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Reset to idle only if `task_id` is still the open task
    fn reset_task(&self, task_id: &str) -> bool {
        self.task.send_if_modified(|state| {
            if state.task_id() == Some(task_id) {
                *state = TaskState::Idle;
                true
            } else {
                false
            }
        })
    }

    fn handle_text(&self, text: &str) {
        let event = match ServerEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparseable recognition frame");
                return;
            }
        };

        if !matches!(event, ServerEvent::Other(_)) && !self.is_current_task(event.task_id()) {
            tracing::debug!(task_id = ?event.task_id(), "ignoring event for stale task");
            return;
        }

        match event {
            ServerEvent::TaskStarted { .. } => {
                let mut started = None;
                self.task.send_if_modified(|state| match state {
                    TaskState::Starting(id) => {
                        started = Some(id.clone());
                        *state = TaskState::Active(id.clone());
                        true
                    }
                    _ => false,
                });
                if let Some(task_id) = started {
                    tracing::debug!(task_id = %task_id, "recognition task started");
                    self.emit(AsrEvent::TaskStarted { task_id });
                }
            }
            ServerEvent::ResultGenerated {
                transcript,
                translations,
                ..
            } => {
                let Some(task_id) = self.task.borrow().task_id().map(ToString::to_string) else {
                    return;
                };
                if let Some(fragment) = transcript {
                    tracing::trace!(text = %fragment.text, is_final = fragment.is_final, "transcript");
                    self.emit(AsrEvent::Transcript {
                        task_id: task_id.clone(),
                        fragment,
                    });
                }
                for fragment in translations {
                    self.emit(AsrEvent::Translation {
                        task_id: task_id.clone(),
                        fragment,
                    });
                }
            }
            ServerEvent::TaskFinished { .. } => {
                let previous = self.task.send_replace(TaskState::Idle);
                if let Some(task_id) = previous.task_id() {
                    tracing::debug!(task_id, "recognition task finished");
                    self.emit(AsrEvent::TaskFinished {
                        task_id: task_id.to_string(),
                    });
                }
            }
            ServerEvent::TaskFailed { code, message, .. } => {
                tracing::warn!(code = %code, message = %message, "recognition task failed");
                if let Ok(mut last) = self.last_failure.lock() {
                    *last = Some((code.clone(), message.clone()));
                }
                let previous = self.task.send_replace(TaskState::Idle);
                if let Some(task_id) = previous.task_id() {
                    self.emit(AsrEvent::TaskFailed {
                        task_id: task_id.to_string(),
                        code,
                        message,
                    });
                }
            }
            ServerEvent::Other(name) => {
                tracing::debug!(event = %name, "unhandled recognition event");
            }
        }
    }

    /// Mark the connection of `epoch` closed; reports loss if a task was open
    fn connection_closed(&self, epoch: u64, reason: &str) {
        if !self.is_current_epoch(epoch) {
            return;
        }
        if self.connection.send_replace(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }

        let previous = self.task.send_replace(TaskState::Idle);
        if let Some(task_id) = previous.task_id() {
            tracing::warn!(reason, task_id, "recognition connection lost mid-task");
            self.emit(AsrEvent::ConnectionLost {
                task_id: task_id.to_string(),
                reason: reason.to_string(),
            });
        } else {
            tracing::info!(reason, "recognition connection closed");
        }
    }
}

/// Handles of the workers serving one connection
struct Connection {
    outbound: mpsc::UnboundedSender<Outbound>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl Connection {
    fn abort(&self) {
        self.heartbeat.abort();
        self.reader.abort();
        self.writer.abort();
    }
}

/// Streaming recognition session engine
pub struct RecognitionEngine {
    config: AsrConfig,
    api_key: Option<SecretString>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    connection: Option<Connection>,
}

impl RecognitionEngine {
    /// Create an engine and the receiver of its events
    #[must_use]
    pub fn new(
        config: AsrConfig,
        api_key: Option<SecretString>,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<AsrEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (task, _) = watch::channel(TaskState::Idle);
        let (connection, _) = watch::channel(ConnectionState::Closed);

        let shared = Arc::new(Shared {
            task,
            connection,
            epoch: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            events,
        });

        (
            Self {
                config,
                api_key,
                connector,
                shared,
                connection: None,
            },
            events_rx,
        )
    }

    /// Whether the duplex channel is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_some() && *self.shared.connection.borrow() == ConnectionState::Open
    }

    /// Current task state
    #[must_use]
    pub fn task_state(&self) -> TaskState {
        self.shared.task.borrow().clone()
    }

    /// Id of the open task, if any
    #[must_use]
    pub fn current_task_id(&self) -> Option<String> {
        self.shared.task.borrow().task_id().map(ToString::to_string)
    }

    /// Open the duplex channel unless it is already live
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` without a credential, `Error::Transport` if the
    /// handshake fails
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            tracing::trace!("recognition connection already open");
            return Ok(());
        }

        if let Some(stale) = self.connection.take() {
            stale.abort();
        }

        let api_key = self.api_key.clone().ok_or_else(|| {
            Error::Config("DashScope API key required for recognition".to_string())
        })?;

        let request = ConnectRequest {
            url: self.config.url.clone(),
            api_key,
        };
        let (sink, stream) = self.connector.connect(&request).await?;

        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.task.send_replace(TaskState::Idle);
        self.shared.connection.send_replace(ConnectionState::Open);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, outbound_rx, Arc::clone(&self.shared), epoch));
        let reader = tokio::spawn(receive_loop(stream, Arc::clone(&self.shared), epoch));
        let heartbeat = tokio::spawn(heartbeat_loop(
            outbound.clone(),
            self.config.heartbeat_interval,
        ));

        self.connection = Some(Connection {
            outbound,
            writer,
            reader,
            heartbeat,
        });

        tracing::info!(url = %self.config.url, "recognition service connected");
        Ok(())
    }

    fn outbound(&self) -> Result<&mpsc::UnboundedSender<Outbound>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.connection
            .as_ref()
            .map(|c| &c.outbound)
            .ok_or(Error::NotConnected)
    }

    /// Open a recognition task and wait for the service to confirm it
    ///
    /// Returns the new task id.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` without a live connection,
    /// `Error::TaskBusy` if a task is already open,
    /// `Error::TaskStartTimeout` if no confirmation arrives in time and
    /// `Error::RemoteTask` if the service rejects the task
    pub async fn start_task(&self, options: &TaskOptions) -> Result<String> {
        let outbound = self.outbound()?;

        if let Some(open) = self.current_task_id() {
            return Err(Error::TaskBusy(open));
        }

        let task_id = Uuid::new_v4().simple().to_string();
        let message = ControlMessage::run_task(&task_id, &self.config.model, options).to_json()?;

        if let Ok(mut last) = self.shared.last_failure.lock() {
            *last = None;
        }
        self.shared
            .task
            .send_replace(TaskState::Starting(task_id.clone()));

        if outbound.send(Outbound::Text(message)).is_err() {
            self.shared.reset_task(&task_id);
            return Err(Error::NotConnected);
        }

        tracing::debug!(
            task_id = %task_id,
            target_lang = %options.target_lang,
            max_end_silence_ms = options.max_end_silence_ms,
            "run-task sent"
        );

        let mut rx = self.shared.task.subscribe();
        let waited = tokio::time::timeout(self.config.start_timeout, async {
            rx.wait_for(|state| !matches!(state, TaskState::Starting(id) if *id == task_id))
                .await
                .map(|state| state.clone())
        })
        .await;

        match waited {
            Ok(Ok(TaskState::Active(id))) if id == task_id => Ok(task_id),
            Ok(Ok(_)) | Ok(Err(_)) => {
                let failure = self
                    .shared
                    .last_failure
                    .lock()
                    .ok()
                    .and_then(|mut last| last.take());
                match failure {
                    Some((code, message)) => Err(Error::RemoteTask { code, message }),
                    None if !self.is_connected() => Err(Error::NotConnected),
                    None => Err(Error::Transport(
                        "recognition task aborted before start".to_string(),
                    )),
                }
            }
            Err(_) => {
                self.shared.reset_task(&task_id);
                // Tell the service to drop the task in case the confirmation is merely late
                if let Ok(finish) = ControlMessage::finish_task(&task_id).to_json() {
                    let _ = outbound.send(Outbound::Text(finish));
                }
                let ms = u64::try_from(self.config.start_timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(task_id = %task_id, timeout_ms = ms, "recognition task start timed out");
                Err(Error::TaskStartTimeout(ms))
            }
        }
    }

    /// Send one audio frame on the active task
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotStarted` unless the task is active,
    /// `Error::NotConnected` if the connection is gone
    pub fn send_audio(&self, frame: AudioFrame) -> Result<()> {
        if !self.shared.task.borrow().is_active() {
            return Err(Error::TaskNotStarted);
        }
        self.outbound()?
            .send(Outbound::Audio(frame.into_bytes()))
            .map_err(|_| Error::NotConnected)
    }

    /// Handle for forwarding frames from the capture thread
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` without a live connection
    pub fn audio_sink(&self) -> Result<AudioSink> {
        Ok(AudioSink {
            outbound: self.outbound()?.clone(),
            task: self.shared.task.subscribe(),
        })
    }

    /// End the open task, keeping the connection for the next one
    ///
    /// The `task-finished` confirmation is awaited for at most the configured
    /// finish timeout; the task is considered closed either way.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoActiveTask` if no task is open
    pub async fn finish_task(&self) -> Result<()> {
        let task_id = self.current_task_id().ok_or(Error::NoActiveTask)?;

        self.shared
            .task
            .send_replace(TaskState::Finishing(task_id.clone()));

        let Ok(outbound) = self.outbound() else {
            self.shared.reset_task(&task_id);
            return Ok(());
        };

        let message = ControlMessage::finish_task(&task_id).to_json()?;
        if outbound.send(Outbound::Text(message)).is_err() {
            self.shared.reset_task(&task_id);
            return Ok(());
        }

        let mut rx = self.shared.task.subscribe();
        let confirmed = tokio::time::timeout(self.config.finish_timeout, async {
            rx.wait_for(|state| !matches!(state, TaskState::Finishing(id) if *id == task_id))
                .await
                .is_ok()
        })
        .await
        .unwrap_or(false);

        if !confirmed {
            tracing::debug!(task_id = %task_id, "finish not acknowledged in time");
        }
        self.shared.reset_task(&task_id);
        Ok(())
    }

    /// Close the channel and reset all task state
    pub async fn disconnect(&mut self) {
        // Silence the old workers before they observe the close
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(conn) = self.connection.take() {
            conn.heartbeat.abort();
            let _ = conn.outbound.send(Outbound::Close);
            if tokio::time::timeout(std::time::Duration::from_millis(500), conn.writer)
                .await
                .is_err()
            {
                tracing::debug!("writer did not drain before close");
            }
            conn.reader.abort();
            tracing::info!("recognition service disconnected");
        }

        self.shared.task.send_replace(TaskState::Idle);
        self.shared.connection.send_replace(ConnectionState::Closed);
    }
}

impl Drop for RecognitionEngine {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.abort();
        }
    }
}

/// Cloneable frame forwarder bound to one connection
///
/// Frames offered while no task is active, or after the connection is gone,
/// are dropped and logged.
#[derive(Clone)]
pub struct AudioSink {
    outbound: mpsc::UnboundedSender<Outbound>,
    task: watch::Receiver<TaskState>,
}

impl AudioSink {
    /// Queue a frame for transmission
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotStarted` unless the task is active,
    /// `Error::NotConnected` if the connection writer is gone
    pub fn send(&self, frame: AudioFrame) -> Result<()> {
        if !self.task.borrow().is_active() {
            return Err(Error::TaskNotStarted);
        }
        self.outbound
            .send(Outbound::Audio(frame.into_bytes()))
            .map_err(|_| Error::NotConnected)
    }
}

impl FrameSink for AudioSink {
    fn send_frame(&self, frame: AudioFrame) {
        let len = frame.len();
        if let Err(e) = self.send(frame) {
            tracing::debug!(error = %e, bytes = len, "audio frame dropped");
        }
    }
}

async fn write_loop(
    mut sink: WireSink,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
    epoch: u64,
) {
    while let Some(item) = outbound.recv().await {
        let (message, closing) = match item {
            Outbound::Text(text) => (WireMessage::Text(text), false),
            Outbound::Audio(data) => (WireMessage::Binary(data), false),
            Outbound::Ping => (WireMessage::Ping(Vec::new()), false),
            Outbound::Close => (WireMessage::Close, true),
        };
        let heartbeat = matches!(message, WireMessage::Ping(_));

        if let Err(e) = sink.send(message).await {
            // Liveness is judged by the receive side
            if heartbeat {
                tracing::warn!(error = %e, "heartbeat send failed");
                continue;
            }
            tracing::warn!(error = %e, "recognition send failed");
            shared.connection_closed(epoch, &e.to_string());
            return;
        }

        if closing {
            break;
        }
    }

    if let Err(e) = sink.close().await {
        tracing::debug!(error = %e, "closing recognition sink");
    }
}

async fn receive_loop(mut stream: WireStream, shared: Arc<Shared>, epoch: u64) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(WireMessage::Text(text))) => shared.handle_text(&text),
            Some(Ok(WireMessage::Close)) => break "closed by server".to_string(),
            Some(Ok(WireMessage::Ping(_) | WireMessage::Pong(_))) => {
                tracing::trace!("keepalive frame");
            }
            Some(Ok(WireMessage::Binary(data))) => {
                tracing::debug!(bytes = data.len(), "ignoring binary frame from server");
            }
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        }
    };

    shared.connection_closed(epoch, &reason);
}

async fn heartbeat_loop(outbound: mpsc::UnboundedSender<Outbound>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        if outbound.send(Outbound::Ping).is_err() {
            tracing::warn!("heartbeat not queued: connection writer gone");
            return;
        }
        tracing::trace!("heartbeat queued");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{Sink, StreamExt};
    use serde_json::Value;

    use super::*;
    use crate::asr::transport::{MemoryConnector, ServerEnd};

    fn test_config() -> AsrConfig {
        AsrConfig {
            url: "memory://asr".to_string(),
            start_timeout: Duration::from_millis(200),
            finish_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(50),
            ..AsrConfig::default()
        }
    }

    fn options() -> TaskOptions {
        TaskOptions {
            target_lang: "en".to_string(),
            max_end_silence_ms: 10_000,
        }
    }

    fn engine(
        connector: Arc<MemoryConnector>,
    ) -> (RecognitionEngine, mpsc::UnboundedReceiver<AsrEvent>) {
        RecognitionEngine::new(
            test_config(),
            Some(SecretString::from("sk-test".to_string())),
            connector,
        )
    }

    async fn next_text(server: &mut ServerEnd) -> Value {
        loop {
            match server.from_client.next().await {
                Some(WireMessage::Text(text)) => return serde_json::from_str(&text).unwrap(),
                Some(_) => {}
                None => panic!("client closed"),
            }
        }
    }

    fn event(name: &str, task_id: &str) -> String {
        serde_json::json!({"header": {"event": name, "task_id": task_id}}).to_string()
    }

    #[tokio::test]
    async fn connect_without_key_is_config_error() {
        let (connector, _accepted) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (mut engine, _events) = RecognitionEngine::new(test_config(), None, connector.clone());

        assert!(matches!(engine.connect().await, Err(Error::Config(_))));
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (connector, _accepted) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (mut engine, _events) = engine(connector.clone());

        engine.connect().await.unwrap();
        engine.connect().await.unwrap();

        assert!(engine.is_connected());
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn start_task_without_connection_fails() {
        let (connector, _accepted) = MemoryConnector::new();
        let (engine, _events) = engine(Arc::new(connector));

        assert!(matches!(
            engine.start_task(&options()).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn send_audio_requires_active_task() {
        let (connector, _accepted) = MemoryConnector::new();
        let (mut engine, _events) = engine(Arc::new(connector));
        engine.connect().await.unwrap();

        let result = engine.send_audio(AudioFrame::new(vec![0; 3200]));
        assert!(matches!(result, Err(Error::TaskNotStarted)));
    }

    #[tokio::test]
    async fn finish_without_task_is_rejected() {
        let (connector, _accepted) = MemoryConnector::new();
        let (mut engine, _events) = engine(Arc::new(connector));
        engine.connect().await.unwrap();

        assert!(matches!(engine.finish_task().await, Err(Error::NoActiveTask)));
    }

    #[tokio::test]
    async fn full_task_handshake() {
        let (connector, mut accepted) = MemoryConnector::new();
        let (mut engine, mut events) = engine(Arc::new(connector));
        engine.connect().await.unwrap();
        let mut server = accepted.recv().await.unwrap();

        let server_task = tokio::spawn(async move {
            let run = next_text(&mut server).await;
            assert_eq!(run["header"]["action"], "run-task");
            let task_id = run["header"]["task_id"].as_str().unwrap().to_string();
            server.send_text(event("task-started", &task_id));

            let mut audio = 0;
            loop {
                match server.from_client.next().await {
                    Some(WireMessage::Binary(data)) => {
                        assert_eq!(data.len(), 3200);
                        audio += 1;
                    }
                    Some(WireMessage::Text(text)) => {
                        let msg: Value = serde_json::from_str(&text).unwrap();
                        assert_eq!(msg["header"]["action"], "finish-task");
                        assert_eq!(msg["header"]["task_id"], task_id.as_str());
                        server.send_text(event("task-finished", &task_id));
                        break;
                    }
                    Some(_) => {}
                    None => panic!("client closed"),
                }
            }
            (audio, server)
        });

        let task_id = engine.start_task(&options()).await.unwrap();
        assert_eq!(task_id.len(), 32);
        assert_eq!(engine.task_state(), TaskState::Active(task_id.clone()));

        for _ in 0..3 {
            engine.send_audio(AudioFrame::new(vec![0; 3200])).unwrap();
        }
        engine.finish_task().await.unwrap();

        let (audio, _server) = server_task.await.unwrap();
        assert_eq!(audio, 3);
        assert_eq!(engine.task_state(), TaskState::Idle);
        assert!(engine.is_connected());

        assert_eq!(
            events.recv().await,
            Some(AsrEvent::TaskStarted {
                task_id: task_id.clone()
            })
        );
        assert_eq!(events.recv().await, Some(AsrEvent::TaskFinished { task_id }));
    }

    #[tokio::test]
    async fn start_timeout_resets_task() {
        let (connector, mut accepted) = MemoryConnector::new();
        let (mut engine, _events) = engine(Arc::new(connector));
        engine.connect().await.unwrap();
        let _server = accepted.recv().await.unwrap();

        let result = engine.start_task(&options()).await;
        assert!(matches!(result, Err(Error::TaskStartTimeout(200))));
        assert_eq!(engine.task_state(), TaskState::Idle);
        assert!(engine.is_connected());
    }

    #[tokio::test]
    async fn stale_events_are_ignored() {
        let (connector, mut accepted) = MemoryConnector::new();
        let (mut engine, mut events) = engine(Arc::new(connector));
        engine.connect().await.unwrap();
        let server = accepted.recv().await.unwrap();

        server.send_text(event("task-finished", "someone-else"));
        server.send_text(
            serde_json::json!({
                "header": {"event": "result-generated", "task_id": "someone-else"},
                "payload": {"output": {"transcription": {"text": "ghost", "sentence_end": true}}}
            })
            .to_string(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_close_while_idle_is_silent() {
        let (connector, mut accepted) = MemoryConnector::new();
        let (mut engine, mut events) = engine(Arc::new(connector));
        engine.connect().await.unwrap();
        let server = accepted.recv().await.unwrap();

        server.close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!engine.is_connected());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn heartbeat_pings_while_idle() {
        let (connector, mut accepted) = MemoryConnector::new();
        let (mut engine, _events) = engine(Arc::new(connector));
        engine.connect().await.unwrap();
        let mut server = accepted.recv().await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), server.from_client.next())
            .await
            .unwrap();
        assert_eq!(frame, Some(WireMessage::Ping(Vec::new())));
    }

    /// Outbound half that refuses keepalive pings
    struct RejectPings(WireSink);

    impl Sink<WireMessage> for RejectPings {
        type Error = Error;

        fn poll_ready(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<()>> {
            self.0.as_mut().poll_ready(cx)
        }

        fn start_send(mut self: std::pin::Pin<&mut Self>, item: WireMessage) -> Result<()> {
            if matches!(item, WireMessage::Ping(_)) {
                return Err(Error::Transport("ping rejected".to_string()));
            }
            self.0.as_mut().start_send(item)
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<()>> {
            self.0.as_mut().poll_flush(cx)
        }

        fn poll_close(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<()>> {
            self.0.as_mut().poll_close(cx)
        }
    }

    struct PingRejectingConnector(MemoryConnector);

    #[async_trait::async_trait]
    impl Connector for PingRejectingConnector {
        async fn connect(&self, request: &ConnectRequest) -> Result<(WireSink, WireStream)> {
            let (sink, stream) = self.0.connect(request).await?;
            Ok((Box::pin(RejectPings(sink)), stream))
        }
    }

    #[tokio::test]
    async fn failed_heartbeat_keeps_connection_and_task() {
        let (connector, mut accepted) = MemoryConnector::new();
        let (mut engine, mut events) = RecognitionEngine::new(
            test_config(),
            Some(SecretString::from("sk-test".to_string())),
            Arc::new(PingRejectingConnector(connector)),
        );
        engine.connect().await.unwrap();
        let mut server = accepted.recv().await.unwrap();

        // Several heartbeat intervals while idle
        tokio::time::sleep(Duration::from_millis(180)).await;
        assert!(engine.is_connected());

        let server_task = tokio::spawn(async move {
            let run = next_text(&mut server).await;
            let task_id = run["header"]["task_id"].as_str().unwrap().to_string();
            server.send_text(event("task-started", &task_id));
            server
        });
        let task_id = engine.start_task(&options()).await.unwrap();
        let mut server = server_task.await.unwrap();

        // And more while the task is open
        tokio::time::sleep(Duration::from_millis(120)).await;
        engine.send_audio(AudioFrame::new(vec![7; 3200])).unwrap();
        loop {
            match server.from_client.next().await {
                Some(WireMessage::Binary(data)) => {
                    assert_eq!(data[0], 7);
                    break;
                }
                Some(other) => assert!(!matches!(other, WireMessage::Ping(_))),
                None => panic!("client closed"),
            }
        }

        assert!(engine.is_connected());
        assert_eq!(engine.task_state(), TaskState::Active(task_id.clone()));
        assert_eq!(events.recv().await, Some(AsrEvent::TaskStarted { task_id }));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_closes_channel() {
        let (connector, mut accepted) = MemoryConnector::new();
        let (mut engine, _events) = engine(Arc::new(connector));
        engine.connect().await.unwrap();
        let mut server = accepted.recv().await.unwrap();

        engine.disconnect().await;
        assert!(!engine.is_connected());

        let mut saw_close = false;
        while let Some(frame) = server.from_client.next().await {
            if frame == WireMessage::Close {
                saw_close = true;
            }
        }
        assert!(saw_close);
    }
}
