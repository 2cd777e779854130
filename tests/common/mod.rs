//! Shared test utilities
//!
//! A scripted recognition server on top of `MemoryConnector`, fake
//! collaborators and an orchestrator harness wiring them together.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;
use futures::StreamExt;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use parley::asr::{Connector, MemoryConnector, RecognitionEngine, ServerEnd, TaskOptions, WireMessage};
use parley::config::{AsrConfig, ConversationConfig, RoleConfig};
use parley::conversation::{
    ChatMessage, Collaborators, ConversationState, Generator, MessageRole, MessageStore,
    Orchestrator, OrchestratorConfig, OrchestratorHandle, Synthesizer,
};
use parley::db::EphemeralStore;
use parley::voice::{AudioFrame, AudioSource, FrameSink};
use parley::{Error, Result};

pub fn test_key() -> Option<SecretString> {
    Some(SecretString::from("sk-test".to_string()))
}

/// Recognition settings with short timeouts
pub fn asr_config() -> AsrConfig {
    AsrConfig {
        url: "memory://asr".to_string(),
        start_timeout: Duration::from_millis(300),
        finish_timeout: Duration::from_millis(100),
        heartbeat_interval: Duration::from_secs(10),
        ..AsrConfig::default()
    }
}

// Server event frames

pub fn task_started(task_id: &str) -> String {
    json!({"header": {"event": "task-started", "task_id": task_id}, "payload": {}}).to_string()
}

pub fn result_generated(task_id: &str, text: &str, sentence_end: bool) -> String {
    json!({
        "header": {"event": "result-generated", "task_id": task_id},
        "payload": {"output": {"transcription": {"text": text, "sentence_end": sentence_end}}}
    })
    .to_string()
}

pub fn translation_generated(task_id: &str, lang: &str, text: &str, sentence_end: bool) -> String {
    json!({
        "header": {"event": "result-generated", "task_id": task_id},
        "payload": {"output": {"translations": [{"lang": lang, "text": text, "sentence_end": sentence_end}]}}
    })
    .to_string()
}

pub fn task_finished(task_id: &str) -> String {
    json!({"header": {"event": "task-finished", "task_id": task_id}, "payload": {}}).to_string()
}

pub fn task_failed(task_id: &str, code: &str, message: &str) -> String {
    json!({
        "header": {"event": "task-failed", "task_id": task_id, "error_code": code, "error_message": message},
        "payload": {}
    })
    .to_string()
}

/// Next control message from the client, skipping audio and pings
pub async fn next_control(server: &mut ServerEnd) -> Option<Value> {
    while let Some(msg) = server.from_client.next().await {
        if let WireMessage::Text(text) = msg {
            return serde_json::from_str(&text).ok();
        }
    }
    None
}

pub fn header_task_id(message: &Value) -> String {
    message["header"]["task_id"].as_str().unwrap_or_default().to_string()
}

/// What the server does with one recognition task
#[derive(Debug, Clone)]
pub enum Reply {
    /// Confirm, then send these transcript fragments once enough audio arrived
    Fragments(Vec<(&'static str, bool)>),
    /// Confirm, then fail the task once enough audio arrived
    Fail { code: &'static str, message: &'static str },
    /// Never confirm the task
    Silent,
    /// Confirm, send these fragments, then finish the task unprompted
    FinishEarly(Vec<(&'static str, bool)>),
    /// Confirm, then drop the connection once enough audio arrived
    Drop,
}

/// Everything the scripted server observed
#[derive(Default)]
pub struct ServerLog {
    pub run_tasks: Mutex<Vec<Value>>,
    pub finish_tasks: Mutex<Vec<String>>,
    pub audio_frames: AtomicUsize,
    pub closes: AtomicUsize,
    pub drops: AtomicUsize,
}

impl ServerLog {
    pub fn run_task_ids(&self) -> Vec<String> {
        self.run_tasks
            .lock()
            .unwrap()
            .iter()
            .map(header_task_id)
            .collect()
    }

    pub fn finish_task_ids(&self) -> Vec<String> {
        self.finish_tasks.lock().unwrap().clone()
    }
}

/// Serve every accepted connection from a shared script
///
/// Tasks beyond the script are confirmed and then left open.
pub fn spawn_server(
    mut accepted: mpsc::UnboundedReceiver<ServerEnd>,
    script: Vec<Reply>,
    frames_before_reply: usize,
) -> Arc<ServerLog> {
    let log = Arc::new(ServerLog::default());
    let script = Arc::new(Mutex::new(VecDeque::from(script)));

    let server_log = Arc::clone(&log);
    tokio::spawn(async move {
        while let Some(end) = accepted.recv().await {
            tokio::spawn(serve(
                end,
                Arc::clone(&script),
                Arc::clone(&server_log),
                frames_before_reply,
            ));
        }
    });

    log
}

async fn serve(
    mut end: ServerEnd,
    script: Arc<Mutex<VecDeque<Reply>>>,
    log: Arc<ServerLog>,
    frames_before_reply: usize,
) {
    let mut current: Option<(String, Reply)> = None;
    let mut frames = 0;

    while let Some(msg) = end.from_client.next().await {
        match msg {
            WireMessage::Text(text) => {
                let Ok(message) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                let task_id = header_task_id(&message);
                match message["header"]["action"].as_str() {
                    Some("run-task") => {
                        log.run_tasks.lock().unwrap().push(message.clone());
                        let reply = script
                            .lock()
                            .unwrap()
                            .pop_front()
                            .unwrap_or(Reply::Fragments(Vec::new()));
                        if !matches!(reply, Reply::Silent) {
                            end.send_text(task_started(&task_id));
                            current = Some((task_id, reply));
                            frames = 0;
                        }
                    }
                    Some("finish-task") => {
                        log.finish_tasks.lock().unwrap().push(task_id.clone());
                        end.send_text(task_finished(&task_id));
                        current = None;
                    }
                    _ => {}
                }
            }
            WireMessage::Binary(_) => {
                log.audio_frames.fetch_add(1, Ordering::SeqCst);
                frames += 1;
                if frames < frames_before_reply {
                    continue;
                }
                match current.take() {
                    Some((id, Reply::Fragments(fragments))) => {
                        for (text, is_final) in fragments {
                            end.send_text(result_generated(&id, text, is_final));
                        }
                    }
                    Some((id, Reply::Fail { code, message })) => {
                        end.send_text(task_failed(&id, code, message));
                    }
                    Some((id, Reply::FinishEarly(fragments))) => {
                        for (text, is_final) in fragments {
                            end.send_text(result_generated(&id, text, is_final));
                        }
                        end.send_text(task_finished(&id));
                    }
                    Some((_, Reply::Drop)) => {
                        log.drops.fetch_add(1, Ordering::SeqCst);
                        let _ = end.to_client.unbounded_send(Ok(WireMessage::Close));
                        break;
                    }
                    Some((_, Reply::Silent)) | None => {}
                }
            }
            WireMessage::Close => {
                log.closes.fetch_add(1, Ordering::SeqCst);
                break;
            }
            WireMessage::Ping(_) | WireMessage::Pong(_) => {}
        }
    }
}

/// Counters shared with a [`FakeSource`]
#[derive(Default)]
pub struct SourceLog {
    pub capturing: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

/// Capture stand-in that emits a fixed number of silent frames on start,
/// or refuses to start like a blocked microphone
pub struct FakeSource {
    log: Arc<SourceLog>,
    frames_per_start: usize,
    fail: bool,
}

impl FakeSource {
    pub fn new(frames_per_start: usize, fail: bool) -> (Self, Arc<SourceLog>) {
        let log = Arc::new(SourceLog::default());
        (
            Self {
                log: Arc::clone(&log),
                frames_per_start,
                fail,
            },
            log,
        )
    }
}

impl AudioSource for FakeSource {
    fn start(&mut self, sink: Arc<dyn FrameSink>) -> Result<()> {
        self.log.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::PermissionDenied("input device blocked".to_string()));
        }
        self.log.capturing.store(true, Ordering::SeqCst);
        for _ in 0..self.frames_per_start {
            sink.send_frame(AudioFrame::new(vec![0; 3200]));
        }
        Ok(())
    }

    fn stop(&mut self) {
        if self.log.capturing.swap(false, Ordering::SeqCst) {
            self.log.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_capturing(&self) -> bool {
        self.log.capturing.load(Ordering::SeqCst)
    }
}

/// Generator answering `echo: <text>` after a delay, or failing
pub struct FakeGenerator {
    pub delay: Duration,
    pub fail: bool,
    pub calls: AtomicUsize,
    /// Calls that ran to the end instead of being aborted
    pub completed: AtomicUsize,
    pub histories: Mutex<Vec<Vec<ChatMessage>>>,
}

impl FakeGenerator {
    pub fn new(delay: Duration, fail: bool) -> Self {
        Self {
            delay,
            fail,
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            histories: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(
        &self,
        user_text: &str,
        history: &[ChatMessage],
        _role: &RoleConfig,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.histories.lock().unwrap().push(history.to_vec());
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Generation("model unavailable".to_string()));
        }
        Ok(format!("echo: {user_text}"))
    }
}

/// Synthesizer that "speaks" by sleeping
pub struct FakeSynthesizer {
    pub delay: Duration,
    pub fail: bool,
    pub spoken: Mutex<Vec<String>>,
    pub stops: AtomicUsize,
    pub pauses: AtomicUsize,
    pub resumes: AtomicUsize,
    speaking: AtomicBool,
}

impl FakeSynthesizer {
    pub fn new(delay: Duration, fail: bool) -> Self {
        Self {
            delay,
            fail,
            spoken: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            speaking: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn speak(&self, text: &str) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        self.speaking.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.speaking.store(false, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Synthesis("no output device".to_string()));
        }
        Ok(())
    }

    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.speaking.store(false, Ordering::SeqCst);
    }

    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }
}

/// Knobs for [`Harness::start`]
pub struct HarnessOptions {
    pub script: Vec<Reply>,
    pub frames_per_start: usize,
    pub source_fails: bool,
    pub frames_before_reply: usize,
    pub continuous: bool,
    pub task: TaskOptions,
    pub generator_delay: Duration,
    pub generator_fails: bool,
    pub speech_delay: Duration,
    pub speech_fails: bool,
    pub recovery_delay: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            script: Vec::new(),
            frames_per_start: 5,
            source_fails: false,
            frames_before_reply: 5,
            continuous: false,
            task: TaskOptions {
                target_lang: "en".to_string(),
                max_end_silence_ms: 700,
            },
            generator_delay: Duration::from_millis(50),
            generator_fails: false,
            speech_delay: Duration::from_millis(50),
            speech_fails: false,
            recovery_delay: Duration::from_millis(100),
        }
    }
}

/// A running orchestrator over the scripted server and fakes
pub struct Harness {
    pub handle: OrchestratorHandle,
    pub server: Arc<ServerLog>,
    pub connector: Arc<MemoryConnector>,
    pub source: Arc<SourceLog>,
    pub store: Arc<EphemeralStore>,
    pub generator: Arc<FakeGenerator>,
    pub synthesizer: Arc<FakeSynthesizer>,
    pub running: JoinHandle<()>,
}

impl Harness {
    pub fn start(options: HarnessOptions) -> Self {
        let (connector, accepted) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let server = spawn_server(accepted, options.script, options.frames_before_reply);

        let dyn_connector: Arc<dyn Connector> = connector.clone();
        let (engine, events) = RecognitionEngine::new(asr_config(), test_key(), dyn_connector);
        let (source, source_log) = FakeSource::new(options.frames_per_start, options.source_fails);

        let store = Arc::new(EphemeralStore::new());
        let generator = Arc::new(FakeGenerator::new(
            options.generator_delay,
            options.generator_fails,
        ));
        let synthesizer = Arc::new(FakeSynthesizer::new(
            options.speech_delay,
            options.speech_fails,
        ));

        let config = OrchestratorConfig {
            conversation: ConversationConfig {
                continuous: options.continuous,
                recovery_delay: options.recovery_delay,
                status_clear_delay: Duration::from_secs(5),
            },
            task: options.task,
            role: RoleConfig::default(),
            session_id: None,
        };

        let (orchestrator, handle) = Orchestrator::new(
            config,
            engine,
            events,
            Box::new(source),
            Collaborators {
                generator: generator.clone(),
                synthesizer: synthesizer.clone(),
                store: store.clone(),
            },
        );
        let running = tokio::spawn(orchestrator.run());

        Self {
            handle,
            server,
            connector,
            source: source_log,
            store,
            generator,
            synthesizer,
            running,
        }
    }

    /// Wait (bounded) for a state matching `predicate`
    pub async fn wait_for(
        &self,
        within: Duration,
        predicate: impl FnMut(&ConversationState) -> bool,
    ) -> ConversationState {
        let mut rx = self.handle.subscribe();
        let state = tokio::time::timeout(within, rx.wait_for(predicate))
            .await
            .expect("state not reached in time")
            .expect("orchestrator stopped")
            .clone();
        state
    }

    /// Wait (bounded) for a given status message
    pub async fn wait_for_status(&self, within: Duration, expected: &str) {
        let mut rx = self.handle.status();
        tokio::time::timeout(within, rx.wait_for(|s| s.as_deref() == Some(expected)))
            .await
            .expect("status not shown in time")
            .expect("orchestrator stopped");
    }

    /// Record every state the orchestrator passes through
    pub fn record_states(&self) -> Arc<Mutex<Vec<ConversationState>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut rx = self.handle.subscribe();
        let sink = Arc::clone(&seen);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                sink.lock().unwrap().push(state);
            }
        });
        seen
    }

    /// Every stored message across all sessions
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.store
            .list_sessions()
            .unwrap()
            .iter()
            .flat_map(|s| self.store.load_messages(&s.id).unwrap())
            .collect()
    }

    pub fn user_messages(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|m| m.role == MessageRole::User)
            .map(|m| m.content)
            .collect()
    }

    pub fn status(&self) -> Option<String> {
        self.handle.status().borrow().clone()
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(2), self.running)
            .await
            .expect("orchestrator did not stop")
            .unwrap();
    }
}

/// A canned reply for [`CannedServer`]
pub struct CannedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CannedResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn bytes(status: u16, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// A request as seen by [`CannedServer`]
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    /// Lowercased names
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

#[derive(Clone)]
struct CannedState {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    responses: Arc<Mutex<VecDeque<CannedResponse>>>,
}

/// HTTP endpoint answering every request with the next queued response
/// (500 once the queue is empty)
pub struct CannedServer {
    pub url: String,
    state: CannedState,
}

impl CannedServer {
    pub async fn start() -> Self {
        let state = CannedState {
            requests: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
        };
        let app = axum::Router::new()
            .fallback(canned_reply)
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { url, state }
    }

    pub fn push(&self, response: CannedResponse) {
        self.state.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

async fn canned_reply(
    State(state): State<CannedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.requests.lock().unwrap().push(CapturedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        headers: headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect(),
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    let canned = state
        .responses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| CannedResponse::json(500, "{}"));

    let mut response = Response::builder().status(canned.status);
    for (name, value) in &canned.headers {
        response = response.header(name.as_str(), value.as_str());
    }
    response.body(Body::from(canned.body)).unwrap()
}
