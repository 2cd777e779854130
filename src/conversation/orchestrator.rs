//! Turn-taking state machine
//!
//! A single loop owns the conversation state and every scratch buffer. It
//! reacts to user commands, recognition events, finished background stages
//! and its own timers. Generation and synthesis run as spawned tasks whose
//! results come back tagged with the turn that started them; anything from an
//! older turn is discarded.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::collaborators::{ChatMessage, Generator, MessageRole, MessageStore, Session, Synthesizer};
use super::state::{ConversationState, LiveTranscript};
use crate::asr::{AsrEvent, RecognitionEngine, TaskOptions};
use crate::config::{Config, ConversationConfig, RoleConfig};
use crate::voice::AudioSource;
use crate::{Error, Result};

/// Title length for sessions named after their first utterance
const TITLE_CHARS: usize = 40;

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub conversation: ConversationConfig,
    /// Parameters for every recognition task
    pub task: TaskOptions,
    pub role: RoleConfig,
    /// Session to continue; a new one is created on first message otherwise
    pub session_id: Option<String>,
}

impl OrchestratorConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            conversation: config.conversation.clone(),
            task: TaskOptions {
                target_lang: config.asr.target_lang.clone(),
                max_end_silence_ms: config.asr.max_end_silence_ms,
            },
            role: config.llm.role.clone(),
            session_id: None,
        }
    }
}

/// Services the orchestrator calls out to
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub store: Arc<dyn MessageStore>,
}

enum Command {
    StartListening,
    Cancel,
    PauseSpeech,
    ResumeSpeech,
    StopSpeech,
    NewSession(oneshot::Sender<Result<Session>>),
    SwitchSession(String, oneshot::Sender<Result<()>>),
    ListSessions(oneshot::Sender<Result<Vec<Session>>>),
    Shutdown,
}

enum StageOutcome {
    Generated(Result<String>),
    Spoken(Result<()>),
}

struct StageResult {
    turn: u64,
    outcome: StageOutcome,
}

/// Cloneable control surface for a running [`Orchestrator`]
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConversationState>,
    status: watch::Receiver<Option<String>>,
    transcript: watch::Receiver<LiveTranscript>,
}

impl OrchestratorHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::Stopped)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    /// Begin a turn (also interrupts a reply being spoken)
    ///
    /// # Errors
    ///
    /// Returns `Error::Stopped` if the loop has exited
    pub fn start_listening(&self) -> Result<()> {
        self.send(Command::StartListening)
    }

    /// Abandon the current turn and return to idle
    ///
    /// # Errors
    ///
    /// Returns `Error::Stopped` if the loop has exited
    pub fn cancel(&self) -> Result<()> {
        self.send(Command::Cancel)
    }

    /// # Errors
    ///
    /// Returns `Error::Stopped` if the loop has exited
    pub fn pause_speech(&self) -> Result<()> {
        self.send(Command::PauseSpeech)
    }

    /// # Errors
    ///
    /// Returns `Error::Stopped` if the loop has exited
    pub fn resume_speech(&self) -> Result<()> {
        self.send(Command::ResumeSpeech)
    }

    /// Stop the spoken reply and go idle
    ///
    /// # Errors
    ///
    /// Returns `Error::Stopped` if the loop has exited
    pub fn stop_speech(&self) -> Result<()> {
        self.send(Command::StopSpeech)
    }

    /// Start a fresh session with empty history
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` unless idle
    pub async fn new_session(&self) -> Result<Session> {
        self.request(Command::NewSession).await
    }

    /// Continue a stored session
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` unless idle, `Error::NotFound` for an unknown id
    pub async fn switch_session(&self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        self.request(|reply| Command::SwitchSession(id, reply)).await
    }

    /// # Errors
    ///
    /// Returns `Error::Busy` unless idle
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.request(Command::ListSessions).await
    }

    /// Close the conversation and the recognition connection
    ///
    /// # Errors
    ///
    /// Returns `Error::Stopped` if the loop has already exited
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConversationState {
        self.state.borrow().clone()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.state.clone()
    }

    /// Watch the transient status message
    #[must_use]
    pub fn status(&self) -> watch::Receiver<Option<String>> {
        self.status.clone()
    }

    /// Watch the live transcript of the current utterance
    #[must_use]
    pub fn transcript(&self) -> watch::Receiver<LiveTranscript> {
        self.transcript.clone()
    }
}

/// Drives record → recognize → generate → speak turns
pub struct Orchestrator {
    config: OrchestratorConfig,
    engine: RecognitionEngine,
    asr_events: mpsc::UnboundedReceiver<AsrEvent>,
    source: Box<dyn AudioSource>,
    generator: Arc<dyn Generator>,
    synthesizer: Arc<dyn Synthesizer>,
    store: Arc<dyn MessageStore>,

    commands: mpsc::UnboundedReceiver<Command>,
    stage_tx: mpsc::UnboundedSender<StageResult>,
    stage_rx: mpsc::UnboundedReceiver<StageResult>,

    state: watch::Sender<ConversationState>,
    status: watch::Sender<Option<String>>,
    transcript: watch::Sender<LiveTranscript>,

    turn: u64,
    active_task: Option<String>,
    partial: String,
    stage: Option<JoinHandle<()>>,
    session_id: Option<String>,
    history: Vec<ChatMessage>,

    recovery_at: Option<Instant>,
    status_clear_at: Option<Instant>,
}

impl Orchestrator {
    /// Assemble an orchestrator and its handle
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        engine: RecognitionEngine,
        asr_events: mpsc::UnboundedReceiver<AsrEvent>,
        source: Box<dyn AudioSource>,
        collaborators: Collaborators,
    ) -> (Self, OrchestratorHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (stage_tx, stage_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConversationState::Idle);
        let (status, status_rx) = watch::channel(None);
        let (transcript, transcript_rx) = watch::channel(LiveTranscript::default());

        let session_id = config.session_id.clone();
        let history = session_id
            .as_deref()
            .map(|id| {
                collaborators.store.load_messages(id).unwrap_or_else(|e| {
                    tracing::warn!(session_id = id, error = %e, "failed to load session history");
                    Vec::new()
                })
            })
            .unwrap_or_default();

        let orchestrator = Self {
            config,
            engine,
            asr_events,
            source,
            generator: collaborators.generator,
            synthesizer: collaborators.synthesizer,
            store: collaborators.store,
            commands,
            stage_tx,
            stage_rx,
            state,
            status,
            transcript,
            turn: 0,
            active_task: None,
            partial: String::new(),
            stage: None,
            session_id,
            history,
            recovery_at: None,
            status_clear_at: None,
        };

        let handle = OrchestratorHandle {
            commands: commands_tx,
            state: state_rx,
            status: status_rx,
            transcript: transcript_rx,
        };

        (orchestrator, handle)
    }

    /// Run until shutdown is requested or every handle is dropped
    pub async fn run(mut self) {
        tracing::info!(continuous = self.config.conversation.continuous, "conversation loop started");

        loop {
            let recovery = self.recovery_at;
            let status_clear = self.status_clear_at;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.asr_events.recv() => self.handle_asr_event(event).await,
                Some(result) = self.stage_rx.recv() => self.handle_stage(result).await,
                () = wait_until(recovery) => self.recover(),
                () = wait_until(status_clear) => self.clear_status(),
            }
        }

        self.cleanup().await;
        self.engine.disconnect().await;
        self.set_state(ConversationState::Idle);
        tracing::info!("conversation loop stopped");
    }

    fn current_state(&self) -> ConversationState {
        self.state.borrow().clone()
    }

    fn set_state(&self, next: ConversationState) {
        let current = self.current_state();
        if current == next {
            return;
        }
        if !current.allows(&next) {
            tracing::warn!(from = %current, to = %next, "unexpected state transition");
        }
        tracing::debug!(from = %current, to = %next, turn = self.turn, "state changed");
        self.state.send_replace(next);
    }

    fn set_status(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(status = %message, "status");
        self.status.send_replace(Some(message));
        self.status_clear_at = Some(Instant::now() + self.config.conversation.status_clear_delay);
    }

    fn clear_status(&mut self) {
        self.status_clear_at = None;
        self.status.send_replace(None);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartListening => self.start_listening().await,
            Command::Cancel => self.cancel().await,
            Command::PauseSpeech => {
                if self.current_state() == ConversationState::Speaking {
                    self.synthesizer.pause();
                }
            }
            Command::ResumeSpeech => {
                if self.current_state() == ConversationState::Speaking {
                    self.synthesizer.resume();
                }
            }
            Command::StopSpeech => self.stop_speech(),
            Command::NewSession(reply) => {
                let result = self.ensure_idle().and_then(|()| self.new_session());
                let _ = reply.send(result);
            }
            Command::SwitchSession(id, reply) => {
                let result = self.ensure_idle().and_then(|()| self.switch_session(&id));
                let _ = reply.send(result);
            }
            Command::ListSessions(reply) => {
                let result = self.ensure_idle().and_then(|()| self.store.list_sessions());
                let _ = reply.send(result);
            }
            Command::Shutdown => {}
        }
    }

    async fn start_listening(&mut self) {
        match self.current_state() {
            ConversationState::Idle => {}
            ConversationState::Speaking => {
                tracing::info!("interrupting reply to listen");
                self.synthesizer.stop();
                self.abort_stage();
            }
            other => {
                tracing::debug!(state = %other, "ignoring start while busy");
                return;
            }
        }
        self.begin_turn().await;
    }

    async fn begin_turn(&mut self) {
        self.turn += 1;
        self.partial.clear();
        self.transcript.send_replace(LiveTranscript::default());
        self.set_state(ConversationState::Recording);

        if let Err(e) = self.open_recording().await {
            self.fail(e).await;
        }
    }

    async fn open_recording(&mut self) -> Result<()> {
        self.engine.connect().await?;
        let task_id = self.engine.start_task(&self.config.task).await?;
        self.active_task = Some(task_id.clone());

        let sink = self.engine.audio_sink()?;
        self.source.start(Arc::new(sink))?;

        tracing::info!(task_id = %task_id, turn = self.turn, "listening");
        Ok(())
    }

    async fn cancel(&mut self) {
        let state = self.current_state();
        if !state.is_busy() {
            tracing::debug!(state = %state, "nothing to cancel");
            return;
        }

        tracing::info!(state = %state, turn = self.turn, "turn cancelled");
        self.cleanup().await;
        self.set_state(ConversationState::Idle);
        self.set_status("Cancelled");
    }

    fn stop_speech(&mut self) {
        if self.current_state() != ConversationState::Speaking {
            return;
        }
        self.synthesizer.stop();
        self.abort_stage();
        self.turn += 1;
        self.set_state(ConversationState::Idle);
    }

    fn abort_stage(&mut self) {
        if let Some(stage) = self.stage.take() {
            stage.abort();
        }
    }

    /// Release everything the current turn holds
    async fn cleanup(&mut self) {
        // Results of the abandoned turn are ignored from here on
        self.turn += 1;
        self.active_task = None;
        self.partial.clear();

        self.synthesizer.stop();
        self.abort_stage();
        self.source.stop();

        if self.engine.task_state().is_open()
            && let Err(e) = self.engine.finish_task().await
        {
            tracing::debug!(error = %e, "finishing task during cleanup");
        }
    }

    async fn fail(&mut self, error: Error) {
        tracing::error!(error = %error, turn = self.turn, state = %self.current_state(), "conversation turn failed");

        self.cleanup().await;
        self.set_status(describe(&error));
        self.set_state(ConversationState::Error(error.to_string()));
        self.recovery_at = Some(Instant::now() + self.config.conversation.recovery_delay);
    }

    fn recover(&mut self) {
        self.recovery_at = None;
        if matches!(self.current_state(), ConversationState::Error(_)) {
            self.set_state(ConversationState::Idle);
        }
    }

    async fn handle_asr_event(&mut self, event: AsrEvent) {
        if self.active_task.as_deref() != Some(event.task_id()) {
            tracing::trace!(task_id = event.task_id(), "ignoring event outside the active task");
            return;
        }

        match event {
            AsrEvent::TaskStarted { .. } => {}
            AsrEvent::Transcript { fragment, .. } => {
                self.transcript.send_replace(LiveTranscript {
                    text: fragment.text.clone(),
                    is_final: fragment.is_final,
                    translation: None,
                });
                if fragment.is_final {
                    self.complete_utterance(fragment.text).await;
                } else {
                    self.partial = fragment.text;
                }
            }
            AsrEvent::Translation { fragment, .. } => {
                tracing::debug!(lang = %fragment.lang, text = %fragment.text, "translation");
                self.transcript.send_modify(|live| live.translation = Some(fragment.text));
            }
            AsrEvent::TaskFinished { .. } => {
                // Service closed the task without a final sentence
                let text = std::mem::take(&mut self.partial);
                self.complete_utterance(text).await;
            }
            AsrEvent::TaskFailed { code, message, .. } => {
                self.active_task = None;
                self.fail(Error::RemoteTask { code, message }).await;
            }
            AsrEvent::ConnectionLost { reason, .. } => {
                self.active_task = None;
                self.fail(Error::Transport(reason)).await;
            }
        }
    }

    async fn complete_utterance(&mut self, text: String) {
        self.active_task = None;
        self.partial.clear();
        self.set_state(ConversationState::Recognizing);

        self.source.stop();
        match self.engine.finish_task().await {
            Ok(()) | Err(Error::NoActiveTask) => {}
            Err(e) => tracing::debug!(error = %e, "finishing recognition task"),
        }

        let text = text.trim().to_string();
        if text.is_empty() {
            tracing::info!(turn = self.turn, "nothing recognized");
            self.set_state(ConversationState::Idle);
            self.set_status("Nothing recognized");
            return;
        }

        tracing::info!(turn = self.turn, text = %text, "utterance recognized");
        let history = self.history.clone();
        self.persist(MessageRole::User, &text);
        self.history.push(ChatMessage::user(text.clone()));

        self.set_state(ConversationState::Thinking);
        self.spawn_generation(text, history);
    }

    fn spawn_generation(&mut self, user_text: String, history: Vec<ChatMessage>) {
        let generator = Arc::clone(&self.generator);
        let role = self.config.role.clone();
        let results = self.stage_tx.clone();
        let turn = self.turn;

        self.stage = Some(tokio::spawn(async move {
            let outcome = generator.generate(&user_text, &history, &role).await;
            let _ = results.send(StageResult {
                turn,
                outcome: StageOutcome::Generated(outcome),
            });
        }));
    }

    fn spawn_synthesis(&mut self, text: String) {
        let synthesizer = Arc::clone(&self.synthesizer);
        let results = self.stage_tx.clone();
        let turn = self.turn;

        self.stage = Some(tokio::spawn(async move {
            let outcome = synthesizer.speak(&text).await;
            let _ = results.send(StageResult {
                turn,
                outcome: StageOutcome::Spoken(outcome),
            });
        }));
    }

    async fn handle_stage(&mut self, result: StageResult) {
        if result.turn != self.turn {
            tracing::debug!(stale = result.turn, current = self.turn, "discarding stale stage result");
            return;
        }
        self.stage = None;

        match result.outcome {
            StageOutcome::Generated(Ok(reply)) => {
                let reply = reply.trim().to_string();
                if reply.is_empty() {
                    self.fail(Error::Generation("empty reply".to_string())).await;
                    return;
                }

                tracing::info!(turn = self.turn, chars = reply.chars().count(), "reply generated");
                self.persist(MessageRole::Assistant, &reply);
                self.history.push(ChatMessage::assistant(reply.clone()));

                self.set_state(ConversationState::Speaking);
                self.spawn_synthesis(reply);
            }
            StageOutcome::Spoken(Ok(())) => {
                tracing::debug!(turn = self.turn, "reply spoken");
                if self.config.conversation.continuous {
                    self.begin_turn().await;
                } else {
                    self.set_state(ConversationState::Idle);
                }
            }
            StageOutcome::Generated(Err(e)) | StageOutcome::Spoken(Err(e)) => self.fail(e).await,
        }
    }

    /// Store a message; failures are reported but do not end the turn
    fn persist(&mut self, role: MessageRole, content: &str) {
        let session_id = match &self.session_id {
            Some(id) => id.clone(),
            None => {
                let title: String = content.chars().take(TITLE_CHARS).collect();
                match self.store.create_session(&title) {
                    Ok(session) => {
                        tracing::info!(session_id = %session.id, "session created");
                        self.session_id = Some(session.id.clone());
                        session.id
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to create session");
                        self.set_status("Conversation not saved");
                        return;
                    }
                }
            }
        };

        if let Err(e) = self.store.save_message(&session_id, role, content) {
            tracing::warn!(session_id = %session_id, role = role.as_str(), error = %e, "failed to save message");
            self.set_status("Conversation not saved");
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.current_state() {
            ConversationState::Idle => Ok(()),
            other => Err(Error::Busy(other.label().to_string())),
        }
    }

    fn new_session(&mut self) -> Result<Session> {
        let session = self.store.create_session("New conversation")?;
        tracing::info!(session_id = %session.id, "new session");
        self.session_id = Some(session.id.clone());
        self.history.clear();
        Ok(session)
    }

    fn switch_session(&mut self, id: &str) -> Result<()> {
        if !self.store.list_sessions()?.iter().any(|s| s.id == id) {
            return Err(Error::NotFound(format!("session {id}")));
        }
        self.history = self.store.load_messages(id)?;
        self.session_id = Some(id.to_string());
        tracing::info!(session_id = id, messages = self.history.len(), "switched session");
        Ok(())
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Short user-facing description of a failure
fn describe(error: &Error) -> String {
    match error {
        Error::Config(_) => "API key not configured".to_string(),
        Error::PermissionDenied(_) => "Microphone access denied".to_string(),
        Error::TaskStartTimeout(_) => "Recognition service did not respond".to_string(),
        e if e.is_connection_loss() => "Lost connection to recognition service".to_string(),
        e if e.is_task_lifecycle() => format!("Recognition interrupted: {e}"),
        other => other.to_string(),
    }
}
