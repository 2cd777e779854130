//! Configuration management for parley
//!
//! Values are resolved in order: built-in defaults, the TOML overlay file,
//! then environment variables.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::Result;
use file::ParleyConfigFile;

/// Default DashScope duplex inference endpoint
pub const DEFAULT_ASR_URL: &str = "wss://dashscope.aliyuncs.com/api-ws/v1/inference";

/// Default OpenAI-compatible chat completions endpoint
pub const DEFAULT_LLM_URL: &str =
    "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions";

/// Default multimodal generation endpoint used for speech synthesis
pub const DEFAULT_TTS_URL: &str =
    "https://dashscope.aliyuncs.com/api/v1/services/aigc/multimodal-generation/generation";

/// parley configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// DashScope API key shared by recognition, chat and synthesis
    pub api_key: Option<SecretString>,

    /// Path to data directory (conversation database)
    pub data_dir: PathBuf,

    /// Streaming recognition configuration
    pub asr: AsrConfig,

    /// Capture configuration
    pub audio: AudioConfig,

    /// Language model configuration
    pub llm: LlmConfig,

    /// Speech synthesis configuration
    pub tts: TtsConfig,

    /// Turn-taking configuration
    pub conversation: ConversationConfig,
}

/// Streaming recognition configuration
#[derive(Debug, Clone)]
pub struct AsrConfig {
    /// WebSocket endpoint
    pub url: String,

    /// Recognition model (e.g. "gummy-chat-v1")
    pub model: String,

    /// Translation target language passed to each task
    pub target_lang: String,

    /// Trailing silence that ends a sentence, in milliseconds
    pub max_end_silence_ms: u32,

    /// Keepalive ping interval
    pub heartbeat_interval: Duration,

    /// Bound on waiting for `task-started`
    pub start_timeout: Duration,

    /// Best-effort wait for `task-finished`
    pub finish_timeout: Duration,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ASR_URL.to_string(),
            model: "gummy-chat-v1".to_string(),
            target_lang: "en".to_string(),
            max_end_silence_ms: 700,
            heartbeat_interval: Duration::from_secs(30),
            start_timeout: Duration::from_secs(5),
            finish_timeout: Duration::from_secs(1),
        }
    }
}

/// Capture configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Input device name; default device when unset
    pub device: Option<String>,

    /// Bytes per frame (3200 = 100 ms of 16 kHz mono 16-bit)
    pub frame_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            frame_bytes: crate::voice::DEFAULT_FRAME_BYTES,
        }
    }
}

/// Language model configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Chat completions endpoint
    pub url: String,

    /// Model identifier
    pub model: String,

    /// Assistant role used for every turn
    pub role: RoleConfig,

    /// Most recent history messages sent with each request
    pub max_history: usize,

    /// Per-request timeout
    pub timeout: Duration,

    /// Retries on transient failures
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_LLM_URL.to_string(),
            model: "qwen-plus".to_string(),
            role: RoleConfig::default(),
            max_history: 20,
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// Assistant role passed to the generation collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleConfig {
    /// Display name
    pub name: String,

    /// System prompt
    pub system_prompt: String,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            name: "Assistant".to_string(),
            system_prompt: "You are a friendly voice assistant. Replies are spoken aloud, \
                            so keep them short and conversational and avoid markdown."
                .to_string(),
        }
    }
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Synthesis endpoint
    pub url: String,

    /// Synthesis model
    pub model: String,

    /// Voice identifier
    pub voice: String,

    /// Language hint for the synthesizer
    pub language_type: String,

    /// Request timeout (synthesis and audio download)
    pub timeout: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_TTS_URL.to_string(),
            model: "qwen3-tts-flash".to_string(),
            voice: "Cherry".to_string(),
            language_type: "Auto".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Turn-taking configuration
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Restart listening after each spoken reply
    pub continuous: bool,

    /// Time spent in the error state before returning to idle
    pub recovery_delay: Duration,

    /// Lifetime of transient status messages
    pub status_clear_delay: Duration,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            continuous: true,
            recovery_delay: Duration::from_secs(3),
            status_clear_delay: Duration::from_secs(3),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            data_dir: default_data_dir(),
            asr: AsrConfig::default(),
            audio: AudioConfig::default(),
            llm: LlmConfig::default(),
            tts: TtsConfig::default(),
            conversation: ConversationConfig::default(),
        }
    }
}

/// Return the data directory (`~/.local/share/parley` on Linux)
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "parley", "parley")
        .map_or_else(|| PathBuf::from(".parley"), |d| d.data_dir().to_path_buf())
}

impl Config {
    /// Load configuration from an explicit file, the default file location,
    /// and the environment
    ///
    /// # Errors
    ///
    /// Returns error if an explicitly given config file cannot be loaded
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => ParleyConfigFile::load(p)?,
            None => ParleyConfigFile::default_path()
                .filter(|p| p.exists())
                .map(|p| {
                    ParleyConfigFile::load(&p).unwrap_or_else(|e| {
                        tracing::warn!(path = %p.display(), error = %e, "ignoring unreadable config file");
                        ParleyConfigFile::default()
                    })
                })
                .unwrap_or_default(),
        };

        let mut config = Self::default();
        config.apply_file(file);
        config.apply_env();

        if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
            tracing::warn!(
                path = %config.data_dir.display(),
                error = %e,
                "failed to create data directory"
            );
        }

        Ok(config)
    }

    /// Overlay values present in the config file
    pub fn apply_file(&mut self, file: ParleyConfigFile) {
        if let Some(key) = file.api_key.filter(|k| !k.is_empty()) {
            self.api_key = Some(SecretString::from(key));
        }
        if let Some(dir) = file.data_dir {
            self.data_dir = dir;
        }

        let asr = file.asr;
        if let Some(v) = asr.url {
            self.asr.url = v;
        }
        if let Some(v) = asr.model {
            self.asr.model = v;
        }
        if let Some(v) = asr.target_lang {
            self.asr.target_lang = v;
        }
        if let Some(v) = asr.max_end_silence_ms {
            self.asr.max_end_silence_ms = v;
        }
        if let Some(v) = asr.heartbeat_secs {
            self.asr.heartbeat_interval = Duration::from_secs(v.max(1));
        }
        if let Some(v) = asr.start_timeout_ms {
            self.asr.start_timeout = Duration::from_millis(v);
        }
        if let Some(v) = asr.finish_timeout_ms {
            self.asr.finish_timeout = Duration::from_millis(v);
        }

        if let Some(v) = file.audio.device {
            self.audio.device = Some(v);
        }
        if let Some(v) = file.audio.frame_bytes {
            // Keep frames sample-aligned
            self.audio.frame_bytes = (v.max(2) / 2) * 2;
        }

        let llm = file.llm;
        if let Some(v) = llm.url {
            self.llm.url = v;
        }
        if let Some(v) = llm.model {
            self.llm.model = v;
        }
        if let Some(v) = llm.system_prompt {
            self.llm.role.system_prompt = v;
        }
        if let Some(v) = llm.role_name {
            self.llm.role.name = v;
        }
        if let Some(v) = llm.max_history {
            self.llm.max_history = v;
        }
        if let Some(v) = llm.timeout_secs {
            self.llm.timeout = Duration::from_secs(v);
        }
        if let Some(v) = llm.max_retries {
            self.llm.max_retries = v;
        }

        let tts = file.tts;
        if let Some(v) = tts.url {
            self.tts.url = v;
        }
        if let Some(v) = tts.model {
            self.tts.model = v;
        }
        if let Some(v) = tts.voice {
            self.tts.voice = v;
        }
        if let Some(v) = tts.language_type {
            self.tts.language_type = v;
        }
        if let Some(v) = tts.timeout_secs {
            self.tts.timeout = Duration::from_secs(v);
        }

        let conv = file.conversation;
        if let Some(v) = conv.continuous {
            self.conversation.continuous = v;
        }
        if let Some(v) = conv.recovery_delay_ms {
            self.conversation.recovery_delay = Duration::from_millis(v);
        }
        if let Some(v) = conv.status_clear_ms {
            self.conversation.status_clear_delay = Duration::from_millis(v);
        }
    }

    /// Overlay values from environment variables
    pub fn apply_env(&mut self) {
        if let Some(key) = std::env::var("DASHSCOPE_API_KEY").ok().filter(|k| !k.is_empty()) {
            self.api_key = Some(SecretString::from(key));
        }
        if let Ok(dir) = std::env::var("PARLEY_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(v) = std::env::var("PARLEY_TARGET_LANG") {
            self.asr.target_lang = v;
        }
        if let Ok(v) = std::env::var("PARLEY_ASR_MODEL") {
            self.asr.model = v;
        }
        if let Ok(v) = std::env::var("PARLEY_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("PARLEY_TTS_VOICE") {
            self.tts.voice = v;
        }
        if let Ok(v) = std::env::var("PARLEY_AUDIO_DEVICE") {
            self.audio.device = Some(v);
        }
    }

    /// Path to the conversation database
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("parley.db")
    }
}
