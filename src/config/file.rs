//! TOML configuration file loading
//!
//! Supports `~/.config/parley/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ParleyConfigFile {
    /// DashScope API key (prefer the `DASHSCOPE_API_KEY` env var)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Data directory override
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub asr: AsrFileConfig,

    #[serde(default)]
    pub audio: AudioFileConfig,

    #[serde(default)]
    pub llm: LlmFileConfig,

    #[serde(default)]
    pub tts: TtsFileConfig,

    #[serde(default)]
    pub conversation: ConversationFileConfig,
}

/// Streaming recognition settings
#[derive(Debug, Default, Deserialize)]
pub struct AsrFileConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub target_lang: Option<String>,
    pub max_end_silence_ms: Option<u32>,
    pub heartbeat_secs: Option<u64>,
    pub start_timeout_ms: Option<u64>,
    pub finish_timeout_ms: Option<u64>,
}

/// Capture settings
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Input device name (substring match)
    pub device: Option<String>,
    /// Bytes per frame sent to the recognizer
    pub frame_bytes: Option<usize>,
}

/// Language model settings
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub role_name: Option<String>,
    pub max_history: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
}

/// Speech synthesis settings
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub language_type: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Turn-taking settings
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    /// Restart listening after each spoken reply
    pub continuous: Option<bool>,
    pub recovery_delay_ms: Option<u64>,
    pub status_clear_ms: Option<u64>,
}

impl ParleyConfigFile {
    /// Read and parse a config file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not valid TOML
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let parsed = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(parsed)
    }

    /// Default config file location
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "parley", "parley")
            .map(|d| d.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let parsed: ParleyConfigFile = toml::from_str(
            r#"
            [asr]
            target_lang = "ja"
            max_end_silence_ms = 800

            [conversation]
            continuous = false
            "#,
        )
        .unwrap();

        assert_eq!(parsed.asr.target_lang.as_deref(), Some("ja"));
        assert_eq!(parsed.asr.max_end_silence_ms, Some(800));
        assert_eq!(parsed.conversation.continuous, Some(false));
        assert!(parsed.llm.model.is_none());
        assert!(parsed.api_key.is_none());
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let parsed: ParleyConfigFile = toml::from_str("").unwrap();
        assert!(parsed.asr.url.is_none());
        assert!(parsed.tts.voice.is_none());
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[tts]\nvoice = \"Ethan\"\n").unwrap();

        let parsed = ParleyConfigFile::load(&path).unwrap();
        assert_eq!(parsed.tts.voice.as_deref(), Some("Ethan"));
    }
}
