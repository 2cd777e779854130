//! Wire messages for the duplex recognition protocol
//!
//! Control messages are JSON text frames; audio travels as raw binary frames
//! of 16 kHz mono little-endian PCM.

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::voice::SAMPLE_RATE;

/// Per-task recognition parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    /// Translation target language (e.g. "en")
    pub target_lang: String,
    /// Trailing silence that ends the sentence, in milliseconds
    pub max_end_silence_ms: u32,
}

/// An incremental recognition result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    pub is_final: bool,
}

impl Fragment {
    #[must_use]
    pub fn new(text: impl Into<String>, is_final: bool) -> Self {
        Self {
            text: text.into(),
            is_final,
        }
    }
}

/// An incremental translation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationFragment {
    pub lang: String,
    pub text: String,
    pub is_final: bool,
}

/// Client → server control message
#[derive(Debug, Clone, Serialize)]
pub struct ControlMessage {
    header: RequestHeader,
    payload: RequestPayload,
}

#[derive(Debug, Clone, Serialize)]
struct RequestHeader {
    action: Action,
    task_id: String,
    streaming: &'static str,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "kebab-case")]
enum Action {
    RunTask,
    FinishTask,
}

#[derive(Debug, Clone, Serialize)]
struct RequestPayload {
    task_group: &'static str,
    task: &'static str,
    function: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    input: TaskInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<TaskParameters>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct TaskInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    translation: Option<TranslationTarget>,
}

#[derive(Debug, Clone, Serialize)]
struct TranslationTarget {
    target_lang: String,
    source_lang: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct TaskParameters {
    max_end_silence: u32,
    enable_inverse_text_normalization: bool,
}

impl ControlMessage {
    /// Build the `run-task` message that opens a recognition task
    #[must_use]
    pub fn run_task(task_id: &str, model: &str, options: &TaskOptions) -> Self {
        Self {
            header: RequestHeader {
                action: Action::RunTask,
                task_id: task_id.to_string(),
                streaming: "duplex",
            },
            payload: RequestPayload {
                task_group: "audio",
                task: "asr",
                function: "recognition",
                model: Some(model.to_string()),
                input: TaskInput {
                    format: Some("pcm"),
                    sample_rate: Some(SAMPLE_RATE),
                    audio_type: Some("sentence"),
                    translation: Some(TranslationTarget {
                        target_lang: options.target_lang.clone(),
                        source_lang: "auto",
                    }),
                },
                parameters: Some(TaskParameters {
                    max_end_silence: options.max_end_silence_ms,
                    enable_inverse_text_normalization: true,
                }),
            },
        }
    }

    /// Build the `finish-task` message that ends a recognition task
    #[must_use]
    pub fn finish_task(task_id: &str) -> Self {
        Self {
            header: RequestHeader {
                action: Action::FinishTask,
                task_id: task_id.to_string(),
                streaming: "duplex",
            },
            payload: RequestPayload {
                task_group: "audio",
                task: "asr",
                function: "recognition",
                model: None,
                input: TaskInput::default(),
                parameters: None,
            },
        }
    }

    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    header: InboundHeader,
    #[serde(default)]
    payload: InboundPayload,
}

#[derive(Debug, Deserialize)]
struct InboundHeader {
    event: String,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InboundPayload {
    #[serde(default)]
    output: Option<RecognitionOutput>,
}

#[derive(Debug, Default, Deserialize)]
struct RecognitionOutput {
    #[serde(default)]
    transcription: Option<Sentence>,
    #[serde(default)]
    translations: Vec<TranslatedSentence>,
}

#[derive(Debug, Deserialize)]
struct Sentence {
    #[serde(default)]
    text: String,
    #[serde(default)]
    sentence_end: bool,
}

#[derive(Debug, Deserialize)]
struct TranslatedSentence {
    #[serde(default)]
    lang: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    sentence_end: bool,
}

/// Server → client event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    TaskStarted {
        task_id: Option<String>,
    },
    ResultGenerated {
        task_id: Option<String>,
        transcript: Option<Fragment>,
        translations: Vec<TranslationFragment>,
    },
    TaskFinished {
        task_id: Option<String>,
    },
    TaskFailed {
        task_id: Option<String>,
        code: String,
        message: String,
    },
    /// Event name this client does not handle
    Other(String),
}

impl ServerEvent {
    /// Parse a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a valid event envelope
    pub fn parse(text: &str) -> Result<Self> {
        let msg: InboundMessage = serde_json::from_str(text)?;
        let InboundHeader {
            event,
            task_id,
            error_code,
            error_message,
        } = msg.header;

        let parsed = match event.as_str() {
            "task-started" => Self::TaskStarted { task_id },
            "task-finished" => Self::TaskFinished { task_id },
            "task-failed" => Self::TaskFailed {
                task_id,
                code: error_code.unwrap_or_else(|| "UNKNOWN".to_string()),
                message: error_message.unwrap_or_default(),
            },
            "result-generated" => {
                let output = msg.payload.output.unwrap_or_default();
                Self::ResultGenerated {
                    task_id,
                    transcript: output
                        .transcription
                        .map(|s| Fragment::new(s.text, s.sentence_end)),
                    translations: output
                        .translations
                        .into_iter()
                        .map(|t| TranslationFragment {
                            lang: t.lang,
                            text: t.text,
                            is_final: t.sentence_end,
                        })
                        .collect(),
                }
            }
            _ => Self::Other(event),
        };

        Ok(parsed)
    }

    /// Task id carried in the event header
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskStarted { task_id }
            | Self::TaskFinished { task_id }
            | Self::ResultGenerated { task_id, .. }
            | Self::TaskFailed { task_id, .. } => task_id.as_deref(),
            Self::Other(_) => None,
        }
    }
}
