//! Conversation turn states

use std::fmt;

/// Where the conversation loop is in the current turn
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConversationState {
    #[default]
    Idle,
    /// Capturing audio into an open recognition task
    Recording,
    /// Utterance complete, closing out the task
    Recognizing,
    /// Waiting on the language model
    Thinking,
    /// Playing the synthesized reply
    Speaking,
    /// A stage failed; returns to idle after the recovery delay
    Error(String),
}

impl ConversationState {
    /// Whether a turn is in progress
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Recording | Self::Recognizing | Self::Thinking | Self::Speaking
        )
    }

    /// Short lowercase name
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Recognizing => "recognizing",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Error(_) => "error",
        }
    }

    /// Whether moving to `next` follows the turn cycle
    #[must_use]
    pub const fn allows(&self, next: &Self) -> bool {
        match (self, next) {
            (_, Self::Error(_)) => true,
            (Self::Idle, Self::Recording)
            | (Self::Recording, Self::Recognizing | Self::Idle)
            | (Self::Recognizing, Self::Thinking | Self::Idle)
            | (Self::Thinking, Self::Speaking | Self::Idle)
            | (Self::Speaking, Self::Recording | Self::Idle)
            | (Self::Error(_), Self::Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(cause) => write!(f, "error: {cause}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Most recent recognition output, for display
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveTranscript {
    pub text: String,
    pub is_final: bool,
    pub translation: Option<String>,
}
