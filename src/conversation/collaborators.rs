//! Boundaries to the generation, synthesis and persistence services

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::config::RoleConfig;

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// One entry of conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// A stored conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Produces the assistant's reply to a user utterance
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a reply to `user_text` given the prior `history`
    ///
    /// # Errors
    ///
    /// Returns `Error::Generation` (or a transport error) if no reply could
    /// be produced
    async fn generate(
        &self,
        user_text: &str,
        history: &[ChatMessage],
        role: &RoleConfig,
    ) -> Result<String>;
}

/// Speaks text aloud
///
/// `pause`, `resume` and `stop` act on the utterance currently playing and
/// must return promptly.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize and play `text`, resolving when playback ends or is stopped
    ///
    /// # Errors
    ///
    /// Returns `Error::Synthesis` or `Error::Audio` on failure
    async fn speak(&self, text: &str) -> Result<()>;

    fn pause(&self);

    fn resume(&self);

    fn stop(&self);

    fn is_speaking(&self) -> bool;
}

/// Persists sessions and their messages
pub trait MessageStore: Send + Sync {
    /// Create a new, empty session
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written
    fn create_session(&self, title: &str) -> Result<Session>;

    /// All sessions, most recently updated first
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    fn list_sessions(&self) -> Result<Vec<Session>>;

    /// Append a message to a session
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown session
    fn save_message(&self, session_id: &str, role: MessageRole, content: &str) -> Result<()>;

    /// Messages of a session in chronological order
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    fn load_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>>;
}
