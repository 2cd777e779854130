//! Conversation orchestration
//!
//! Sequences record → recognize → generate → speak turns over the
//! recognition engine and the collaborator services.

pub mod collaborators;
mod orchestrator;
mod state;

pub use collaborators::{ChatMessage, Generator, MessageRole, MessageStore, Session, Synthesizer};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorConfig, OrchestratorHandle};
pub use state::{ConversationState, LiveTranscript};
