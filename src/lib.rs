//! parley - hands-free voice conversations over a streaming recognizer
//!
//! This library provides:
//! - A protocol engine for DashScope's duplex streaming recognition service
//! - Microphone and file capture cut into 16 kHz PCM frames
//! - A turn-taking orchestrator: record, recognize, generate, speak
//! - Chat, speech synthesis and SQLite persistence collaborators
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Orchestrator                         │
//! │   commands  │  recognition events  │  stage results   │
//! └──────┬──────────────┬──────────────────────┬─────────┘
//!        │              │                      │
//! ┌──────▼──────┐ ┌─────▼──────────────┐ ┌─────▼─────────┐
//! │   Capture   │─▶ Recognition engine │ │ LLM │ TTS │ DB│
//! │ cpal → PCM  │ │   WebSocket duplex │ │               │
//! └─────────────┘ └────────────────────┘ └───────────────┘
//! ```

pub mod asr;
pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod llm;
pub mod tts;
pub mod voice;

pub use config::Config;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
