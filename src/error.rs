//! Error types for parley

use thiserror::Error;

/// Result type alias for parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the conversation client
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing credential, bad value)
    #[error("configuration error: {0}")]
    Config(String),

    /// Duplex channel could not be opened or broke while in use
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation requires a live recognition connection
    #[error("recognition service not connected")]
    NotConnected,

    /// Remote side did not confirm task start in time
    #[error("recognition task did not start within {0} ms")]
    TaskStartTimeout(u64),

    /// Audio was sent while no task was started
    #[error("recognition task not started")]
    TaskNotStarted,

    /// Finish requested while no task was open
    #[error("no active recognition task")]
    NoActiveTask,

    /// A task is already open on the connection
    #[error("recognition task already open: {0}")]
    TaskBusy(String),

    /// Recognition service reported `task-failed`
    #[error("recognition failed ({code}): {message}")]
    RemoteTask {
        /// Service error code
        code: String,
        /// Service error message
        message: String,
    },

    /// Capture device access refused
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Audio device or codec error
    #[error("audio error: {0}")]
    Audio(String),

    /// Language model request failed
    #[error("generation error: {0}")]
    Generation(String),

    /// Speech synthesis or playback failed
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Operation not permitted in the current conversation state
    #[error("conversation busy: {0}")]
    Busy(String),

    /// The conversation loop is no longer running
    #[error("conversation loop stopped")]
    Stopped,

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether this error belongs to the recognition task lifecycle
    #[must_use]
    pub const fn is_task_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::TaskStartTimeout(_) | Self::TaskNotStarted | Self::NoActiveTask | Self::TaskBusy(_)
        )
    }

    /// Whether the recognition connection should be considered gone
    #[must_use]
    pub const fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NotConnected)
    }
}
