//! Streaming speech recognition over a duplex connection
//!
//! [`RecognitionEngine`] manages one long-lived connection and at most one
//! recognition task on it at a time. Results are delivered as [`AsrEvent`]s.

mod engine;
pub mod protocol;
pub mod transport;

pub use engine::{AsrEvent, AudioSink, ConnectionState, RecognitionEngine, TaskState};
pub use protocol::{Fragment, TaskOptions, TranslationFragment};
pub use transport::{Connector, WebSocketConnector, WireMessage};

/// In-process loopback for exercising the engine without a network; test
/// support only, the binary always connects through [`WebSocketConnector`]
pub use transport::{MemoryConnector, ServerEnd};
