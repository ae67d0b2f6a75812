// Common types for the streaming module

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::streaming::source::Frame;

/// Result type for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur during streaming operations
#[derive(Debug, Error)]
pub enum StreamError {
    /// The subscribe call itself was rejected by the event source
    #[error("Setup failed: {0}")]
    Setup(String),

    /// Subscription succeeded but the producer-side start command failed
    #[error("Start command '{command}' failed: {message}")]
    StartCommand { command: String, message: String },

    /// Stop command failed during teardown (logged, never surfaced as state)
    #[error("Stop command '{command}' failed: {message}")]
    StopCommand { command: String, message: String },

    /// A side-command was rejected by the invoker
    #[error("Command '{command}' rejected: {message}")]
    Command { command: String, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel closed")]
    ChannelClosed,

    /// The attempt belongs to a subscription generation that was superseded
    #[error("Subscription superseded")]
    Stale,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Current state of a streaming session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", content = "data")]
pub enum StreamState {
    /// Session is not enabled, or has been stopped
    #[default]
    Idle,

    /// Producer/transport is not present in this environment
    Unavailable,

    /// Subscribed, no frame received yet
    Loading,

    /// At least one frame received
    Ready,

    /// Setup or start command failed
    Error { message: String },
}

impl StreamState {
    pub fn error_message(&self) -> Option<&str> {
        match self {
            StreamState::Error { message } => Some(message),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamState::Error { .. })
    }
}

/// Status surface polled by the UI layer
///
/// `error_message` is `Some` exactly when `state` is `Error`.
#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub state: StreamState,
    pub error_message: Option<String>,
    pub latest: Option<Arc<Frame>>,
}

/// Metadata passed alongside every emitted frame
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EmitMeta {
    pub paused: bool,
    /// Wall-clock receive time (unix millis)
    pub received_at_ms: i64,
}

/// Counters about a streaming session
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionStats {
    pub frames_received: u64,
    pub frames_emitted: u64,
    pub frames_throttled: u64,
    pub frames_paused: u64,
}

/// Events emitted by a session for reactive observers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        session_id: String,
        state: StreamState,
    },
    Error {
        session_id: String,
        error: String,
    },
}
