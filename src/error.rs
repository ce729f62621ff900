//! # Error Handling
//!
//! Error types for the gateway, grouped by how far a failure is allowed to travel.
//!
//! ## Error Classes:
//! - **Per-chunk / per-message**: malformed control text, duplicate transcripts and
//!   sends to a peer that already left. Logged, never fatal.
//! - **Session init**: the recognizer could not be constructed. The session is never
//!   published and the peer gets no `ready`.
//! - **Resource**: the capture file could not be opened or written. Capture is
//!   switched off for that session only.
//! - **Process-fatal**: startup failures (config, directories, model load). These
//!   surface as `anyhow::Error` from `main` and abort before the listener binds.
//!
//! Every variant that belongs to a session is logged with the session id as the
//! correlation key by the caller; the types themselves stay free of logging.

use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by the speech-recognition engine.
#[derive(Debug, Error)]
pub enum RecognitionError {
    /// The shared model could not be loaded from disk.
    #[error("failed to load recognition model from {path}")]
    ModelLoad { path: String },

    /// A per-session recognizer could not be minted from the shared model.
    #[error("failed to construct recognizer: {0}")]
    Construct(String),

    /// The engine rejected a chunk of audio.
    #[error("engine rejected audio chunk: {0}")]
    Decode(String),

    /// The binary was built without any recognition backend.
    #[error("no speech recognition engine compiled in; rebuild with `--features vosk`")]
    EngineUnavailable,
}

/// Failures of the diagnostic audio capture sink.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to create capture file {path}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to append to capture file {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to finalize capture file {path}")]
    Finalize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The worker pool no longer accepts work.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool has been shut down")]
    ShutDown,
}

/// A frame could not be delivered to a connection.
///
/// Callers treat this as best-effort noise: the peer most likely disconnected
/// between the moment the work was queued and the moment the reply was ready.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("connection {0} is no longer attached")]
    Disconnected(u64),
}

/// Failure to bring a session up for a new connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("session {session_id} failed to initialize: {source}")]
    SessionInit {
        session_id: String,
        #[source]
        source: RecognitionError,
    },
}

/// Shorthand for results that use [`GatewayError`].
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_init_error_mentions_session_and_cause() {
        let err = GatewayError::SessionInit {
            session_id: "asr-1234".to_string(),
            source: RecognitionError::Construct("out of memory".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("asr-1234"));
        assert!(text.contains("out of memory"));
    }

    #[test]
    fn test_send_error_names_connection() {
        assert_eq!(
            SendError::Disconnected(7).to_string(),
            "connection 7 is no longer attached"
        );
    }
}
