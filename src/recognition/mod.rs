//! # Speech Recognition Contract
//!
//! The gateway treats the engine as a black box: a shared, read-only model mints
//! one recognizer per session, and each recognizer turns PCM chunks into partial
//! or final text.
//!
//! ## Threading Rules:
//! - **Model**: shared by every session (`Send + Sync`). Minting a recognizer goes
//!   through [`SharedModel::construct`], which holds a coarse lock because engines
//!   do not promise that construction is safe to run in parallel.
//! - **Recognizer**: owned by exactly one session and only called while that
//!   session's sequencing turn is held. It is released on `Drop`, so it is freed
//!   exactly once.

#[cfg(feature = "vosk")]
pub mod vosk;

use crate::error::RecognitionError;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// What the engine decided after consuming a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// The utterance is still in progress; read [`Recognizer::current_partial`].
    Partial,
    /// An utterance boundary was detected; read [`Recognizer::current_final`].
    Final,
}

/// Per-session recognizer handle.
pub trait Recognizer: Send {
    /// Feed one chunk of 16-bit mono little-endian PCM.
    fn accept_chunk(&mut self, pcm: &[u8]) -> Result<ChunkStatus, RecognitionError>;

    /// Text of the utterance in progress.
    fn current_partial(&mut self) -> String;

    /// Text of the utterance that just ended.
    fn current_final(&mut self) -> String;

    /// Force the engine to finish whatever it has buffered and return it.
    fn flush_final(&mut self) -> String;
}

/// A loaded acoustic model that can mint recognizers.
pub trait RecognitionModel: Send + Sync {
    fn construct(&self, sample_rate: u32) -> Result<Box<dyn Recognizer>, RecognitionError>;

    /// Short human-readable engine description for logs and `/health`.
    fn describe(&self) -> String;
}

/// The process-wide model plus its construction lock.
#[derive(Clone)]
pub struct SharedModel {
    model: Arc<dyn RecognitionModel>,
    construct_lock: Arc<Mutex<()>>,
}

impl SharedModel {
    pub fn new(model: Arc<dyn RecognitionModel>) -> Self {
        Self {
            model,
            construct_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Mint a recognizer for one session under the construction lock.
    pub fn construct(&self, sample_rate: u32) -> Result<Box<dyn Recognizer>, RecognitionError> {
        let _guard = self
            .construct_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        debug!(sample_rate, "Constructing recognizer");
        self.model.construct(sample_rate)
    }

    pub fn describe(&self) -> String {
        self.model.describe()
    }
}

impl std::fmt::Debug for SharedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedModel")
            .field("engine", &self.model.describe())
            .finish()
    }
}

/// Load the compiled-in engine's model from `path`.
#[cfg(feature = "vosk")]
pub fn load_model(path: &Path) -> Result<SharedModel, RecognitionError> {
    let model = vosk::VoskModel::load(path)?;
    Ok(SharedModel::new(Arc::new(model)))
}

/// Load the compiled-in engine's model from `path`.
#[cfg(not(feature = "vosk"))]
pub fn load_model(path: &Path) -> Result<SharedModel, RecognitionError> {
    debug!(path = %path.display(), "No recognition backend compiled in");
    Err(RecognitionError::EngineUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;
    use std::thread;

    #[test]
    fn test_construction_is_serialized() {
        let scripted = Arc::new(ScriptedModel::default());
        let shared = SharedModel::new(scripted.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || shared.construct(16_000).map(|_| ()))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(scripted.constructed(), 8);
        assert_eq!(scripted.peak_concurrent_constructions(), 1);
    }

    #[test]
    fn test_construction_failure_is_reported() {
        let scripted = Arc::new(ScriptedModel::default());
        scripted.fail_next_construction();
        let shared = SharedModel::new(scripted);
        assert!(matches!(
            shared.construct(16_000),
            Err(RecognitionError::Construct(_))
        ));
    }

    #[cfg(not(feature = "vosk"))]
    #[test]
    fn test_load_without_backend_is_unavailable() {
        let result = load_model(Path::new("/nonexistent"));
        assert!(matches!(result, Err(RecognitionError::EngineUnavailable)));
    }
}
