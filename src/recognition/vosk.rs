//! Vosk backend (`--features vosk`, links against `libvosk`).

use super::{ChunkStatus, RecognitionModel, Recognizer};
use crate::error::RecognitionError;
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;
use tracing::{debug, info};
use vosk::{DecodingState, Model};

pub struct VoskModel {
    model: Model,
    path: String,
}

impl VoskModel {
    pub fn load(path: &Path) -> Result<Self, RecognitionError> {
        let path = path.display().to_string();
        vosk::set_log_level(vosk::LogLevel::Warn);
        let model = Model::new(path.as_str()).ok_or_else(|| RecognitionError::ModelLoad {
            path: path.clone(),
        })?;
        info!(path = %path, "Vosk model loaded");
        Ok(Self { model, path })
    }
}

impl RecognitionModel for VoskModel {
    fn construct(&self, sample_rate: u32) -> Result<Box<dyn Recognizer>, RecognitionError> {
        let mut recognizer = vosk::Recognizer::new(&self.model, sample_rate as f32)
            .ok_or_else(|| RecognitionError::Construct(format!("vosk rejected rate {sample_rate}")))?;
        recognizer.set_words(true);
        recognizer.set_max_alternatives(0);
        Ok(Box::new(VoskRecognizer {
            inner: recognizer,
            samples: Vec::new(),
        }))
    }

    fn describe(&self) -> String {
        format!("vosk ({})", self.path)
    }
}

struct VoskRecognizer {
    inner: vosk::Recognizer,
    samples: Vec<i16>,
}

impl Recognizer for VoskRecognizer {
    fn accept_chunk(&mut self, pcm: &[u8]) -> Result<ChunkStatus, RecognitionError> {
        let usable = pcm.len() - pcm.len() % 2;
        if usable != pcm.len() {
            debug!(bytes = pcm.len(), "Dropping trailing odd byte of chunk");
        }
        self.samples.resize(usable / 2, 0);
        LittleEndian::read_i16_into(&pcm[..usable], &mut self.samples);

        match self.inner.accept_waveform(&self.samples) {
            Ok(DecodingState::Finalized) => Ok(ChunkStatus::Final),
            Ok(DecodingState::Running) => Ok(ChunkStatus::Partial),
            Ok(DecodingState::Failed) => Err(RecognitionError::Decode("decoding failed".into())),
            Err(err) => Err(RecognitionError::Decode(format!("{err:?}"))),
        }
    }

    fn current_partial(&mut self) -> String {
        self.inner.partial_result().partial.to_string()
    }

    fn current_final(&mut self) -> String {
        self.inner
            .result()
            .single()
            .map(|r| r.text.to_string())
            .unwrap_or_default()
    }

    fn flush_final(&mut self) -> String {
        self.inner
            .final_result()
            .single()
            .map(|r| r.text.to_string())
            .unwrap_or_default()
    }
}
