//! # Audio Format and Capture
//!
//! The gateway never converts audio: peers stream raw linear PCM exactly as the
//! recognizer wants it, one binary WebSocket message per chunk.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz by default (configurable, must match the model)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod capture;

pub use capture::{CaptureSummary, WaveformSink};

/// Bytes per sample for 16-bit PCM.
pub const BYTES_PER_SAMPLE: u16 = 2;

/// Fixed-rate mono 16-bit linear PCM, the only format the gateway accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
}

impl AudioFormat {
    pub const CHANNELS: u16 = 1;
    pub const BITS_PER_SAMPLE: u16 = 16;

    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Bytes of audio per second of speech.
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * u32::from(Self::CHANNELS) * u32::from(BYTES_PER_SAMPLE)
    }

    /// Human-readable description sent to peers in the `ready` message.
    pub fn describe(&self) -> String {
        if self.sample_rate % 1000 == 0 {
            format!(
                "{}kHz Linear PCM (L16), mono, int16",
                self.sample_rate / 1000
            )
        } else {
            format!("{}Hz Linear PCM (L16), mono, int16", self.sample_rate)
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(16_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format_description() {
        let format = AudioFormat::default();
        assert_eq!(format.describe(), "16kHz Linear PCM (L16), mono, int16");
        assert_eq!(format.byte_rate(), 32_000);
    }

    #[test]
    fn test_odd_rate_description_uses_hertz() {
        assert_eq!(
            AudioFormat::new(22_050).describe(),
            "22050Hz Linear PCM (L16), mono, int16"
        );
    }
}
