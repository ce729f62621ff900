//! # Diagnostic Audio Capture
//!
//! Append-only capture of a session's raw audio into a standard WAV container.
//!
//! ## Container Layout:
//! The canonical 44-byte PCM header is written up front with a zero payload
//! length, audio bytes are appended as they arrive, and the two length fields
//! (`RIFF` size at offset 4, `data` size at offset 40) are rewritten once the
//! stream ends. A WAV file cannot be finalized earlier because the header embeds
//! the payload length.
//!
//! ## Threading:
//! A sink belongs to exactly one session and is only touched while that session's
//! sequencing turn is held, so it needs no lock of its own.

use crate::audio::{AudioFormat, BYTES_PER_SAMPLE};
use crate::error::CaptureError;
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Size of the canonical PCM WAV header.
pub const HEADER_LEN: u64 = 44;

/// Bytes of the header counted by the RIFF size field (everything after it).
const RIFF_OVERHEAD: u32 = HEADER_LEN as u32 - 8;

/// Result of a finalized capture, reported in the session's close log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSummary {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Writer for one session's captured audio.
pub struct WaveformSink {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    format: AudioFormat,
    data_len: u64,
}

impl WaveformSink {
    /// Create `<dir>/<session_id>.wav` and write a placeholder header.
    pub fn open(dir: &Path, session_id: &str, format: AudioFormat) -> Result<Self, CaptureError> {
        let path = dir.join(format!("{session_id}.wav"));
        let create_err = |source| CaptureError::Create {
            path: path.clone(),
            source,
        };

        let file = File::create(&path).map_err(create_err)?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer, format, 0).map_err(create_err)?;

        Ok(Self {
            writer: Some(writer),
            path,
            format,
            data_len: 0,
        })
    }

    /// Append raw PCM bytes exactly as received from the peer.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), CaptureError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        writer.write_all(bytes).map_err(|source| CaptureError::Write {
            path: self.path.clone(),
            source,
        })?;
        self.data_len += bytes.len() as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the header with the true payload length and close the file.
    pub fn finalize(mut self) -> Result<CaptureSummary, CaptureError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<CaptureSummary, CaptureError> {
        let summary = CaptureSummary {
            path: self.path.clone(),
            bytes: self.data_len,
        };
        let Some(mut writer) = self.writer.take() else {
            return Ok(summary);
        };

        let finalize_err = |source| CaptureError::Finalize {
            path: self.path.clone(),
            source,
        };
        writer.seek(SeekFrom::Start(0)).map_err(finalize_err)?;
        write_header(&mut writer, self.format, self.data_len).map_err(finalize_err)?;
        writer.flush().map_err(finalize_err)?;

        Ok(summary)
    }
}

impl Drop for WaveformSink {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(err) = self.finish() {
                tracing::error!(path = %self.path.display(), error = %err, "Capture sink dropped without finalizing");
            }
        }
    }
}

/// Length fields for a payload, clamped so the RIFF size never overflows.
fn length_fields(data_len: u64) -> (u32, u32) {
    let data = u32::try_from(data_len)
        .unwrap_or(u32::MAX)
        .min(u32::MAX - RIFF_OVERHEAD);
    (RIFF_OVERHEAD + data, data)
}

fn write_header<W: Write>(out: &mut W, format: AudioFormat, data_len: u64) -> io::Result<()> {
    let (riff_len, data_len) = length_fields(data_len);
    let block_align = AudioFormat::CHANNELS * BYTES_PER_SAMPLE;

    out.write_all(b"RIFF")?;
    out.write_u32::<LittleEndian>(riff_len)?;
    out.write_all(b"WAVE")?;

    out.write_all(b"fmt ")?;
    out.write_u32::<LittleEndian>(16)?; // PCM fmt chunk size
    out.write_u16::<LittleEndian>(1)?; // linear PCM
    out.write_u16::<LittleEndian>(AudioFormat::CHANNELS)?;
    out.write_u32::<LittleEndian>(format.sample_rate)?;
    out.write_u32::<LittleEndian>(format.byte_rate())?;
    out.write_u16::<LittleEndian>(block_align)?;
    out.write_u16::<LittleEndian>(AudioFormat::BITS_PER_SAMPLE)?;

    out.write_all(b"data")?;
    out.write_u32::<LittleEndian>(data_len)?;
    Ok(())
}
