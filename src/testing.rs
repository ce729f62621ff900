//! Test doubles: a scripted recognition engine, a recording transport and a
//! log capture writer.
//!
//! Scripted chunks are UTF-8 commands: `p:<text>` sets the partial text,
//! `f:<text>` ends the utterance with `<text>`. Any other payload leaves the
//! recognizer's text unchanged and reports `Partial`.

use crate::error::{RecognitionError, SendError};
use crate::recognition::{ChunkStatus, RecognitionModel, Recognizer};
use crate::relay::Transport;
use crate::session::ConnectionId;
use serde_json::Value;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

pub mod script {
    pub fn partial(text: &str) -> Vec<u8> {
        format!("p:{text}").into_bytes()
    }

    pub fn finalize(text: &str) -> Vec<u8> {
        format!("f:{text}").into_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub recognizer: usize,
    pub payload: Vec<u8>,
    pub thread: ThreadId,
}

#[derive(Debug, Default)]
struct Shared {
    log: Mutex<Vec<ChunkRecord>>,
    released: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    chunk_delay: Mutex<Option<Duration>>,
}

#[derive(Debug, Default)]
pub struct ScriptedModel {
    shared: Arc<Shared>,
    constructed: AtomicUsize,
    constructing: AtomicUsize,
    peak_constructing: AtomicUsize,
    fail_next: AtomicBool,
    construct_delay: Option<Duration>,
}

impl ScriptedModel {
    /// Sleep inside every `accept_chunk` to widen race windows.
    pub fn with_chunk_delay(self, delay: Duration) -> Self {
        *self.shared.chunk_delay.lock().unwrap() = Some(delay);
        self
    }

    /// Sleep inside every `construct`, like a large model being instantiated.
    pub fn with_construct_delay(mut self, delay: Duration) -> Self {
        self.construct_delay = Some(delay);
        self
    }

    pub fn fail_next_construction(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    pub fn peak_concurrent_constructions(&self) -> usize {
        self.peak_constructing.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Most recognizers inside `accept_chunk` at the same time.
    pub fn peak_concurrent_chunks(&self) -> usize {
        self.shared.peak_active.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<ChunkRecord> {
        self.shared.log.lock().unwrap().clone()
    }

    /// Payloads seen by one recognizer, in the order it saw them.
    pub fn chunks_for(&self, recognizer: usize) -> Vec<Vec<u8>> {
        self.records()
            .into_iter()
            .filter(|r| r.recognizer == recognizer)
            .map(|r| r.payload)
            .collect()
    }
}

impl RecognitionModel for ScriptedModel {
    fn construct(&self, _sample_rate: u32) -> Result<Box<dyn Recognizer>, RecognitionError> {
        let now = self.constructing.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_constructing.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.construct_delay.unwrap_or(Duration::from_millis(1)));
        self.constructing.fetch_sub(1, Ordering::SeqCst);

        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RecognitionError::Construct("scripted failure".into()));
        }
        let index = self.constructed.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedRecognizer {
            index,
            shared: Arc::clone(&self.shared),
            partial: String::new(),
            final_text: String::new(),
        }))
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

struct ScriptedRecognizer {
    index: usize,
    shared: Arc<Shared>,
    partial: String,
    final_text: String,
}

impl Recognizer for ScriptedRecognizer {
    fn accept_chunk(&mut self, pcm: &[u8]) -> Result<ChunkStatus, RecognitionError> {
        let now = self.shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak_active.fetch_max(now, Ordering::SeqCst);
        self.shared.log.lock().unwrap().push(ChunkRecord {
            recognizer: self.index,
            payload: pcm.to_vec(),
            thread: thread::current().id(),
        });
        let delay = *self.shared.chunk_delay.lock().unwrap();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        self.shared.active.fetch_sub(1, Ordering::SeqCst);

        let command = std::str::from_utf8(pcm).unwrap_or("");
        if let Some(text) = command.strip_prefix("f:") {
            self.final_text = text.to_string();
            self.partial.clear();
            return Ok(ChunkStatus::Final);
        }
        if let Some(text) = command.strip_prefix("p:") {
            self.partial = text.to_string();
        }
        Ok(ChunkStatus::Partial)
    }

    fn current_partial(&mut self) -> String {
        self.partial.clone()
    }

    fn current_final(&mut self) -> String {
        self.final_text.clone()
    }

    fn flush_final(&mut self) -> String {
        if self.partial.is_empty() {
            self.final_text.clone()
        } else {
            std::mem::take(&mut self.partial)
        }
    }
}

impl Drop for ScriptedRecognizer {
    fn drop(&mut self) {
        self.shared.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport that records every frame as parsed JSON.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(ConnectionId, Value)>>,
    gone: Mutex<HashSet<ConnectionId>>,
    failed: AtomicUsize,
}

impl RecordingTransport {
    /// Make later sends to `connection` fail like a departed peer.
    pub fn disconnect(&self, connection: ConnectionId) {
        self.gone.lock().unwrap().insert(connection);
    }

    pub fn messages(&self, connection: ConnectionId) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == connection)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn of_type(&self, connection: ConnectionId, kind: &str) -> Vec<Value> {
        self.messages(connection)
            .into_iter()
            .filter(|v| v["type"] == kind)
            .collect()
    }

    pub fn failed_sends(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }
}

impl Transport for RecordingTransport {
    fn send_text(&self, connection: ConnectionId, text: String) -> Result<(), SendError> {
        if self.gone.lock().unwrap().contains(&connection) {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(SendError::Disconnected(connection.get()));
        }
        let value = serde_json::from_str(&text).unwrap();
        self.sent.lock().unwrap().push((connection, value));
        Ok(())
    }
}

/// In-memory log sink for `tracing::subscriber::with_default`.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
