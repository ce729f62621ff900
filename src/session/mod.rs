//! # Audio Session
//!
//! One session per live connection. A session owns its recognizer, its optional
//! capture sink and the dedup cursors, all behind the session's sequencing lock.
//!
//! ## Session Lifecycle:
//! 1. **Created**: session id assigned, nothing constructed yet
//! 2. **Initializing**: recognizer being minted from the shared model
//! 3. **Ready**: recognizer usable; only now may the session be registered
//! 4. **Closing**: unregistered, in-flight chunks drained, final flush requested
//! 5. **Closed**: recognizer and capture sink released (terminal)
//!
//! ## Ordering:
//! Every state-touching operation runs inside a [`Turn`] of the session's
//! [`Sequencer`]. Chunks redeem the ticket they were issued at enqueue time, so the
//! engine sees them in submission order. `close` takes a fresh ticket, which
//! places it behind every chunk already queued.

pub mod registry;
pub mod sequencer;

pub use registry::SessionRegistry;
pub use sequencer::{Sequencer, Ticket};

use crate::audio::WaveformSink;
use crate::audio::CaptureSummary;
use crate::error::RecognitionError;
use crate::recognition::{ChunkStatus, Recognizer, SharedModel};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Transport-assigned connection token: comparable and hashable, nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a token never handed out before in this process.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opaque session token of the form `asr-<uuid v4>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(format!("asr-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    Initializing,
    Ready,
    Closing,
    Closed,
}

/// External call identifiers supplied by the `metadata` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub call_id: String,
    pub link_id: String,
}

/// A transcript that survived dedup and must be sent out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
}

/// What happened to one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The session was not ready; the chunk was discarded.
    NotReady,
    /// A new transcript was produced and handed to the emitter.
    Emitted(Transcript),
    /// The engine repeated the previous text.
    Duplicate { is_final: bool },
    /// The engine produced no text yet.
    Empty,
}

/// Summary of a session teardown.
#[derive(Debug, Default)]
pub struct CloseReport {
    /// Text returned by the close-time flush, when non-empty.
    pub flushed: Option<String>,
    pub capture: Option<CaptureSummary>,
    /// The session had already been closed by an earlier call.
    pub already_closed: bool,
}

struct SessionState {
    phase: Phase,
    recognizer: Option<Box<dyn Recognizer>>,
    sink: Option<WaveformSink>,
    last_partial: String,
    last_final: String,
}

impl SessionState {
    fn ready(&self) -> bool {
        self.phase == Phase::Ready && self.recognizer.is_some()
    }

    fn capture(&mut self, session_id: &SessionId, pcm: &[u8]) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if let Err(err) = sink.append(pcm) {
            error!(session_id = %session_id, error = %err, "Audio capture failed, disabling capture for this session");
            self.sink = None;
        }
    }
}

/// Per-connection recognition state machine.
pub struct AudioSession {
    id: SessionId,
    connection: ConnectionId,
    correlation: OnceLock<Correlation>,
    state: Sequencer<SessionState>,
}

impl AudioSession {
    /// Create a session in the `Created` phase.
    ///
    /// ## Parameters:
    /// - **id**: freshly generated session id
    /// - **connection**: the connection this session answers to
    /// - **sink**: capture sink, `None` when capture is off or could not be opened
    pub fn new(id: SessionId, connection: ConnectionId, sink: Option<WaveformSink>) -> Self {
        info!(session_id = %id, connection = %connection, "Session created");
        Self {
            id,
            connection,
            correlation: OnceLock::new(),
            state: Sequencer::new(SessionState {
                phase: Phase::Created,
                recognizer: None,
                sink,
                last_partial: String::new(),
                last_final: String::new(),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Construct the recognizer and move to `Ready`.
    ///
    /// `ready` is set inside the session's own turn, so callers that publish the
    /// session after this returns can never expose a half-built session. On
    /// failure the session goes straight to `Closed`.
    pub fn initialize(&self, model: &SharedModel, sample_rate: u32) -> Result<(), RecognitionError> {
        let mut state = self.state.acquire();
        state.phase = Phase::Initializing;
        info!(session_id = %self.id, sample_rate, "Initializing recognizer");

        match model.construct(sample_rate) {
            Ok(recognizer) => {
                state.recognizer = Some(recognizer);
                state.phase = Phase::Ready;
                info!(session_id = %self.id, "Recognizer initialized");
                Ok(())
            }
            Err(err) => {
                state.phase = Phase::Closed;
                if let Some(sink) = state.sink.take() {
                    finalize_capture(&self.id, sink);
                }
                Err(err)
            }
        }
    }

    /// Record the correlation ids. Only the first call has any effect.
    ///
    /// Returns `true` when this call established the correlation.
    pub fn set_correlation(&self, correlation: Correlation) -> bool {
        let mut first = false;
        self.correlation.get_or_init(|| {
            first = true;
            correlation
        });
        first
    }

    pub fn correlation(&self) -> Option<&Correlation> {
        self.correlation.get()
    }

    fn call_id(&self) -> &str {
        self.correlation().map_or("", |c| c.call_id.as_str())
    }

    /// Issue the ticket for the next chunk and hand it to `enqueue` atomically.
    pub fn enqueue_chunk<R, E>(&self, enqueue: impl FnOnce(Ticket) -> Result<R, E>) -> Result<R, E> {
        self.state.issue_with(enqueue)
    }

    /// Feed one chunk to the recognizer inside `ticket`'s turn.
    ///
    /// `emit` is called at most once, before the turn is released, so the
    /// outbound messages of a session leave in chunk order.
    pub fn process_chunk(
        &self,
        ticket: Ticket,
        pcm: &[u8],
        emit: impl FnOnce(&Transcript),
    ) -> Result<ChunkOutcome, RecognitionError> {
        let sequence = ticket.number();
        let mut state = self.state.wait(ticket);
        state.capture(&self.id, pcm);

        if !state.ready() {
            debug!(session_id = %self.id, sequence, bytes = pcm.len(), "Session not ready, dropping chunk");
            return Ok(ChunkOutcome::NotReady);
        }

        let state = &mut *state;
        let Some(recognizer) = state.recognizer.as_mut() else {
            return Ok(ChunkOutcome::NotReady);
        };

        let (is_final, text) = match recognizer.accept_chunk(pcm)? {
            ChunkStatus::Final => (true, recognizer.current_final()),
            ChunkStatus::Partial => (false, recognizer.current_partial()),
        };
        let cursor = if is_final {
            &mut state.last_final
        } else {
            &mut state.last_partial
        };

        if text.is_empty() {
            return Ok(ChunkOutcome::Empty);
        }
        if *cursor == text {
            debug!(session_id = %self.id, is_final, "Duplicate transcript suppressed");
            return Ok(ChunkOutcome::Duplicate { is_final });
        }
        cursor.clone_from(&text);

        if is_final {
            info!(session_id = %self.id, call_id = self.call_id(), "TRANSCRIPT_FINAL");
            debug!(session_id = %self.id, text = %text, "Final transcript");
        } else {
            debug!(session_id = %self.id, text = %text, "Partial transcript");
        }

        let transcript = Transcript { text, is_final };
        emit(&transcript);
        Ok(ChunkOutcome::Emitted(transcript))
    }

    /// Drain in-flight chunks, flush the final result and release resources.
    ///
    /// The caller unregisters the session first so no new chunk can be queued.
    /// The flush is not deduplicated: whatever the engine returns is logged and
    /// handed to `emit` when non-empty. Calling this twice is harmless.
    pub fn close(&self, emit: impl FnOnce(&Transcript)) -> CloseReport {
        let mut state = self.state.acquire();
        if state.phase == Phase::Closed {
            return CloseReport {
                already_closed: true,
                ..CloseReport::default()
            };
        }
        state.phase = Phase::Closing;

        let flushed = state
            .recognizer
            .as_mut()
            .map(|recognizer| recognizer.flush_final())
            .filter(|text| !text.is_empty());
        if let Some(text) = &flushed {
            info!(session_id = %self.id, call_id = self.call_id(), "TRANSCRIPT_FINAL (flush on close)");
            debug!(session_id = %self.id, text = %text, "Flushed transcript");
            emit(&Transcript {
                text: text.clone(),
                is_final: true,
            });
        }

        // Release the engine handle before the capture file is finalized.
        state.recognizer = None;
        let capture = state
            .sink
            .take()
            .and_then(|sink| finalize_capture(&self.id, sink));
        state.phase = Phase::Closed;

        match self.correlation() {
            Some(c) => info!(session_id = %self.id, call_id = %c.call_id, link_id = %c.link_id, "Session ended"),
            None => info!(session_id = %self.id, "Session ended"),
        }

        CloseReport {
            flushed,
            capture,
            already_closed: false,
        }
    }

    /// Chunks queued or running that the session has not finished yet.
    pub fn pending_chunks(&self) -> u64 {
        self.state.outstanding()
    }

    /// Current phase, observed behind any queued work.
    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.state.acquire().phase
    }
}

impl fmt::Debug for AudioSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioSession")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .field("correlation", &self.correlation.get())
            .finish_non_exhaustive()
    }
}

fn finalize_capture(session_id: &SessionId, sink: WaveformSink) -> Option<CaptureSummary> {
    match sink.finalize() {
        Ok(summary) => {
            info!(session_id = %session_id, path = %summary.path.display(), bytes = summary.bytes, "Audio capture finished");
            Some(summary)
        }
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "Audio capture could not be finalized");
            None
        }
    }
}
