//! # Protocol Relay
//!
//! The gateway core. Owns the session registry, the worker pool and the shared
//! model, and turns transport events into session operations.
//!
//! ## Control Flow:
//! 1. **Open**: mint a session, construct its recognizer, register it, send `ready`
//! 2. **Text frame**: classify; metadata announces the session once, ping gets pong.
//!    Frames that arrive while the session is still opening are held and replayed
//!    right after `ready`, in arrival order
//! 3. **Binary frame**: issue the session's next ticket and queue a [`PendingTask`]
//! 4. **Worker**: redeem the ticket, run the recognizer, emit surviving transcripts
//! 5. **Close**: unregister, drain behind a fresh ticket, flush, release
//!
//! The registry is only consulted to resolve connection → session and is never
//! held while the recognizer runs. I/O threads never wait on recognition: the
//! only work they do for audio is a map lookup and a queue push.

use crate::audio::{AudioFormat, WaveformSink};
use crate::error::{GatewayError, GatewayResult, SendError};
use crate::pool::{PoolStats, WorkerPool};
use crate::protocol::{self, Inbound, Outbound, FEATURES};
use crate::recognition::SharedModel;
use crate::session::{
    AudioSession, ChunkOutcome, CloseReport, ConnectionId, SessionId, SessionRegistry, Ticket,
    Transcript,
};
use actix_web::web::Bytes;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, warn};

const READY_MESSAGE: &str = "ASR ready";

/// Outbound side of the transport.
pub trait Transport: Send + Sync {
    /// Deliver one text frame. Fails when the peer is already gone.
    fn send_text(&self, connection: ConnectionId, text: String) -> Result<(), SendError>;
}

/// One queued chunk of audio.
pub struct PendingTask {
    /// Non-owning: the session may be mid-teardown when the task runs.
    session: Weak<AudioSession>,
    ticket: Ticket,
    payload: Bytes,
    reply_to: ConnectionId,
}

/// Gateway-wide counters, reported by `/health`.
#[derive(Debug, Default)]
pub struct GatewayStats {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_failed: AtomicU64,
    chunks_received: AtomicU64,
    chunks_dropped: AtomicU64,
    chunks_processed: AtomicU64,
    chunk_errors: AtomicU64,
    partials_emitted: AtomicU64,
    finals_emitted: AtomicU64,
    duplicates_suppressed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub sessions_failed: u64,
    pub chunks_received: u64,
    pub chunks_dropped: u64,
    pub chunks_processed: u64,
    pub chunk_errors: u64,
    pub partials_emitted: u64,
    pub finals_emitted: u64,
    pub duplicates_suppressed: u64,
}

impl GatewayStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            sessions_opened: load(&self.sessions_opened),
            sessions_closed: load(&self.sessions_closed),
            sessions_failed: load(&self.sessions_failed),
            chunks_received: load(&self.chunks_received),
            chunks_dropped: load(&self.chunks_dropped),
            chunks_processed: load(&self.chunks_processed),
            chunk_errors: load(&self.chunk_errors),
            partials_emitted: load(&self.partials_emitted),
            finals_emitted: load(&self.finals_emitted),
            duplicates_suppressed: load(&self.duplicates_suppressed),
        }
    }
}

/// Runtime knobs taken from the loaded configuration.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub format: AudioFormat,
    /// Directory for per-session WAV captures; `None` disables capture.
    pub capture_dir: Option<PathBuf>,
    pub workers: usize,
}

/// The session/connection concurrency manager.
pub struct Gateway {
    registry: SessionRegistry,
    /// Text frames of connections whose session is still being opened.
    opening: Mutex<HashMap<ConnectionId, Vec<String>>>,
    pool: WorkerPool<PendingTask>,
    model: SharedModel,
    transport: Arc<dyn Transport>,
    stats: Arc<GatewayStats>,
    options: GatewayOptions,
}

impl Gateway {
    /// Start the worker pool and build the gateway.
    pub fn new(
        model: SharedModel,
        transport: Arc<dyn Transport>,
        options: GatewayOptions,
    ) -> std::io::Result<Self> {
        let stats = Arc::new(GatewayStats::default());
        let pool = {
            let transport = Arc::clone(&transport);
            let stats = Arc::clone(&stats);
            WorkerPool::new("asr-worker", options.workers, move |task: PendingTask| {
                run_task(transport.as_ref(), &stats, task);
                Ok(())
            })?
        };

        Ok(Self {
            registry: SessionRegistry::new(),
            opening: Mutex::new(HashMap::new()),
            pool,
            model,
            transport,
            stats,
            options,
        })
    }

    /// Connection opened: build a ready session and publish it.
    ///
    /// Blocks on recognizer construction; call it off the I/O threads.
    pub fn open_session(&self, connection: ConnectionId) -> GatewayResult<Arc<AudioSession>> {
        let id = SessionId::generate();
        let sink = self.open_capture(&id);
        let session = Arc::new(AudioSession::new(id, connection, sink));

        if let Err(source) = session.initialize(&self.model, self.options.format.sample_rate) {
            GatewayStats::bump(&self.stats.sessions_failed);
            self.discard_held(connection);
            error!(session_id = %session.id(), error = %source, "Failed to create recognizer");
            return Err(GatewayError::SessionInit {
                session_id: session.id().to_string(),
                source,
            });
        }

        // Held frames must not be overtaken by frames that see the registered
        // session, so registration and replay happen under the same lock.
        let mut opening = self.lock_opening();
        self.registry.register(connection, Arc::clone(&session));
        GatewayStats::bump(&self.stats.sessions_opened);
        info!(session_id = %session.id(), total = self.registry.len(), "WebSocket connected");

        let format = self.options.format;
        self.send(
            connection,
            session.id(),
            &Outbound::Ready {
                session_uuid: session.id().as_str(),
                message: READY_MESSAGE,
                sample_rate: format.sample_rate,
                format: format.describe(),
                features: FEATURES,
            },
        );

        let held = opening.remove(&connection).unwrap_or_default();
        if !held.is_empty() {
            debug!(session_id = %session.id(), frames = held.len(), "Replaying text frames held during open");
        }
        for text in &held {
            self.dispatch_text(&session, connection, text);
        }
        drop(opening);
        Ok(session)
    }

    /// Connection accepted, session not built yet: hold its text frames until
    /// [`Gateway::open_session`] finishes.
    pub fn begin_open(&self, connection: ConnectionId) {
        self.lock_opening().entry(connection).or_default();
    }

    fn discard_held(&self, connection: ConnectionId) {
        if let Some(held) = self.lock_opening().remove(&connection) {
            if !held.is_empty() {
                debug!(connection = %connection, frames = held.len(), "Discarding text frames held for a session that never opened");
            }
        }
    }

    fn lock_opening(&self) -> MutexGuard<'_, HashMap<ConnectionId, Vec<String>>> {
        self.opening.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_capture(&self, id: &SessionId) -> Option<WaveformSink> {
        let dir = self.options.capture_dir.as_ref()?;
        match WaveformSink::open(dir, id.as_str(), self.options.format) {
            Ok(sink) => {
                info!(session_id = %id, path = %sink.path().display(), "Audio capture started");
                Some(sink)
            }
            Err(err) => {
                error!(session_id = %id, error = %err, "Audio capture unavailable, continuing without it");
                None
            }
        }
    }

    /// Text frame from a connection.
    pub fn handle_text(&self, connection: ConnectionId, text: &str) {
        if let Some(held) = self.lock_opening().get_mut(&connection) {
            held.push(text.to_string());
            debug!(connection = %connection, held = held.len(), "Session still opening, holding text frame");
            return;
        }
        let Some(session) = self.registry.lookup(connection) else {
            debug!(connection = %connection, "Text frame for unknown or closed connection");
            return;
        };
        self.dispatch_text(&session, connection, text);
    }

    fn dispatch_text(&self, session: &AudioSession, connection: ConnectionId, text: &str) {
        match protocol::classify(text) {
            Inbound::Metadata {
                correlation,
                source,
            } => {
                if !session.set_correlation(correlation.clone()) {
                    debug!(session_id = %session.id(), "Metadata already established, ignoring");
                    return;
                }
                info!(
                    session_id = %session.id(),
                    call_id = %correlation.call_id,
                    link_id = %correlation.link_id,
                    source = ?source,
                    "Metadata received"
                );
                self.send(
                    session.connection(),
                    session.id(),
                    &Outbound::AsrSessionId {
                        asr_session_id: session.id().as_str(),
                        call_id: &correlation.call_id,
                        link_id: &correlation.link_id,
                        timestamp: protocol::wall_clock_timestamp(),
                    },
                );
            }
            Inbound::Ping { timestamp } => {
                self.send(
                    connection,
                    session.id(),
                    &Outbound::Pong {
                        timestamp,
                        session_uuid: session.id().as_str(),
                    },
                );
            }
            Inbound::Unknown { kind } => {
                debug!(session_id = %session.id(), kind = ?kind, "Ignoring unhandled message type");
            }
            Inbound::Unrecognized => {
                warn!(session_id = %session.id(), bytes = text.len(), "Unparseable text frame");
            }
        }
    }

    /// Binary frame from a connection: queue it for recognition.
    ///
    /// Returns whether the chunk was queued.
    pub fn handle_audio(&self, connection: ConnectionId, payload: Bytes) -> bool {
        GatewayStats::bump(&self.stats.chunks_received);
        let Some(session) = self.registry.lookup(connection) else {
            GatewayStats::bump(&self.stats.chunks_dropped);
            debug!(connection = %connection, "Audio for unknown or closed connection");
            return false;
        };

        let queued = session.enqueue_chunk(|ticket| {
            self.pool.submit(PendingTask {
                session: Arc::downgrade(&session),
                ticket,
                payload,
                reply_to: connection,
            })
        });
        if let Err(err) = queued {
            GatewayStats::bump(&self.stats.chunks_dropped);
            warn!(session_id = %session.id(), error = %err, "Dropping audio chunk");
            return false;
        }
        true
    }

    /// Connection closed: drain, flush and release the session.
    ///
    /// Returns `None` when the connection had no registered session.
    pub fn close_session(&self, connection: ConnectionId) -> Option<CloseReport> {
        self.discard_held(connection);
        let Some(session) = self.registry.unregister(connection) else {
            debug!(connection = %connection, "Close for unknown or already closed connection");
            return None;
        };
        debug!(session_id = %session.id(), pending = session.pending_chunks(), "Draining session");
        let report = self.finish(&session);
        info!(session_id = %session.id(), total = self.registry.len(), "WebSocket closed");
        Some(report)
    }

    fn finish(&self, session: &AudioSession) -> CloseReport {
        let report = session.close(|transcript| {
            emit_transcript(self.transport.as_ref(), session, session.connection(), transcript);
        });
        if !report.already_closed {
            GatewayStats::bump(&self.stats.sessions_closed);
        }
        report
    }

    /// Close every remaining session, then drain and stop the worker pool.
    pub fn shutdown(&self) {
        let remaining = self.registry.drain();
        if !remaining.is_empty() {
            info!(sessions = remaining.len(), "Closing remaining sessions");
        }
        for (_, session) in remaining {
            self.finish(&session);
        }
        self.pool.shutdown();
    }

    fn send(&self, connection: ConnectionId, session_id: &SessionId, message: &Outbound<'_>) {
        deliver(self.transport.as_ref(), connection, session_id, message);
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn engine(&self) -> String {
        self.model.describe()
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }
}

/// Worker side of a [`PendingTask`].
fn run_task(transport: &dyn Transport, stats: &GatewayStats, task: PendingTask) {
    let PendingTask {
        session,
        ticket,
        payload,
        reply_to,
    } = task;
    let Some(session) = session.upgrade() else {
        GatewayStats::bump(&stats.chunks_dropped);
        debug!(connection = %reply_to, "Session gone before its chunk ran");
        return;
    };

    let outcome = session.process_chunk(ticket, &payload, |transcript| {
        emit_transcript(transport, &session, reply_to, transcript);
    });
    match outcome {
        Ok(ChunkOutcome::NotReady) => GatewayStats::bump(&stats.chunks_dropped),
        Ok(ChunkOutcome::Emitted(transcript)) => {
            GatewayStats::bump(&stats.chunks_processed);
            if transcript.is_final {
                GatewayStats::bump(&stats.finals_emitted);
            } else {
                GatewayStats::bump(&stats.partials_emitted);
            }
        }
        Ok(ChunkOutcome::Duplicate { .. }) => {
            GatewayStats::bump(&stats.chunks_processed);
            GatewayStats::bump(&stats.duplicates_suppressed);
        }
        Ok(ChunkOutcome::Empty) => GatewayStats::bump(&stats.chunks_processed),
        Err(err) => {
            GatewayStats::bump(&stats.chunk_errors);
            warn!(session_id = %session.id(), error = %err, "Recognizer rejected chunk");
        }
    }
}

/// Send a transcript to the originating peer and to the relay target.
///
/// The relay target is the same connection: the peer that streams the audio is
/// also the party that forwards transcripts to the call.
fn emit_transcript(
    transport: &dyn Transport,
    session: &AudioSession,
    reply_to: ConnectionId,
    transcript: &Transcript,
) {
    let id = session.id();
    deliver(
        transport,
        reply_to,
        id,
        &Outbound::Transcription {
            session_uuid: id.as_str(),
            text: &transcript.text,
            is_final: transcript.is_final,
            timestamp: protocol::epoch_millis(),
        },
    );

    let (call_id, link_id) = session
        .correlation()
        .map_or(("", ""), |c| (c.call_id.as_str(), c.link_id.as_str()));
    deliver(
        transport,
        session.connection(),
        id,
        &Outbound::Transcript {
            asr_session_id: id.as_str(),
            call_id,
            link_id,
            text: &transcript.text,
            is_final: transcript.is_final,
            timestamp: protocol::wall_clock_timestamp(),
        },
    );
}

/// Best-effort send: failures are logged and swallowed.
fn deliver(
    transport: &dyn Transport,
    connection: ConnectionId,
    session_id: &SessionId,
    message: &Outbound<'_>,
) {
    let text = match message.to_json() {
        Ok(text) => text,
        Err(err) => {
            error!(session_id = %session_id, error = %err, "Failed to encode outbound message");
            return;
        }
    };
    if let Err(err) = transport.send_text(connection, text) {
        debug!(session_id = %session_id, error = %err, "Peer gone, message dropped");
    }
}
