//! # Wire Protocol
//!
//! Text frames are newline-free JSON objects discriminated by `type`. Binary
//! frames carry raw audio and never pass through this module.
//!
//! ## Inbound:
//! - **metadata**: any object carrying `callId` plus `linkId` (or the legacy
//!   `fsUuid`). Recognized even when the payload is not valid JSON, by scanning for
//!   the quoted keys. Metadata wins over every other interpretation.
//! - **ping**: `{"type":"ping","timestamp":...}`, answered with `pong`.
//!
//! ## Outbound:
//! `ready`, `pong`, `transcription` (to the peer), `transcript` and
//! `asr_session_id` (to the relay target).

use crate::session::Correlation;
use chrono::{Local, Utc};
use serde::Serialize;
use serde_json::Value;

const CALL_ID_KEY: &str = "callId";
const LINK_ID_KEYS: [&str; 2] = ["linkId", "fsUuid"];

/// Features advertised in the `ready` message.
pub const FEATURES: [&str; 2] = ["partial_results", "real_time"];

/// How far a text frame could be understood, tried in this order.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// Valid JSON.
    Structured(Value),
    /// Not JSON, but both correlation ids could be scraped from the text.
    Fallback(Correlation),
    /// Neither.
    Unrecognized,
}

/// Where metadata was found, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataSource {
    Structured,
    PlainText,
}

/// A classified inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Metadata {
        correlation: Correlation,
        source: MetadataSource,
    },
    /// `timestamp` is echoed back verbatim.
    Ping { timestamp: Value },
    /// Valid JSON of a type the gateway does not handle.
    Unknown { kind: Option<String> },
    Unrecognized,
}

pub fn parse(text: &str) -> ParseOutcome {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return ParseOutcome::Structured(value);
    }
    match scrape_correlation(text) {
        Some(correlation) => ParseOutcome::Fallback(correlation),
        None => ParseOutcome::Unrecognized,
    }
}

pub fn classify(text: &str) -> Inbound {
    match parse(text) {
        ParseOutcome::Structured(value) => {
            if let Some(correlation) = structured_correlation(&value) {
                return Inbound::Metadata {
                    correlation,
                    source: MetadataSource::Structured,
                };
            }
            let kind = value.get("type").and_then(Value::as_str);
            match kind {
                Some("ping") => Inbound::Ping {
                    timestamp: value
                        .get("timestamp")
                        .cloned()
                        .unwrap_or_else(|| Value::String(String::new())),
                },
                _ => Inbound::Unknown {
                    kind: kind.map(str::to_owned),
                },
            }
        }
        ParseOutcome::Fallback(correlation) => Inbound::Metadata {
            correlation,
            source: MetadataSource::PlainText,
        },
        ParseOutcome::Unrecognized => Inbound::Unrecognized,
    }
}

fn structured_correlation(value: &Value) -> Option<Correlation> {
    let object = value.as_object()?;
    let call_id = object.get(CALL_ID_KEY)?;
    let link_id = LINK_ID_KEYS.iter().find_map(|key| object.get(*key))?;
    Some(Correlation {
        call_id: id_text(call_id),
        link_id: id_text(link_id),
    })
}

fn id_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Pull `"key":"value"` pairs out of text that is not valid JSON.
fn scrape_correlation(text: &str) -> Option<Correlation> {
    let call_id = scrape_quoted(text, CALL_ID_KEY)?;
    let link_id = LINK_ID_KEYS
        .iter()
        .find_map(|key| scrape_quoted(text, key))?;
    Some(Correlation { call_id, link_id })
}

fn scrape_quoted(text: &str, key: &str) -> Option<String> {
    let needle = format!("\"{key}\":\"");
    let start = text.find(&needle)? + needle.len();
    let len = text[start..].find('"')?;
    Some(text[start..start + len].to_string())
}

/// Messages the gateway sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound<'a> {
    Ready {
        session_uuid: &'a str,
        message: &'a str,
        sample_rate: u32,
        format: String,
        features: [&'static str; 2],
    },
    Pong {
        timestamp: Value,
        session_uuid: &'a str,
    },
    Transcription {
        session_uuid: &'a str,
        text: &'a str,
        #[serde(rename = "final")]
        is_final: bool,
        timestamp: i64,
    },
    Transcript {
        asr_session_id: &'a str,
        call_id: &'a str,
        link_id: &'a str,
        text: &'a str,
        #[serde(rename = "final")]
        is_final: bool,
        timestamp: String,
    },
    AsrSessionId {
        asr_session_id: &'a str,
        call_id: &'a str,
        link_id: &'a str,
        timestamp: String,
    },
}

impl Outbound<'_> {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Local wall-clock time as `YYYY-MM-DD HH:MM:SS.mmm`.
pub fn wall_clock_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}
