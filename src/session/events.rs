//! Client-facing WebSocket message schema.
//!
//! The session speaks JSON text frames for events and raw binary frames
//! for synthesized audio. Inbound, the client sends binary audio frames
//! and JSON control messages.

use serde::{Deserialize, Serialize};

// ── Server → client events ───────────────────────────────────────

/// JSON events interleaved with binary audio frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Cumulative transcript of the in-progress utterance.
    AsrPartial { text: String },
    /// Final transcript for the turn.
    AsrFinal { text: String },
    /// One generated token, in generation order.
    LlmToken { text: String },
    /// A recoverable failure; the session continues unless followed by
    /// a close.
    Error { message: String },
    /// The turn is over; the next utterance may begin.
    TurnEnd,
}

// ── Client → server control messages ─────────────────────────────

/// JSON control messages from the client. Binary frames are audio and
/// bypass this schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientControl {
    /// The user released the talk button: end of this utterance.
    FinishSpeaking,
}

// ── Internal plumbing ────────────────────────────────────────────

/// Item on a session's outbound channel, multiplexed onto the socket by
/// the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Event(ServerEvent),
    /// Raw synthesized audio, sent as a binary frame.
    Audio(Vec<u8>),
}

/// Item on a session's audio ingest queue. Closing the queue means "no
/// more data ever" (the session is ending), distinct from the per-turn
/// end marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestItem {
    Chunk(Vec<u8>),
    EndOfTurn,
}

// ── Tests ────────────────────────────────────────────────────────
