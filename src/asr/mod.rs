//! Streaming speech recognition.
//!
//! One recognition turn = one upstream WebSocket connection: a handshake
//! frame describing the audio, a stream of gzip-compressed audio frames,
//! an empty last-packet frame, then a drain phase that collects the
//! service's cumulative transcripts until the transport closes.
//!
//! The [`Transcriber`] trait is the seam the turn pipeline drives;
//! [`client::VolcengineAsr`] is the production implementation and tests
//! substitute scripted fakes.

pub mod client;
pub mod frame;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::AsrError;

// ── Turn-scoped events and inputs ────────────────────────────────

/// Event emitted by a recognition turn.
///
/// The service reports full-text-so-far per frame, so `Partial` carries
/// the entire cumulative transcript, not a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsrEvent {
    /// Cumulative recognized text so far.
    Partial { text: String },
    /// Last known cumulative text once the turn finished. An empty
    /// string is a valid silence outcome, not an error.
    Final { text: String },
    /// The turn failed; no `Final` follows.
    Error { message: String },
}

/// Input fed into a recognition turn by the pipeline.
#[derive(Debug)]
pub enum AsrInput {
    /// One chunk of client audio.
    Audio(Vec<u8>),
    /// End of this utterance; triggers the last-packet frame.
    Finish,
}

// ── Turn handle ──────────────────────────────────────────────────

/// Sending half of a recognition turn. Cloneable; dropping every clone
/// without calling [`AsrSender::finish`] closes the upstream connection,
/// which unblocks the paired receive loop.
#[derive(Clone)]
pub struct AsrSender {
    audio_tx: mpsc::Sender<AsrInput>,
}

impl AsrSender {
    /// Forward one audio chunk. Empty chunks are ignored upstream.
    pub async fn send_audio(&self, chunk: Vec<u8>) -> Result<(), AsrError> {
        self.audio_tx
            .send(AsrInput::Audio(chunk))
            .await
            .map_err(|_| AsrError::Transport("audio channel closed".into()))
    }

    /// Signal end of the utterance.
    pub async fn finish(&self) -> Result<(), AsrError> {
        self.audio_tx
            .send(AsrInput::Finish)
            .await
            .map_err(|_| AsrError::Transport("audio channel closed".into()))
    }
}

/// Handle to one in-flight recognition turn.
pub struct AsrTurn {
    pub sender: AsrSender,
    pub events: mpsc::Receiver<AsrEvent>,
}

impl AsrTurn {
    pub fn new(audio_tx: mpsc::Sender<AsrInput>, events: mpsc::Receiver<AsrEvent>) -> Self {
        Self {
            sender: AsrSender { audio_tx },
            events,
        }
    }
}

/// Starts recognition turns. One call per user utterance.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn start_turn(&self, uid: &str) -> Result<AsrTurn, AsrError>;
}

pub use client::{AsrConfig, TurnState, VolcengineAsr};
