//! Client session handling.
//!
//! One session per admitted WebSocket connection, run as three
//! cooperating pieces over two channels:
//!
//! ```text
//! socket ─▸ receive loop ─▸ ingest queue ─▸ turn pipeline worker
//!                                               │
//! socket ◂─ writer task  ◂─ outbound queue ◂────┘
//! ```
//!
//! The receive loop enforces the per-chunk and per-session byte caps and
//! translates `finish_speaking` control messages into end-of-turn
//! sentinels; closing the ingest queue is the "no more data ever"
//! signal that stops the worker.

pub mod events;
pub mod worker;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::asr::Transcriber;
use crate::errors::SessionError;
use crate::llm::ChatProvider;
use crate::tts::Synthesizer;

use events::{ClientControl, IngestItem, Outbound, ServerEvent};
use worker::{TurnConfig, TurnWorker};

// ── Limits ───────────────────────────────────────────────────────

/// Backpressure caps for one session.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SessionLimits {
    /// Oversized chunks are dropped with a warning, not fatal.
    pub max_chunk_bytes: usize,
    /// Breaching the cumulative cap notifies the client and ends the
    /// session gracefully.
    pub max_session_bytes: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 256 * 1024,
            max_session_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Process-scoped collaborators handed by reference into each session.
#[derive(Clone)]
pub struct SessionContext {
    pub transcriber: Arc<dyn Transcriber>,
    pub chat: Arc<dyn ChatProvider>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub limits: SessionLimits,
    pub turn: TurnConfig,
}

// ── Session ──────────────────────────────────────────────────────

/// Run one session to completion.
pub async fn run_session(socket: WebSocket, identity: String, ctx: SessionContext) {
    tracing::info!(identity = %identity, "session started");

    let (ws_sender, ws_receiver) = socket.split();
    let (ingest_tx, ingest_rx) = mpsc::channel::<IngestItem>(64);
    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(256);

    let writer = tokio::spawn(write_loop(ws_sender, outbound_rx));
    let receiver = tokio::spawn(receive_loop(
        ws_receiver,
        ingest_tx,
        outbound_tx.clone(),
        ctx.limits,
        identity.clone(),
    ));

    let worker = TurnWorker::new(
        ctx.transcriber,
        ctx.chat,
        ctx.synthesizer,
        ingest_rx,
        outbound_tx,
        identity.clone(),
        ctx.turn,
    );
    // the worker ends once the receive loop closes the ingest queue
    worker.run().await;

    let _ = receiver.await;
    let _ = writer.await;
    tracing::info!(identity = %identity, "session closed");
}

// ── Receive loop ─────────────────────────────────────────────────

/// Read client frames into the ingest queue, enforcing caps. Dropping
/// `ingest_tx` on return is what ends the session's worker.
async fn receive_loop<S>(
    mut ws_rx: S,
    ingest_tx: mpsc::Sender<IngestItem>,
    outbound_tx: mpsc::Sender<Outbound>,
    limits: SessionLimits,
    identity: String,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut received: u64 = 0;

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Binary(data) => {
                if data.len() > limits.max_chunk_bytes {
                    tracing::warn!(
                        identity = %identity,
                        len = data.len(),
                        cap = limits.max_chunk_bytes,
                        "dropping oversized audio chunk"
                    );
                    continue;
                }
                received += data.len() as u64;
                if received > limits.max_session_bytes {
                    let err = SessionError::ByteCapExceeded {
                        received,
                        cap: limits.max_session_bytes,
                    };
                    tracing::warn!(identity = %identity, error = %err, "ending session");
                    let _ = outbound_tx
                        .send(Outbound::Event(ServerEvent::Error {
                            message: err.to_string(),
                        }))
                        .await;
                    break;
                }
                if ingest_tx
                    .send(IngestItem::Chunk(data.to_vec()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Message::Text(text) => match serde_json::from_str::<ClientControl>(&text) {
                Ok(ClientControl::FinishSpeaking) => {
                    if ingest_tx.send(IngestItem::EndOfTurn).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(identity = %identity, error = %e, "ignoring unrecognized control message");
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    tracing::debug!(identity = %identity, bytes = received, "session receive loop terminated");
}

// ── Writer ───────────────────────────────────────────────────────

/// Multiplex events (JSON text frames) and audio (binary frames) back
/// onto the socket.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
) {
    while let Some(item) = outbound_rx.recv().await {
        let message = match item {
            Outbound::Audio(chunk) => Message::Binary(chunk.into()),
            Outbound::Event(event) => match serde_json::to_string(&event) {
                Ok(json) => Message::Text(json.into()),
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize event");
                    continue;
                }
            },
        };
        if ws_tx.send(message).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

// ── Tests ────────────────────────────────────────────────────────
