//! WebSocket client for the Volcengine streaming recognition service.
//!
//! ## Protocol overview
//!
//! 1. **Connect** — open a WebSocket to the recognition endpoint with the
//!    app/access/resource headers and a fresh per-connection id
//! 2. **Handshake** — send one `FullClientRequest` frame whose gzipped
//!    JSON payload declares the audio format and recognition options
//! 3. **Stream** — send audio chunks as gzipped `AudioOnlyRequest`
//!    frames; read `ServerResponse` frames carrying the cumulative
//!    transcript so far
//! 4. **Drain** — after the empty last-packet frame, keep reading until
//!    the transport closes or the drain timeout elapses, then emit the
//!    final transcript
//!
//! The send and receive sides run as independent tasks over the split
//! connection; retry policy lives one layer up, not here.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::frame::{self, Compression, MessageType, Serialization, FLAG_LAST_PACKET};
use super::{AsrEvent, AsrInput, AsrTurn, Transcriber};
use crate::errors::AsrError;

// ── Configuration ────────────────────────────────────────────────

/// Configuration for the recognition client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// WebSocket endpoint of the recognition service.
    pub endpoint: String,
    /// Application id (`X-Api-App-Key`).
    pub app_id: String,
    /// Access token (`X-Api-Access-Key`).
    pub access_token: String,
    /// Billing resource id (`X-Api-Resource-Id`).
    pub resource_id: String,
    /// Recognition model name sent in the handshake.
    pub model_name: String,
    /// Container format of the client audio (e.g. "webm").
    pub format: String,
    /// Sample rate in Hz.
    pub rate: u32,
    /// Bits per sample.
    pub bits: u32,
    /// Channel count.
    pub channel: u32,
    /// Spoken language tag (e.g. "zh-CN").
    pub language: String,
    /// Audio codec inside the container (e.g. "opus").
    pub codec: String,
    /// How long to keep reading after the last packet before giving up.
    pub drain_timeout_secs: u64,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://openspeech.bytedance.com/api/v3/sauc/bigmodel".into(),
            app_id: String::new(),
            access_token: String::new(),
            resource_id: "volc.bigasr.sauc.duration".into(),
            model_name: "bigmodel".into(),
            format: "webm".into(),
            rate: 16_000,
            bits: 16,
            channel: 1,
            language: "zh-CN".into(),
            codec: "opus".into(),
            drain_timeout_secs: 5,
        }
    }
}

// ── Handshake payload ────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct HandshakeRequest {
    user: UserSection,
    audio: AudioSection,
    request: RequestSection,
}

#[derive(Debug, Serialize)]
struct UserSection {
    uid: String,
}

#[derive(Debug, Serialize)]
struct AudioSection {
    format: String,
    rate: u32,
    bits: u32,
    channel: u32,
    language: String,
    codec: String,
}

#[derive(Debug, Serialize)]
struct RequestSection {
    model_name: String,
    enable_itn: bool,
    enable_punc: bool,
    result_type: String,
}

fn build_handshake(config: &AsrConfig, uid: &str) -> HandshakeRequest {
    HandshakeRequest {
        user: UserSection { uid: uid.into() },
        audio: AudioSection {
            format: config.format.clone(),
            rate: config.rate,
            bits: config.bits,
            channel: config.channel,
            language: config.language.clone(),
            codec: config.codec.clone(),
        },
        request: RequestSection {
            model_name: config.model_name.clone(),
            enable_itn: true,
            enable_punc: true,
            result_type: "full".into(),
        },
    }
}

// ── Result payload ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RecognitionPayload {
    result: Option<Vec<RecognitionResult>>,
}

#[derive(Debug, Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    text: String,
}

/// Extract the cumulative transcript from a `ServerResponse` payload,
/// if the frame carries one.
fn result_text(payload: &[u8]) -> Option<String> {
    match serde_json::from_slice::<RecognitionPayload>(payload) {
        Ok(parsed) => parsed.result.and_then(|r| r.into_iter().next()).map(|r| r.text),
        Err(e) => {
            tracing::debug!(error = %e, "non-result frame from recognition service");
            None
        }
    }
}

/// Human-readable message from an `Error` frame payload.
fn error_payload_text(payload: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
        for key in ["message", "error"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    String::from_utf8_lossy(payload).into_owned()
}

// ── Turn state ───────────────────────────────────────────────────

/// State of one recognition turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Created, not yet connected.
    Idle,
    /// Connecting and sending the handshake frame.
    Handshaking,
    /// Streaming audio up, reading transcripts down.
    Streaming,
    /// Last packet sent; reading remaining transcripts.
    Draining,
    /// Finished; a `Final` event was emitted.
    Done,
    /// Transport or protocol failure; an `Error` event was emitted.
    Failed,
}

// ── Client ───────────────────────────────────────────────────────

/// Streaming recognition client. One upstream connection per turn.
pub struct VolcengineAsr {
    config: AsrConfig,
}

impl VolcengineAsr {
    pub fn new(config: AsrConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl Transcriber for VolcengineAsr {
    async fn start_turn(&self, uid: &str) -> Result<AsrTurn, AsrError> {
        let state = Arc::new(Mutex::new(TurnState::Idle));

        let mut request = self
            .config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| AsrError::Transport(e.to_string()))?;
        let connect_id = Uuid::new_v4().to_string();
        {
            let headers = request.headers_mut();
            for (name, value) in [
                ("X-Api-App-Key", self.config.app_id.as_str()),
                ("X-Api-Access-Key", self.config.access_token.as_str()),
                ("X-Api-Resource-Id", self.config.resource_id.as_str()),
                ("X-Api-Connect-Id", connect_id.as_str()),
            ] {
                headers.insert(
                    name,
                    HeaderValue::from_str(value)
                        .map_err(|e| AsrError::Transport(e.to_string()))?,
                );
            }
        }

        *state.lock().await = TurnState::Handshaking;
        tracing::debug!(connect_id = %connect_id, uid = uid, "connecting to recognition service");

        let (mut ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| AsrError::Transport(e.to_string()))?;

        let handshake = serde_json::to_vec(&build_handshake(&self.config, uid))?;
        let encoded = frame::encode(
            MessageType::FullClientRequest,
            0,
            Serialization::Json,
            Compression::Gzip,
            &handshake,
        )?;
        ws.send(Message::binary(encoded))
            .await
            .map_err(|e| AsrError::Transport(e.to_string()))?;

        *state.lock().await = TurnState::Streaming;

        let (ws_sink, ws_stream) = ws.split();
        let (audio_tx, audio_rx) = mpsc::channel::<AsrInput>(64);
        let (event_tx, event_rx) = mpsc::channel::<AsrEvent>(64);
        let (draining_tx, draining_rx) = watch::channel(false);

        let send_state = Arc::clone(&state);
        tokio::spawn(send_loop(audio_rx, ws_sink, send_state, draining_tx));

        let recv_state = Arc::clone(&state);
        let drain_timeout = Duration::from_secs(self.config.drain_timeout_secs);
        tokio::spawn(recv_loop(
            ws_stream,
            event_tx,
            recv_state,
            drain_timeout,
            draining_rx,
        ));

        Ok(AsrTurn::new(audio_tx, event_rx))
    }
}

// ── Send loop ────────────────────────────────────────────────────

async fn send_loop<S>(
    mut audio_rx: mpsc::Receiver<AsrInput>,
    mut sink: S,
    state: Arc<Mutex<TurnState>>,
    draining: watch::Sender<bool>,
) where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let mut finished = false;
    while let Some(input) = audio_rx.recv().await {
        match input {
            AsrInput::Audio(chunk) => {
                if chunk.is_empty() {
                    continue;
                }
                let encoded = match frame::encode(
                    MessageType::AudioOnlyRequest,
                    0,
                    Serialization::None,
                    Compression::Gzip,
                    &chunk,
                ) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode audio frame");
                        continue;
                    }
                };
                if sink.send(Message::binary(encoded)).await.is_err() {
                    tracing::warn!("recognition send failed, closing send loop");
                    break;
                }
            }
            AsrInput::Finish => {
                match frame::encode(
                    MessageType::AudioOnlyRequest,
                    FLAG_LAST_PACKET,
                    Serialization::None,
                    Compression::Gzip,
                    &[],
                ) {
                    Ok(f) => {
                        let _ = sink.send(Message::binary(f)).await;
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to encode last packet"),
                }
                *state.lock().await = TurnState::Draining;
                finished = true;
                break;
            }
        }
    }

    if !finished {
        // Turn dropped mid-stream; close the transport so the receive
        // loop unblocks.
        let _ = sink.send(Message::Close(None)).await;
    }
    let _ = draining.send(true);
    tracing::debug!("recognition send loop terminated");
}

// ── Receive loop ─────────────────────────────────────────────────

async fn recv_loop<S>(
    mut stream: S,
    event_tx: mpsc::Sender<AsrEvent>,
    state: Arc<Mutex<TurnState>>,
    drain_timeout: Duration,
    mut draining: watch::Receiver<bool>,
) where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut last_text = String::new();
    let mut drain_mode = *draining.borrow();

    loop {
        let next = if drain_mode {
            match tokio::time::timeout(drain_timeout, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::warn!("recognition drain timed out");
                    break;
                }
            }
        } else {
            tokio::select! {
                next = stream.next() => next,
                changed = draining.changed() => {
                    // a dropped sender counts as a drain signal so the
                    // loop stays bounded
                    drain_mode = changed.is_err() || *draining.borrow();
                    continue;
                }
            }
        };

        match next {
            None => break,
            Some(Ok(Message::Binary(data))) => match frame::decode(&data) {
                Ok(f) if f.message_type == MessageType::Error => {
                    let err = AsrError::Upstream(error_payload_text(&f.payload));
                    tracing::error!(error = %err, "recognition service error frame");
                    *state.lock().await = TurnState::Failed;
                    let _ = event_tx
                        .send(AsrEvent::Error {
                            message: err.to_string(),
                        })
                        .await;
                    return;
                }
                Ok(f) => {
                    if let Some(text) = result_text(&f.payload) {
                        last_text.clone_from(&text);
                        if event_tx.send(AsrEvent::Partial { text }).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    *state.lock().await = TurnState::Failed;
                    let _ = event_tx
                        .send(AsrEvent::Error {
                            message: format!("malformed frame: {e}"),
                        })
                        .await;
                    return;
                }
            },
            Some(Ok(Message::Close(_))) => break,
            Some(Ok(_)) => {
                // ping/pong handled by tungstenite
            }
            Some(Err(e)) => {
                *state.lock().await = TurnState::Failed;
                let _ = event_tx
                    .send(AsrEvent::Error {
                        message: format!("transport: {e}"),
                    })
                    .await;
                return;
            }
        }
    }

    *state.lock().await = TurnState::Done;
    let _ = event_tx.send(AsrEvent::Final { text: last_text }).await;
    tracing::debug!("recognition receive loop terminated");
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn response_frame(json: &str) -> Message {
        let encoded = frame::encode(
            MessageType::ServerResponse,
            0,
            Serialization::Json,
            Compression::Gzip,
            json.as_bytes(),
        )
        .unwrap();
        Message::binary(encoded)
    }

    #[test]
    fn handshake_serializes_expected_fields() {
        let config = AsrConfig::default();
        let handshake = build_handshake(&config, "user-7");
        let json = serde_json::to_string(&handshake).unwrap();
        assert!(json.contains("\"uid\":\"user-7\""));
        assert!(json.contains("\"rate\":16000"));
        assert!(json.contains("\"enable_itn\":true"));
        assert!(json.contains("\"enable_punc\":true"));
        assert!(json.contains("\"result_type\":\"full\""));
        assert!(json.contains("\"model_name\":\"bigmodel\""));
    }

    #[test]
    fn result_text_extracts_cumulative_transcript() {
        let payload = r#"{"result":[{"text":"你好世界"}]}"#.as_bytes();
        assert_eq!(result_text(payload), Some("你好世界".to_string()));
    }

    #[test]
    fn result_text_ignores_non_result_frames() {
        assert_eq!(result_text(br#"{"audio_info":{"duration":120}}"#), None);
        assert_eq!(result_text(b"not json"), None);
    }

    #[test]
    fn error_payload_prefers_message_field() {
        let payload = br#"{"message":"invalid resource id"}"#;
        assert_eq!(error_payload_text(payload), "invalid resource id");
        assert_eq!(error_payload_text(b"plain text failure"), "plain text failure");
    }

    #[tokio::test]
    async fn recv_loop_emits_partials_then_final() {
        let frames = vec![
            Ok(response_frame(r#"{"result":[{"text":"讲个"}]}"#)),
            Ok(response_frame(r#"{"result":[{"text":"讲个笑话"}]}"#)),
        ];
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (_draining_tx, draining_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(TurnState::Streaming));

        recv_loop(
            stream::iter(frames),
            event_tx,
            Arc::clone(&state),
            Duration::from_secs(1),
            draining_rx,
        )
        .await;

        assert_eq!(
            event_rx.recv().await,
            Some(AsrEvent::Partial {
                text: "讲个".into()
            })
        );
        assert_eq!(
            event_rx.recv().await,
            Some(AsrEvent::Partial {
                text: "讲个笑话".into()
            })
        );
        assert_eq!(
            event_rx.recv().await,
            Some(AsrEvent::Final {
                text: "讲个笑话".into()
            })
        );
        assert_eq!(*state.lock().await, TurnState::Done);
    }

    #[tokio::test]
    async fn recv_loop_silence_yields_empty_final() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (_draining_tx, draining_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(TurnState::Streaming));

        let frames: Vec<Result<Message, tokio_tungstenite::tungstenite::Error>> = Vec::new();
        recv_loop(
            stream::iter(frames),
            event_tx,
            state,
            Duration::from_secs(1),
            draining_rx,
        )
        .await;

        assert_eq!(event_rx.recv().await, Some(AsrEvent::Final { text: String::new() }));
    }

    #[tokio::test]
    async fn recv_loop_surfaces_error_frames_without_final() {
        let error = frame::encode(
            MessageType::Error,
            0,
            Serialization::Json,
            Compression::None,
            br#"{"message":"quota exhausted"}"#,
        )
        .unwrap();
        let frames = vec![Ok(Message::binary(error))];
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (_draining_tx, draining_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(TurnState::Streaming));

        recv_loop(
            stream::iter(frames),
            event_tx,
            Arc::clone(&state),
            Duration::from_secs(1),
            draining_rx,
        )
        .await;

        match event_rx.recv().await {
            Some(AsrEvent::Error { message }) => {
                assert!(message.contains("quota exhausted"), "got: {message}");
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(event_rx.recv().await, None);
        assert_eq!(*state.lock().await, TurnState::Failed);
    }

    #[tokio::test]
    async fn recv_loop_surfaces_malformed_frames() {
        let frames = vec![Ok(Message::binary(vec![0x11, 0x91, 0x11]))];
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (_draining_tx, draining_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(TurnState::Streaming));

        recv_loop(
            stream::iter(frames),
            event_tx,
            state,
            Duration::from_secs(1),
            draining_rx,
        )
        .await;

        match event_rx.recv().await {
            Some(AsrEvent::Error { message }) => assert!(message.contains("malformed")),
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recv_loop_drain_timeout_emits_last_known_text() {
        let partial = response_frame(r#"{"result":[{"text":"半句"}]}"#);
        let frames = stream::iter(vec![Ok(partial)]).chain(stream::pending());
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (draining_tx, draining_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(TurnState::Streaming));
        draining_tx.send(true).unwrap();

        recv_loop(
            Box::pin(frames),
            event_tx,
            state,
            Duration::from_millis(50),
            draining_rx,
        )
        .await;

        assert_eq!(
            event_rx.recv().await,
            Some(AsrEvent::Partial { text: "半句".into() })
        );
        assert_eq!(
            event_rx.recv().await,
            Some(AsrEvent::Final { text: "半句".into() })
        );
    }
}
