//! Streaming speech synthesis.
//!
//! One synthesis call per sentence-sized unit from the
//! [`segment::SentenceSegmenter`]. The client checks the shared response
//! cache first; on a miss it opens a streaming request to the synthesis
//! backend, decodes each hex-encoded audio fragment the moment its line
//! arrives, forwards it to the caller's sink, and caches the accumulated
//! audio on success.
//!
//! Transient failures (5xx, connection errors) are retried with bounded
//! exponential backoff before the stream starts; anything after the
//! first byte aborts only the current sentence.

pub mod segment;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cache::{fingerprint, ResponseCache};
use crate::errors::SynthesisError;

pub use segment::SentenceSegmenter;

// ── Seam ─────────────────────────────────────────────────────────

/// Turns one text unit into a stream of audio chunks.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text`, pushing audio chunks into `sink` as they
    /// become available. Whitespace-only input is a no-op.
    async fn synthesize(
        &self,
        text: &str,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), SynthesisError>;
}

// ── Configuration ────────────────────────────────────────────────

/// Configuration for the synthesis backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub base_url: String,
    pub group_id: String,
    pub api_key: String,
    pub model: String,
    pub voice_id: String,
    pub speed: f64,
    pub volume: f64,
    pub pitch: i32,
    pub sample_rate: u32,
    pub format: String,
    pub channel: u32,
    /// Retries after the first failed attempt.
    pub max_retries: usize,
    /// First backoff delay; doubles per retry with jitter.
    pub retry_min_delay_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.minimaxi.com".into(),
            group_id: String::new(),
            api_key: String::new(),
            model: "speech-01-turbo".into(),
            voice_id: "female-shaonv".into(),
            speed: 1.0,
            volume: 1.0,
            pitch: 0,
            sample_rate: 32_000,
            format: "mp3".into(),
            channel: 1,
            max_retries: 3,
            retry_min_delay_ms: 500,
        }
    }
}

// ── Wire types ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    model: &'a str,
    text: &'a str,
    stream: bool,
    voice_setting: VoiceSetting<'a>,
    audio_setting: AudioSetting<'a>,
}

#[derive(Debug, Serialize)]
struct VoiceSetting<'a> {
    voice_id: &'a str,
    speed: f64,
    vol: f64,
    pitch: i32,
}

#[derive(Debug, Serialize)]
struct AudioSetting<'a> {
    sample_rate: u32,
    format: &'a str,
    channel: u32,
}

#[derive(Debug, Deserialize)]
struct SynthesisLine {
    data: Option<SynthesisData>,
}

#[derive(Debug, Deserialize)]
struct SynthesisData {
    audio: Option<String>,
}

/// Extract the hex audio fragment from one response line, if present.
/// Lines may carry an SSE-style `data:` prefix.
fn fragment_hex(line: &str) -> Option<String> {
    let body = line.strip_prefix("data:").unwrap_or(line).trim();
    if body.is_empty() {
        return None;
    }
    match serde_json::from_str::<SynthesisLine>(body) {
        Ok(parsed) => parsed.data.and_then(|d| d.audio).filter(|a| !a.is_empty()),
        Err(_) => None,
    }
}

// ── Client ───────────────────────────────────────────────────────

/// Streaming synthesis client for the Minimax T2A endpoint.
pub struct MinimaxTts {
    client: reqwest::Client,
    config: TtsConfig,
    cache: Arc<ResponseCache<Vec<u8>>>,
}

impl MinimaxTts {
    pub fn new(config: TtsConfig, cache: Arc<ResponseCache<Vec<u8>>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            cache,
        }
    }

    fn synthesis_url(&self) -> String {
        format!(
            "{}/v1/t2a_v2?groupId={}",
            self.config.base_url, self.config.group_id
        )
    }

    fn request_body<'a>(&'a self, text: &'a str) -> SynthesisRequest<'a> {
        SynthesisRequest {
            model: &self.config.model,
            text,
            stream: true,
            voice_setting: VoiceSetting {
                voice_id: &self.config.voice_id,
                speed: self.config.speed,
                vol: self.config.volume,
                pitch: self.config.pitch,
            },
            audio_setting: AudioSetting {
                sample_rate: self.config.sample_rate,
                format: &self.config.format,
                channel: self.config.channel,
            },
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::new()
            .with_min_delay(Duration::from_millis(self.config.retry_min_delay_ms))
            .with_max_delay(Duration::from_secs(10))
            .with_factor(2.0)
            .with_jitter()
            .with_max_times(self.config.max_retries)
    }

    /// Open the streaming response, retrying transient failures.
    async fn open_stream(&self, text: &str) -> Result<reqwest::Response, SynthesisError> {
        let attempt = || async {
            let response = self
                .client
                .post(self.synthesis_url())
                .bearer_auth(&self.config.api_key)
                .json(&self.request_body(text))
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(SynthesisError::Status {
                    status: status.as_u16(),
                    message,
                });
            }
            Ok(response)
        };

        attempt
            .retry(self.backoff())
            .when(SynthesisError::is_retryable)
            .notify(|err, delay| {
                tracing::warn!(error = %err, retry_in = ?delay, "synthesis attempt failed");
            })
            .await
    }
}

#[async_trait]
impl Synthesizer for MinimaxTts {
    async fn synthesize(
        &self,
        text: &str,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), SynthesisError> {
        if text.trim().is_empty() {
            return Ok(());
        }

        let key = fingerprint(&[text]);
        if let Some(audio) = self.cache.get(&key) {
            tracing::debug!(bytes = audio.len(), "synthesis cache hit");
            let _ = sink.send(audio).await;
            return Ok(());
        }

        let response = self.open_stream(text).await?;
        let mut byte_stream = Box::pin(response.bytes_stream());
        let mut line_buffer = String::new();
        let mut accumulated: Vec<u8> = Vec::new();

        while let Some(result) = byte_stream.next().await {
            let bytes = result.map_err(SynthesisError::Network)?;
            line_buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline_pos) = line_buffer.find('\n') {
                let line = line_buffer[..newline_pos].trim_end_matches('\r').to_string();
                line_buffer = line_buffer[newline_pos + 1..].to_string();

                if let Some(hex_audio) = fragment_hex(&line) {
                    let chunk = hex::decode(hex_audio)?;
                    accumulated.extend_from_slice(&chunk);
                    if sink.send(chunk).await.is_err() {
                        // receiver gone: session closed mid-sentence
                        return Ok(());
                    }
                }
            }
        }
        // trailing line without newline
        if let Some(hex_audio) = fragment_hex(&line_buffer) {
            let chunk = hex::decode(hex_audio)?;
            accumulated.extend_from_slice(&chunk);
            let _ = sink.send(chunk).await;
        }

        if !accumulated.is_empty() {
            self.cache.put(key, accumulated);
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
