//! Text generation adapter.
//!
//! The pipeline drives generation through the [`ChatProvider`] seam:
//! a streaming mode yielding incremental content fragments (the only
//! mode the turn pipeline consumes) and a one-shot mode for
//! non-streaming callers. [`SiliconFlowChat`] speaks the
//! OpenAI-compatible `/v1/chat/completions` SSE protocol.
//!
//! Completed generations are cached as ordered token sequences keyed by
//! a fingerprint over model, prior conversation turns, and the new user
//! text; a cache hit replays the tokens without an upstream call.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cache::{fingerprint, ResponseCache};
use crate::errors::GenerationError;

// ── Messages ─────────────────────────────────────────────────────

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One prior message of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ── Token stream ─────────────────────────────────────────────────

/// One item of a live generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenChunk {
    /// Incremental content fragment, in generation order.
    Token(String),
    /// Generation finished normally.
    Done,
    /// Generation failed mid-stream; no `Done` follows.
    Error(String),
}

/// Receiving handle for a live token stream.
pub struct TokenStream {
    rx: mpsc::UnboundedReceiver<TokenChunk>,
}

impl TokenStream {
    /// Create a connected sender/stream pair.
    pub fn channel() -> (mpsc::UnboundedSender<TokenChunk>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    pub async fn next_chunk(&mut self) -> Option<TokenChunk> {
        self.rx.recv().await
    }
}

/// Streaming-first text generation backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stream a reply to `user_text` given the prior conversation.
    async fn chat_stream(
        &self,
        history: &[ChatMessage],
        user_text: &str,
    ) -> Result<TokenStream, GenerationError>;

    /// One-shot completion for non-streaming callers.
    async fn chat_once(
        &self,
        history: &[ChatMessage],
        user_text: &str,
    ) -> Result<String, GenerationError>;
}

// ── Configuration ────────────────────────────────────────────────

/// Configuration for the generation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.siliconflow.cn".into(),
            api_key: String::new(),
            model: "deepseek-ai/DeepSeek-V3.2".into(),
            max_tokens: 512,
            temperature: 0.7,
        }
    }
}

// ── Provider ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    max_tokens: u32,
    temperature: f64,
}

/// OpenAI-compatible chat client.
pub struct SiliconFlowChat {
    client: reqwest::Client,
    config: LlmConfig,
    cache: Option<Arc<ResponseCache<Vec<String>>>>,
}

impl SiliconFlowChat {
    pub fn new(config: LlmConfig, cache: Option<Arc<ResponseCache<Vec<String>>>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            cache,
        }
    }

    fn request_body<'a>(
        &'a self,
        history: &[ChatMessage],
        user_text: &str,
        stream: bool,
    ) -> ChatRequest<'a> {
        let mut messages = history.to_vec();
        messages.push(ChatMessage::user(user_text));
        ChatRequest {
            model: &self.config.model,
            messages,
            stream,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    fn cache_key(&self, history: &[ChatMessage], user_text: &str) -> String {
        let mut parts: Vec<&str> = vec![self.config.model.as_str()];
        for message in history {
            parts.push(message.role.as_str());
            parts.push(&message.content);
        }
        parts.push(user_text);
        fingerprint(&parts)
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.config.base_url)
    }
}

#[async_trait]
impl ChatProvider for SiliconFlowChat {
    async fn chat_stream(
        &self,
        history: &[ChatMessage],
        user_text: &str,
    ) -> Result<TokenStream, GenerationError> {
        let key = self.cache_key(history, user_text);
        if let Some(cache) = &self.cache {
            if let Some(tokens) = cache.get(&key) {
                tracing::debug!("generation cache hit");
                let (tx, stream) = TokenStream::channel();
                for token in tokens {
                    let _ = tx.send(TokenChunk::Token(token));
                }
                let _ = tx.send(TokenChunk::Done);
                return Ok(stream);
            }
        }

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&self.request_body(history, user_text, true))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let (tx, stream) = TokenStream::channel();
        let byte_stream = response.bytes_stream();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            parse_chat_sse(byte_stream, tx, cache, key).await;
        });
        Ok(stream)
    }

    async fn chat_once(
        &self,
        history: &[ChatMessage],
        user_text: &str,
    ) -> Result<String, GenerationError> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&self.request_body(history, user_text, false))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let value: serde_json::Value = response.json().await?;
        Ok(value
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

// ── SSE parsing ──────────────────────────────────────────────────

/// Parse an OpenAI-compatible SSE stream: `data:` lines carrying
/// `choices[0].delta.content` fragments, terminated by `data: [DONE]`.
///
/// The full token sequence is written to the cache only when the
/// terminator was seen; a stream that ends early still completes the
/// turn with what arrived, but is not cached.
async fn parse_chat_sse(
    byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>>,
    tx: mpsc::UnboundedSender<TokenChunk>,
    cache: Option<Arc<ResponseCache<Vec<String>>>>,
    cache_key: String,
) {
    let mut line_buffer = String::new();
    let mut tokens: Vec<String> = Vec::new();
    let mut terminated = false;
    let mut stream = Box::pin(byte_stream);

    'outer: while let Some(result) = stream.next().await {
        let bytes = match result {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "generation stream error");
                let _ = tx.send(TokenChunk::Error(format!("generation stream: {e}")));
                return;
            }
        };

        line_buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(newline_pos) = line_buffer.find('\n') {
            let line = line_buffer[..newline_pos].trim_end_matches('\r').to_string();
            line_buffer = line_buffer[newline_pos + 1..].to_string();

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                terminated = true;
                break 'outer;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                continue;
            };
            if let Some(content) = value
                .pointer("/choices/0/delta/content")
                .and_then(|v| v.as_str())
            {
                if content.is_empty() {
                    continue;
                }
                tokens.push(content.to_string());
                if tx.send(TokenChunk::Token(content.to_string())).is_err() {
                    return;
                }
            }
        }
    }

    if terminated && !tokens.is_empty() {
        if let Some(cache) = cache {
            cache.put(cache_key, tokens);
        }
    }
    let _ = tx.send(TokenChunk::Done);
}

// ── Tests ────────────────────────────────────────────────────────
