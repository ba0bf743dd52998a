//! Domain error types for voxloop.
//!
//! Typed errors at module boundaries enable structured handling via
//! pattern matching: a malformed vendor frame aborts one recognition
//! connection, a failed sentence synthesis skips one sentence, and only
//! session-level errors end a session.

use thiserror::Error;

// ── Frame codec errors ───────────────────────────────────────────

/// Errors from encoding/decoding recognition-protocol frames.
///
/// A decode failure aborts the current upstream connection, never the
/// session that owns it.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame truncated: {len} bytes, need at least 8")]
    Truncated { len: usize },

    #[error("declared payload length {declared} exceeds available {available} bytes")]
    PayloadOverrun { declared: usize, available: usize },

    #[error("unknown message type nibble {0:#06b}")]
    UnknownMessageType(u8),

    #[error("unknown compression method nibble {0:#06b}")]
    UnknownCompression(u8),

    #[error("gzip: {0}")]
    Gzip(#[from] std::io::Error),
}

// ── Recognition client errors ────────────────────────────────────

/// Errors from the streaming speech-recognition client.
#[derive(Debug, Error)]
pub enum AsrError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The vendor sent an explicit error frame.
    #[error("recognition service error: {0}")]
    Upstream(String),

    #[error("recognition transport: {0}")]
    Transport(String),

    #[error("recognition handshake payload: {0}")]
    Handshake(#[from] serde_json::Error),
}

// ── Generation errors ────────────────────────────────────────────

/// Errors from the text-generation backend.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation backend returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("generation network: {0}")]
    Network(#[from] reqwest::Error),
}

// ── Synthesis errors ─────────────────────────────────────────────

/// Errors from the speech-synthesis backend.
///
/// Retryable errors (5xx, connection failures) get bounded exponential
/// backoff inside the synthesis client; the rest abort the current
/// sentence and the turn continues.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("synthesis backend returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("synthesis network: {0}")]
    Network(#[from] reqwest::Error),

    #[error("malformed audio fragment: {0}")]
    BadFragment(#[from] hex::FromHexError),
}

impl SynthesisError {
    /// Whether this failure is worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500,
            Self::Network(e) => e.is_connect() || e.is_timeout(),
            Self::BadFragment(_) => false,
        }
    }
}

// ── Session errors ───────────────────────────────────────────────

/// Session-level failures surfaced to the client before closing.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("rate limit exceeded for {identity}")]
    RateLimited { identity: String },

    #[error("session byte cap exceeded: {received} bytes received, cap is {cap}")]
    ByteCapExceeded { received: u64, cap: u64 },
}
