//! voxloop — streaming voice-to-voice chat server.
//!
//! A client streams microphone audio over one WebSocket; the server
//! transcribes it incrementally against a vendor recognition service
//! (custom binary frame protocol), feeds the finalized utterance to a
//! streaming text-generation backend, and synthesizes the reply
//! sentence-by-sentence back into audio, all pipelined to keep
//! round-trip latency low.
//!
//! ## Layout
//! - [`asr`] — frame codec + streaming recognition client
//! - [`llm`] — text generation adapter (streaming SSE + one-shot)
//! - [`tts`] — sentence segmenter + streaming synthesis client
//! - [`cache`] — shared TTL/LRU response cache
//! - [`security`] — fixed-window rate limiting
//! - [`auth`] — token → identity seam
//! - [`session`] — per-connection ingest/worker/writer loops
//! - [`gateway`] — axum server and admission

pub mod asr;
pub mod auth;
pub mod cache;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod llm;
pub mod security;
pub mod session;
pub mod tts;
