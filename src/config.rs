//! Runtime configuration.
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables for the secrets that deployments inject (`VOLC_APPID`,
//! `VOLC_TOKEN`, `SILICON_KEY`, `MINIMAX_GROUP_ID`, `MINIMAX_API_KEY`,
//! `HOST`, `PORT`). Every section has working defaults so a bare
//! `voxloop` starts locally.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::asr::AsrConfig;
use crate::llm::LlmConfig;
use crate::session::worker::TurnConfig;
use crate::session::SessionLimits;
use crate::tts::TtsConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub asr: AsrConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub limits: LimitConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
        }
    }
}

/// Token → identity table. Empty means passthrough (dev mode).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Session admissions per identity per window. 0 disables limiting.
    pub rate_limit: u64,
    pub rate_window_secs: u64,
    pub session: SessionLimits,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            rate_limit: 10,
            rate_window_secs: 60,
            session: SessionLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries per cache before LRU eviction.
    pub capacity: usize,
    /// TTL for cached synthesis audio.
    pub audio_ttl_secs: u64,
    /// TTL for cached generation token sequences.
    pub token_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            audio_ttl_secs: 6 * 3600,
            token_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub apology_text: String,
    pub max_history_messages: usize,
    pub segment_max_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let turn = TurnConfig::default();
        Self {
            apology_text: turn.apology_text,
            max_history_messages: turn.max_history_messages,
            segment_max_chars: turn.segment_max_chars,
        }
    }
}

impl Config {
    /// Load from a TOML file (defaults when `None`), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("VOLC_APPID") {
            self.asr.app_id = v;
        }
        if let Ok(v) = std::env::var("VOLC_TOKEN") {
            self.asr.access_token = v;
        }
        if let Ok(v) = std::env::var("SILICON_KEY") {
            self.llm.api_key = v;
        }
        if let Ok(v) = std::env::var("MINIMAX_GROUP_ID") {
            self.tts.group_id = v;
        }
        if let Ok(v) = std::env::var("MINIMAX_API_KEY") {
            self.tts.api_key = v;
        }
        if let Ok(v) = std::env::var("HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("PORT") {
            match v.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %v, "ignoring unparsable PORT"),
            }
        }
    }

    pub fn turn_config(&self) -> TurnConfig {
        TurnConfig {
            apology_text: self.pipeline.apology_text.clone(),
            max_history_messages: self.pipeline.max_history_messages,
            segment_max_chars: self.pipeline.segment_max_chars,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
