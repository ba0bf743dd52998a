//! Axum HTTP gateway.
//!
//! One WebSocket route carries the whole conversation; admission
//! (authentication, then rate limiting) happens before the upgrade so a
//! rejected caller gets a plain HTTP status instead of a half-open
//! socket. Process-scoped resources — provider clients, the response
//! caches, the shared counter store — are created once at startup and
//! shared by reference into every session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::asr::VolcengineAsr;
use crate::auth::{Authenticator, StaticTokenAuth};
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::errors::SessionError;
use crate::llm::SiliconFlowChat;
use crate::security::{CounterStore, FixedWindowLimiter};
use crate::session::{self, SessionContext};
use crate::tts::MinimaxTts;

/// Maximum request body size. The session transport is WebSocket
/// frames; plain HTTP bodies have no business being large here.
pub const MAX_BODY_SIZE: usize = 65_536;
/// Plain-HTTP request timeout. Does not apply to upgraded connections.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

// ── State ────────────────────────────────────────────────────────

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<dyn Authenticator>,
    pub limiter: Arc<FixedWindowLimiter>,
    pub sessions: SessionContext,
}

/// Build the process-scoped state from configuration.
pub fn build_state(config: &Config) -> AppState {
    let counter_store = Arc::new(CounterStore::new());
    let limiter = Arc::new(FixedWindowLimiter::new(
        counter_store,
        config.limits.rate_limit,
        config.limits.rate_window_secs,
    ));

    let audio_cache = Arc::new(ResponseCache::new(
        config.cache.capacity,
        Duration::from_secs(config.cache.audio_ttl_secs),
    ));
    let token_cache = Arc::new(ResponseCache::new(
        config.cache.capacity,
        Duration::from_secs(config.cache.token_ttl_secs),
    ));

    let auth = StaticTokenAuth::new(config.auth.tokens.clone());
    if auth.is_passthrough() {
        tracing::warn!("no auth tokens configured; accepting any token as its own identity");
    }

    AppState {
        auth: Arc::new(auth),
        limiter,
        sessions: SessionContext {
            transcriber: Arc::new(VolcengineAsr::new(config.asr.clone())),
            chat: Arc::new(SiliconFlowChat::new(
                config.llm.clone(),
                Some(token_cache),
            )),
            synthesizer: Arc::new(MinimaxTts::new(config.tts.clone(), audio_cache)),
            limits: config.limits.session,
            turn: config.turn_config(),
        },
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/ws/chat", get(handle_chat_ws))
        .layer(CorsLayer::new().allow_origin(Any))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .with_state(state)
}

/// Run the gateway until ctrl-c.
pub async fn run_gateway(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let state = build_state(&config);
    let app = build_router(state);

    tracing::info!(addr = %listener.local_addr()?, "voxloop gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

// ── Handlers ─────────────────────────────────────────────────────

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Resolve the caller's identity and admit or reject, before any
/// upgrade happens.
fn admit(
    state: &AppState,
    params: &HashMap<String, String>,
) -> Result<String, (StatusCode, &'static str)> {
    // Browser WebSocket clients can't set custom headers, so the token
    // arrives as a query parameter.
    let token = params
        .get("token")
        .ok_or((StatusCode::UNAUTHORIZED, "missing auth token"))?;
    let identity = state
        .auth
        .identify(token)
        .ok_or((StatusCode::UNAUTHORIZED, "invalid token"))?;
    if !state.limiter.admit(&identity) {
        let err = SessionError::RateLimited { identity };
        tracing::warn!(error = %err, "session admission denied");
        return Err((StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded"));
    }
    Ok(identity)
}

/// GET /ws/chat — WebSocket upgrade for a voice conversation session.
///
/// ## Protocol
///
/// 1. Client connects with `?token=<auth token>`
/// 2. Client sends binary frames: audio chunks for the current utterance
/// 3. Client sends a text frame `{"action":"finish_speaking"}` to end it
/// 4. Server sends text frames: `asr_partial`, `asr_final`, `llm_token`,
///    `error`, `turn_end` events
/// 5. Server sends binary frames: synthesized reply audio
async fn handle_chat_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match admit(&state, &params) {
        Ok(identity) => identity,
        Err((status, message)) => return (status, message).into_response(),
    };

    let ctx = state.sessions.clone();
    ws.on_upgrade(move |socket| session::run_session(socket, identity, ctx))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(rate_limit: u64) -> AppState {
        let mut config = Config::default();
        config.limits.rate_limit = rate_limit;
        config
            .auth
            .tokens
            .insert("tok-good".to_string(), "alice".to_string());
        build_state(&config)
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn admit_requires_a_token() {
        let state = test_state(10);
        let err = admit(&state, &params(&[])).unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn admit_rejects_unknown_tokens() {
        let state = test_state(10);
        let err = admit(&state, &params(&[("token", "tok-bad")])).unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn admit_resolves_identity_and_rate_limits() {
        let state = test_state(2);
        let p = params(&[("token", "tok-good")]);
        assert_eq!(admit(&state, &p).unwrap(), "alice");
        assert_eq!(admit(&state, &p).unwrap(), "alice");
        let err = admit(&state, &p).unwrap_err();
        assert_eq!(err.0, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let app = build_router(test_state(10));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
