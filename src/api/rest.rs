// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; control endpoints
// require the operator token via the `OperatorAuth` extractor; the webhook
// is authenticated by its shared passphrase.
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::{verify_passphrase, OperatorAuth};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::types::Side;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/webhook", post(webhook))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/engine/start", post(engine_start))
        .route("/api/v1/engine/stop", post(engine_stop))
        .route("/api/v1/engine/panic", post(engine_panic))
        .route("/api/v1/engine/reset", post(engine_reset))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(engine)
}

fn error_response(err: &EngineError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        EngineError::Configuration(_) => StatusCode::BAD_REQUEST,
        EngineError::Auth(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() })))
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.health())
}

// =============================================================================
// Per-strategy status (authenticated)
// =============================================================================

async fn status(_auth: OperatorAuth, State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.status())
}

// =============================================================================
// Engine control (authenticated)
// =============================================================================

async fn engine_start(
    _auth: OperatorAuth,
    State(engine): State<Arc<Engine>>,
    Json(config): Json<EngineConfig>,
) -> impl IntoResponse {
    match engine.configure_and_start(config).await {
        Ok(()) => {
            info!("engine started via API");
            Json(serde_json::json!({ "ok": true })).into_response()
        }
        Err(e) => {
            warn!(error = %e, "engine start rejected");
            error_response(&e).into_response()
        }
    }
}

async fn engine_stop(_auth: OperatorAuth, State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    engine.stop();
    Json(serde_json::json!({ "ok": true, "running": engine.is_running() }))
}

async fn engine_panic(_auth: OperatorAuth, State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    engine.panic_square_off().await;
    Json(serde_json::json!({ "ok": true, "message": "square-off executed" }))
}

async fn engine_reset(_auth: OperatorAuth, State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    engine.daily_reset().await;
    Json(engine.health())
}

// =============================================================================
// Webhook (passphrase-authenticated)
// =============================================================================

#[derive(Debug, Deserialize)]
struct WebhookSignal {
    passphrase: String,
    symbol: String,
    /// "BUY" or "SELL".
    action: String,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    quantity: Option<u64>,
}

fn parse_action(action: &str) -> Option<Side> {
    match action.to_ascii_uppercase().as_str() {
        "BUY" => Some(Side::Buy),
        "SELL" => Some(Side::Sell),
        _ => None,
    }
}

async fn webhook(
    State(engine): State<Arc<Engine>>,
    Json(signal): Json<WebhookSignal>,
) -> impl IntoResponse {
    if !verify_passphrase(&signal.passphrase, engine.webhook_passphrase()) {
        warn!(symbol = %signal.symbol, "webhook rejected: bad passphrase");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid passphrase" })),
        )
            .into_response();
    }

    let Some(action) = parse_action(&signal.action) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "action must be BUY or SELL" })),
        )
            .into_response();
    };

    match engine
        .webhook_signal(&signal.symbol, action, signal.price, signal.quantity)
        .await
    {
        Ok(strategy) => {
            info!(symbol = %signal.symbol, action = %signal.action, "webhook routed");
            Json(serde_json::json!({ "status": "processed", "strategy": strategy }))
                .into_response()
        }
        Err(e) => {
            warn!(symbol = %signal.symbol, error = %e, "webhook ignored");
            Json(serde_json::json!({ "status": "ignored", "reason": e.to_string() }))
                .into_response()
        }
    }
}
