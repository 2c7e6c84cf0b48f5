// =============================================================================
// REST API — Axum 0.7 façade over the engine
// =============================================================================
//
// Endpoints:
//   GET  /api/status            — engine counters + heartbeat
//   GET  /api/trades?limit=N    — newest-first trade journal
//   GET  /api/decisions?limit=N — newest-first decision journal
//   POST /api/force-trade       — operator-initiated idempotent paper trade
//   POST /api/settings          — confidence threshold / auto-paper /
//                                 breaker reset
//
// CORS honours CORS_ORIGIN; with no origin configured the façade stays
// permissive for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::engine::{Engine, ForceTradeRequest};

/// Build the full router with CORS middleware and shared state.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = match engine.config.cors_origin.as_deref() {
        Some(origin) => match origin.parse::<axum::http::HeaderValue>() {
            Ok(value) => CorsLayer::new()
                .allow_origin([value])
                .allow_methods(Any)
                .allow_headers(Any),
            Err(_) => {
                warn!(origin, "invalid CORS_ORIGIN, falling back to permissive");
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
            }
        },
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    };

    Router::new()
        .route("/api/status", get(status))
        .route("/api/trades", get(trades))
        .route("/api/decisions", get(decisions))
        .route("/api/force-trade", post(force_trade))
        .route("/api/settings", post(settings))
        .layer(cors)
        .with_state(engine)
}

// =============================================================================
// Handlers
// =============================================================================

async fn status(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.status_snapshot())
}

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn trades(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match engine.history.recent_trades(query.limit.min(500)).await {
        Ok(trades) => Json(trades).into_response(),
        Err(e) => journal_error(e),
    }
}

async fn decisions(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match engine.history.recent_decisions(query.limit.min(500)).await {
        Ok(decisions) => Json(decisions).into_response(),
        Err(e) => journal_error(e),
    }
}

async fn force_trade(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<ForceTradeRequest>,
) -> impl IntoResponse {
    match engine.force_trade(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            warn!(error = %e, "force trade rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsRequest {
    #[serde(default)]
    confidence_threshold: Option<f64>,
    #[serde(default)]
    auto_paper: Option<bool>,
    #[serde(default)]
    reset_breaker: Option<bool>,
}

async fn settings(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<SettingsRequest>,
) -> impl IntoResponse {
    if let Some(threshold) = req.confidence_threshold {
        engine.status.set_confidence_threshold(threshold);
        info!(threshold, "confidence threshold updated via API");
    }
    if let Some(auto_paper) = req.auto_paper {
        engine
            .status
            .auto_paper
            .store(auto_paper, std::sync::atomic::Ordering::Relaxed);
        info!(auto_paper, "auto-paper updated via API");
    }
    if req.reset_breaker == Some(true) {
        engine.breaker.reset();
        info!("circuit breaker reset via API");
    }
    Json(engine.status_snapshot())
}

fn journal_error(e: anyhow::Error) -> axum::response::Response {
    warn!(error = %e, "journal read failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "journal unavailable" })),
    )
        .into_response()
}
