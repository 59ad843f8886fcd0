use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::authz::engine::Authorizer;
use crate::authz::index::IndexStats;
use crate::authz::org_cache::{CacheStats, OrgDescendantCache};

#[derive(Clone)]
pub struct AppState {
    pub authorizer: Arc<Authorizer>,
    pub org_cache: Arc<OrgDescendantCache>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub generation: u64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub index: IndexStats,
    pub org_cache: CacheStats,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/flush", post(handle_flush))
        .route("/v1/orgs/invalidate", post(handle_invalidate))
        .route("/v1/stats", get(handle_stats))
        .route("/healthz", get(health))
        .with_state(state)
}

async fn handle_flush(State(state): State<AppState>) -> impl IntoResponse {
    match state.authorizer.flush() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_invalidate(State(state): State<AppState>) -> impl IntoResponse {
    match state.org_cache.invalidate() {
        Ok(generation) => Json(InvalidateResponse { generation }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatsResponse {
        index: state.authorizer.index().stats(),
        org_cache: state.org_cache.stats(),
    })
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
