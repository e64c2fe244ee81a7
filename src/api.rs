// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HTTP diagnostics API — runs alongside the storage daemon.
//!
//! Endpoints (all read-only):
//!   GET /api/status                       → engine statistics (JSON)
//!   GET /api/sensors                      → all sensor snapshots
//!   GET /api/sensors/{source}/{id}        → one sensor snapshot
//!   GET /api/sensors/{source}/{id}/count?lane=gateway → unread count

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::engine::Engine;
use crate::source::{UploadSource, ALL_SOURCES};

/// Shared state passed to all handlers.
pub struct AppState {
    pub engine: Arc<Engine>,
}

fn parse_source(name: &str) -> Option<UploadSource> {
    ALL_SOURCES.iter().copied().find(|s| s.dir_name() == name)
}

async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.stats())
}

async fn get_sensors(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshots: Vec<_> = state.engine.sensors().iter().map(|h| h.snapshot()).collect();
    Json(snapshots)
}

async fn get_sensor(
    State(state): State<Arc<AppState>>,
    Path((source, id)): Path<(String, u32)>,
) -> impl IntoResponse {
    let Some(source) = parse_source(&source) else {
        return (StatusCode::BAD_REQUEST, format!("unknown upload source '{source}'"))
            .into_response();
    };
    match state
        .engine
        .sensors()
        .into_iter()
        .find(|h| h.source == source && h.config.id == id)
    {
        Some(handle) => Json(handle.snapshot()).into_response(),
        None => (StatusCode::NOT_FOUND, format!("sensor {source}/{id} not found")).into_response(),
    }
}

#[derive(Deserialize)]
struct CountParams {
    /// Upload lane doing the counting; defaults to the sensor's own.
    lane: Option<String>,
}

async fn get_sensor_count(
    State(state): State<Arc<AppState>>,
    Path((source, id)): Path<(String, u32)>,
    Query(params): Query<CountParams>,
) -> impl IntoResponse {
    let Some(source) = parse_source(&source) else {
        return (StatusCode::BAD_REQUEST, format!("unknown upload source '{source}'"))
            .into_response();
    };
    let lane = match params.lane.as_deref() {
        Some(name) => match parse_source(name) {
            Some(lane) => lane,
            None => {
                return (StatusCode::BAD_REQUEST, format!("unknown lane '{name}'"))
                    .into_response()
            }
        },
        None => source,
    };
    match state
        .engine
        .sensors()
        .into_iter()
        .find(|h| h.source == source && h.config.id == id)
    {
        Some(handle) => {
            let count = state.engine.new_sample_count(lane, &handle);
            Json(serde_json::json!({ "source": source, "id": id, "lane": lane, "count": count }))
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, format!("sensor {source}/{id} not found")).into_response(),
    }
}

/// Bind and serve until the process exits.
pub async fn start_server(state: Arc<AppState>, port: u16) {
    let app = Router::new()
        .route("/api/status", get(get_status))
        .route("/api/sensors", get(get_sensors))
        .route("/api/sensors/{source}/{id}", get(get_sensor))
        .route("/api/sensors/{source}/{id}/count", get(get_sensor_count))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    info!(addr = %addr, "Diagnostics API listening");
    match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server stopped");
            }
        }
        Err(e) => {
            error!(addr = %addr, error = %e, "Cannot bind API port");
        }
    }
}
