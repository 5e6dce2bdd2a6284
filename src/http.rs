//! Read-only HTTP inspection API.
//!
//! Exposes room statistics, version history, and a plain-text metrics
//! exposition. Strictly observational: nothing here can mutate a room, and
//! the collaboration path never depends on this server.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::registry::RoomRegistry;
use crate::storage::VersionMeta;

#[derive(Clone)]
struct ApiState {
    registry: Arc<RoomRegistry>,
}

/// Build the inspection router over a registry.
pub fn router(registry: Arc<RoomRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/rooms/:room_id/stats", get(room_stats))
        .route("/rooms/:room_id/versions", get(list_versions))
        .route("/rooms/:room_id/versions/latest", get(latest_version))
        .route("/rooms/:room_id/versions/:version_id", get(get_version))
        .with_state(ApiState { registry })
}

/// Bind and serve the inspection API until the process exits.
pub async fn serve(
    registry: Arc<RoomRegistry>,
    bind_addr: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    log::info!("inspection api listening on {bind_addr}");
    axum::serve(listener, router(registry)).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn room_stats(
    State(state): State<ApiState>,
    Path(room_id): Path<String>,
) -> Response {
    match state.registry.get(&room_id).await {
        Some(room) => Json(room.stats().await).into_response(),
        None => (StatusCode::NOT_FOUND, "no such room").into_response(),
    }
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_versions(
    State(state): State<ApiState>,
    Path(room_id): Path<String>,
    Query(params): Query<ListParams>,
) -> Response {
    let store = match state.registry.store() {
        Some(store) => store,
        None => return (StatusCode::NOT_FOUND, "versioning disabled").into_response(),
    };
    match store.list(&room_id, params.limit.unwrap_or(50)) {
        Ok(versions) => Json(versions).into_response(),
        Err(e) => {
            log::error!("version list failed for {room_id}: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "store error").into_response()
        }
    }
}

/// One stored version with its payload, base64 over HTTP.
#[derive(Serialize)]
struct VersionPayload {
    meta: VersionMeta,
    payload_base64: String,
}

async fn latest_version(
    State(state): State<ApiState>,
    Path(room_id): Path<String>,
) -> Response {
    let store = match state.registry.store() {
        Some(store) => store,
        None => return (StatusCode::NOT_FOUND, "versioning disabled").into_response(),
    };
    let meta = match store.list(&room_id, 1) {
        Ok(mut versions) => match versions.pop() {
            Some(meta) => meta,
            None => return (StatusCode::NOT_FOUND, "no versions").into_response(),
        },
        Err(e) => {
            log::error!("version lookup failed for {room_id}: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "store error").into_response();
        }
    };
    version_response(state, room_id, meta.id).await
}

async fn get_version(
    State(state): State<ApiState>,
    Path((room_id, version_id)): Path<(String, String)>,
) -> Response {
    version_response(state, room_id, version_id).await
}

async fn version_response(state: ApiState, room_id: String, version_id: String) -> Response {
    let store = match state.registry.store() {
        Some(store) => store,
        None => return (StatusCode::NOT_FOUND, "versioning disabled").into_response(),
    };
    match store.load(&room_id, &version_id) {
        Ok(Some((meta, payload))) => Json(VersionPayload {
            meta,
            payload_base64: BASE64.encode(payload),
        })
        .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "no such version").into_response(),
        Err(e) => {
            log::error!("version load failed for {room_id}/{version_id}: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "store error").into_response()
        }
    }
}

/// Plain-text exposition of per-room gauges.
async fn metrics(State(state): State<ApiState>) -> Response {
    let stats = state.registry.stats_all().await;

    let mut body = String::new();
    body.push_str("# TYPE kn_collab_rooms gauge\n");
    body.push_str(&format!("kn_collab_rooms {}\n", stats.len()));
    body.push_str("# TYPE kn_collab_room_connections gauge\n");
    body.push_str("# TYPE kn_collab_room_logical_clock gauge\n");
    body.push_str("# TYPE kn_collab_room_awareness gauge\n");
    for room in &stats {
        let label = escape_label(&room.id);
        body.push_str(&format!(
            "kn_collab_room_connections{{room=\"{label}\"}} {}\n",
            room.connection_count
        ));
        body.push_str(&format!(
            "kn_collab_room_logical_clock{{room=\"{label}\"}} {}\n",
            room.logical_clock
        ));
        body.push_str(&format!(
            "kn_collab_room_awareness{{room=\"{label}\"}} {}\n",
            room.awareness_count
        ));
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
