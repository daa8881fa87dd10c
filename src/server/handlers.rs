use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

use super::registry::TableServer;
use crate::assignment::handlers::handle_register;
use crate::assignment::protocol::{ControlMessage, ENDPOINT_CONTROL, ENDPOINT_REGISTER};
use crate::table::global::TableStats;
use crate::table::protocol::{
    AckResponse, ENDPOINT_SHARD_ASSIGNMENT, ENDPOINT_TABLE_GET, ENDPOINT_TABLE_STATS,
    ENDPOINT_TABLE_UPDATES, GetRequest, GetResponse, ShardAssignment, UpdateBatch,
};

/// Routes of a node's table server.
pub fn router(server: Arc<TableServer>) -> Router {
    Router::new()
        .route(ENDPOINT_TABLE_GET, post(handle_table_get))
        .route(ENDPOINT_TABLE_UPDATES, post(handle_table_updates))
        .route(ENDPOINT_SHARD_ASSIGNMENT, post(handle_shard_assignment))
        .route(ENDPOINT_REGISTER, post(handle_register))
        .route(ENDPOINT_CONTROL, post(handle_control))
        .route(ENDPOINT_TABLE_STATS, get(handle_all_stats))
        .route(&format!("{}/:table_id", ENDPOINT_TABLE_STATS), get(handle_table_stats))
        .layer(Extension(server))
}

pub async fn handle_table_get(
    Extension(server): Extension<Arc<TableServer>>,
    Json(req): Json<GetRequest>,
) -> (StatusCode, Json<GetResponse>) {
    match server.handle_get(&req) {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(e) => {
            tracing::error!("Failed to serve GET: {}", e);
            (StatusCode::NOT_FOUND, Json(GetResponse::missing()))
        }
    }
}

pub async fn handle_table_updates(
    Extension(server): Extension<Arc<TableServer>>,
    Json(batch): Json<UpdateBatch>,
) -> (StatusCode, Json<AckResponse>) {
    match server.apply_updates(&batch) {
        Ok(applied) => (
            StatusCode::OK,
            Json(AckResponse {
                success: true,
                applied,
            }),
        ),
        Err(e) => {
            tracing::error!("Failed to apply batch {} from {}: {}", batch.batch_id, batch.source, e);
            (
                StatusCode::BAD_REQUEST,
                Json(AckResponse {
                    success: false,
                    applied: 0,
                }),
            )
        }
    }
}

pub async fn handle_shard_assignment(
    Extension(server): Extension<Arc<TableServer>>,
    Json(assignment): Json<ShardAssignment>,
) -> (StatusCode, Json<AckResponse>) {
    let applied = server.apply_assignment(&assignment);
    (
        StatusCode::OK,
        Json(AckResponse {
            success: true,
            applied,
        }),
    )
}

pub async fn handle_control(
    Extension(server): Extension<Arc<TableServer>>,
    Json(message): Json<ControlMessage>,
) -> (StatusCode, Json<AckResponse>) {
    server.accept_control(&message);
    (
        StatusCode::OK,
        Json(AckResponse {
            success: true,
            applied: 0,
        }),
    )
}

pub async fn handle_all_stats(
    Extension(server): Extension<Arc<TableServer>>,
) -> (StatusCode, Json<Vec<TableStats>>) {
    (StatusCode::OK, Json(server.stats()))
}

pub async fn handle_table_stats(
    Extension(server): Extension<Arc<TableServer>>,
    Path(table_id): Path<u32>,
) -> (StatusCode, Json<Option<TableStats>>) {
    match server.table_stats(table_id) {
        Some(stats) => (StatusCode::OK, Json(Some(stats))),
        None => (StatusCode::NOT_FOUND, Json(None)),
    }
}
