use axum::{Json, extract::Extension, http::StatusCode};
use std::sync::Arc;

use super::protocol::{RegisterRequest, RegisterResponse};
use crate::server::registry::TableServer;

pub async fn handle_register(
    Extension(server): Extension<Arc<TableServer>>,
    Json(req): Json<RegisterRequest>,
) -> (StatusCode, Json<RegisterResponse>) {
    let accepted = server.accept_registration(req.node);
    let status = if accepted {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(RegisterResponse { accepted }))
}
