//! HTTP submission and introspection surface.
//!
//! The protocol itself runs over the datagram substrate; this server only
//! exists so something outside the process can hand in submissions and
//! peek at the live-transaction table.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mosaic_core::Transport;

use crate::Coordinator;

pub fn router<T: Transport>(coordinator: Coordinator<T>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/commits", get(list_commits::<T>))
        .route("/api/v1/commits/{file_name}", post(submit::<T>))
        .with_state(coordinator)
}

async fn health() -> &'static str {
    "ok"
}

async fn list_commits<T: Transport>(State(coordinator): State<Coordinator<T>>) -> Response {
    Json(coordinator.active_files()).into_response()
}

/// `POST /api/v1/commits/{file_name}?source=A:a1&source=B:b1` with the
/// artifact bytes as the request body.
async fn submit<T: Transport>(
    State(coordinator): State<Coordinator<T>>,
    Path(file_name): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let sources: Vec<String> = params
        .into_iter()
        .filter(|(key, _)| key == "source")
        .map(|(_, value)| value)
        .collect();

    match coordinator.start_commit(file_name.clone(), body.to_vec(), &sources) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "file": file_name, "status": "accepted" })),
        )
            .into_response(),
        Err(report) => (StatusCode::BAD_REQUEST, report.to_string()).into_response(),
    }
}
