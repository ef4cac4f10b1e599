//! Defines the relay's HTTP routes.
//!
//! ## Structure
//! - `POST /upload`: multipart upload (`file`, `bucketName`), returns `{"uuid"}`
//! - `GET  /download?uuid=...`: download, honours a single `Range: bytes=...`
//! - `GET  /healthz`, `GET /readyz`: liveness and readiness

use crate::{
    handlers::{
        file_handlers::{download_file, upload_file},
        health_handlers::{healthz, readyz},
    },
    services::relay_service::RelayService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Build the router. Handlers share the `RelayService` state.
///
/// `max_upload_bytes` caps the multipart body accepted by `/upload`.
pub fn routes(max_upload_bytes: usize) -> Router<RelayService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/upload",
            post(upload_file).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/download", get(download_file))
        .layer(TraceLayer::new_for_http())
}
