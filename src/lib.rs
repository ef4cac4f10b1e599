//! File relay: clients upload a file, get back an identifier, and later
//! download the file (or a byte range of it) with that identifier.
//!
//! File metadata lives in SQLite; file bytes live in an object store.

use axum::Router;
use services::relay_service::RelayService;

pub mod config;
pub mod errors;
pub mod handlers;
pub mod identifier;
pub mod models;
pub mod range;
pub mod routes;
pub mod services;

/// Build the HTTP application around an already constructed service.
pub fn build_app(service: RelayService, max_upload_bytes: usize) -> Router {
    routes::routes::routes(max_upload_bytes).with_state(service)
}
