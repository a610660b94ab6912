//! Blob upload and download routes.

mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn upload_router() -> Router<AppState> {
    const AUDIO_UPLOAD_LIMIT_BYTES: usize = 64 * 1024 * 1024;

    Router::new().route(
        "/files/upload",
        post(handlers::upload_file).layer(DefaultBodyLimit::max(AUDIO_UPLOAD_LIMIT_BYTES)),
    )
}

/// Download stays outside the API key guard; blob ids are unguessable.
pub fn download_router() -> Router<AppState> {
    Router::new().route("/files/:file_id", get(handlers::download_file))
}
