//! Batch submission and status routes.

mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    const SUBMISSION_LIMIT_BYTES: usize = 16 * 1024 * 1024;

    Router::new()
        .route(
            "/queue/submit",
            post(handlers::submit_batch).layer(DefaultBodyLimit::max(SUBMISSION_LIMIT_BYTES)),
        )
        .route("/queue/status/:batch_id", get(handlers::get_batch_status))
        .route("/queue/results/:batch_id", get(handlers::get_batch_status))
}
