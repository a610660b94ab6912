use axum::{extract::Request, middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info_span;

use crate::api::auth::require_api_key;
use crate::api::request_context::attach_request_context;
use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            correlation_id = %request_id
        )
    });

    let protected = Router::new()
        .merge(crate::api::queue::router())
        .merge(crate::api::files::upload_router())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let v1_routes = Router::new()
        .merge(protected)
        .merge(crate::api::internal::router())
        .merge(crate::api::files::download_router());

    Router::new()
        .nest("/v1", v1_routes)
        .layer(trace_layer)
        .layer(middleware::from_fn(attach_request_context))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
