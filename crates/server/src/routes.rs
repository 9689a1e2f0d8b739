//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let file_route = get(handlers::download_file)
        .head(handlers::head_file)
        .post(handlers::upload_file)
        .delete(handlers::remove_file)
        // File bodies are bounded by limits.max_file_size_bytes while streaming.
        .layer(DefaultBodyLimit::disable());

    Router::new()
        // Health check, unauthenticated for load balancers
        .route("/health", get(handlers::health_check))
        .route("/upload", post(handlers::create_upload))
        .route(
            "/upload/{upload_id}",
            get(handlers::get_upload)
                .delete(handlers::remove_upload)
                .patch(handlers::set_upload_ttl),
        )
        .route("/file/{upload_id}", post(handlers::add_file))
        .route(
            "/file/{upload_id}/{file_name}",
            post(handlers::upload_new_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/file/{upload_id}/{file_id}/{file_name}", file_route)
        .route(
            "/stream/{upload_id}/{file_id}/{file_name}",
            get(handlers::download_file).head(handlers::head_file),
        )
        .route(
            "/archive/{upload_id}/{archive_name}",
            get(handlers::download_archive).head(handlers::head_archive),
        )
        .route("/admin/uploads", get(handlers::list_uploads))
        .route("/admin/stats", get(handlers::get_statistics))
        .route("/admin/clean", post(handlers::run_cleaning))
        .layer(DefaultBodyLimit::max(state.config.server.max_request_body_bytes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
