use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.max_upload_size as usize;

    let mut router = Router::new()
        // Providers and registrations
        .route("/providers", get(handlers::list_providers))
        .route("/oauth/:provider/authorize", get(handlers::authorize))
        .route("/oauth/:provider/callback", get(handlers::oauth_callback))
        .route("/registrations", get(handlers::list_registrations))
        .route("/registrations", post(handlers::create_registration))
        .route("/registrations/:id", delete(handlers::delete_registration))
        .route(
            "/registrations/:id/default",
            put(handlers::set_default_registration),
        )
        .route(
            "/registrations/:id/quota",
            post(handlers::sync_registration_quota),
        )
        .route("/quota", get(handlers::get_quota))
        // Files
        .route("/files", get(handlers::list_files))
        .route(
            "/files",
            post(handlers::upload_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/files/:id", get(handlers::get_file))
        .route("/files/:id", delete(handlers::delete_file))
        .route("/files/:id/content", get(handlers::download_file))
        .route("/files/:id/thumbnail", get(handlers::get_thumbnail))
        .route("/files/:id/share", post(handlers::create_share))
        .route("/files/:id/share/:share_id", delete(handlers::revoke_share))
        .route("/search", get(handlers::search_files))
        // Folders
        .route("/folders", post(handlers::create_folder))
        .route("/folders/:id", get(handlers::get_folder))
        .route("/folders/:id", delete(handlers::delete_folder))
        // Batch
        .route("/batch/delete", post(handlers::batch_delete))
        .route("/batch/move", post(handlers::batch_move))
        .route("/batch/copy", post(handlers::batch_copy))
        // Local share links
        .route("/share/:token", get(handlers::serve_share))
        // Internal
        .route("/_internal/health", get(handlers::health));

    // Test-only routes
    if state.config.test_mode {
        tracing::warn!("Test mode enabled, purge route is available.");
        router = router.route("/admin/purge", delete(handlers::admin_purge));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
