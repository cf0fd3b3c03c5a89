pub mod mutations;
pub mod sync;

use axum::routing::{get, post};
use axum::Router;

use crate::state::SharedState;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        // Mutations
        .route(
            "/api/v1/mutations",
            get(mutations::list)
                .post(mutations::enqueue)
                .delete(mutations::clear),
        )
        .route("/api/v1/mutations/export", get(mutations::export))
        .route("/api/v1/mutations/import", post(mutations::import))
        .route("/api/v1/mutations/retry-failed", post(mutations::retry_failed))
        .route(
            "/api/v1/mutations/{id}",
            get(mutations::get).delete(mutations::discard),
        )
        .route("/api/v1/mutations/{id}/retry", post(mutations::retry))
        .route("/api/v1/mutation-types", get(mutations::types))
        // Sync
        .route("/api/v1/sync", post(sync::trigger))
        .route("/api/v1/sync/status", get(sync::status))
        .route("/api/v1/sync/stats", get(sync::stats))
        .route("/api/v1/sync/events", get(sync::events))
}
