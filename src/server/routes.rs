use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::*;
use super::AppState;
use crate::sync::SyncEngine;

pub fn create_router(engine: SyncEngine) -> Router {
    let state = AppState { engine };

    Router::new()
        // Sync round trip
        .route("/sync", post(sync))
        // Queue
        .route("/sync/queue", get(list_queue))
        .route("/sync/queue/{id}/retry", post(retry_entry))
        // Conflicts
        .route("/sync/conflicts", get(list_conflicts))
        .route("/sync/conflicts/{id}/resolve", post(resolve_conflict))
        // Offline bootstrap
        .route("/sync/offline-data", get(offline_data))
        // Statistics
        .route("/sync/stats", get(stats))
        // Devices
        .route("/sync/devices", post(register_device))
        .route("/sync/devices", get(list_devices))
        .route("/sync/devices/{device_id}", put(update_device))
        // Audit trail
        .route("/sync/log", get(sync_log))
        // Liveness
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
