pub mod handlers;
pub mod routes;

pub use routes::create_router;

use crate::sync::SyncEngine;

/// Shared state for the HTTP layer
#[derive(Clone)]
pub struct AppState {
    pub engine: SyncEngine,
}
