pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod sync;

pub use config::SyncEngineConfig;
pub use error::{SyncError, SyncResult};
pub use registry::{default_registry, EntityHandler, EntityPolicy, EntityRegistry, EntityType};
pub use server::create_router;
pub use sync::SyncEngine;
