//! Offline-first synchronization engine
//!
//! This module provides:
//! - Pending-change queue with retry and exponential backoff
//! - Per-device offline cache with tombstones and a retention window
//! - Version-counter conflict detection with content-hash idempotence
//! - Critical-fields automatic resolution for update conflicts
//! - Device tracking and derived sync statistics
//! - Append-only audit log, one row per processing attempt
//!
//! Architecture:
//! - A single authoritative server, N client devices
//! - Processing is per-entity-key serialized, cross-key parallel
//! - Domain records stay opaque; writes go through the entity registry

pub mod cache;
pub mod conflict;
pub mod device;
pub mod hash;
pub mod log;
pub mod processor;
pub mod queue;

// Re-export key types
pub use cache::{OfflineCacheEntry, OfflineCacheStore};
pub use conflict::{auto_merge, detect, ConflictStore, Detection, SyncConflict};
pub use device::{DeviceInfo, DeviceSyncStatus, DeviceTracker};
pub use hash::{content_equal, content_hash};
pub use log::{SyncLog, SyncLogEntry};
pub use processor::{ChangeToApply, ProcessOutcome, ProcessingResult, SyncEngine};
pub use queue::{SyncOperation, SyncQueue, SyncQueueEntry, SyncStatus};
