//! Conflict detection and resolution
//!
//! A conflict is a disagreement between a device's submitted version of an
//! entity and the server's current state for that device. Detection runs
//! against the offline cache baseline using the version counter, with a
//! content hash as the equality short-circuit. Update conflicts where only
//! non-critical fields drifted resolve automatically; everything else
//! waits for a manual resolution payload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{SyncError, SyncResult};
use crate::registry::{EntityPolicy, EntityType};
use crate::sync::cache::OfflineCacheEntry;
use crate::sync::hash::content_equal;
use crate::sync::queue::{SyncOperation, SyncQueueEntry};

/// Outcome of running the detector against a queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Safe to apply through the registry
    Apply,
    /// Payload is content-identical to the baseline; nothing to do
    NoOp,
    /// Client and server disagree; a conflict record is required
    Conflict,
}

/// Detect whether a queue entry conflicts with its cache baseline
///
/// Creates never conflict (no baseline to disagree with), and neither do
/// entries for keys the device has no cache entry for. Otherwise the
/// content hash decides idempotence and the version counter decides
/// agreement.
pub fn detect(entry: &SyncQueueEntry, baseline: Option<&OfflineCacheEntry>) -> Detection {
    if entry.operation == SyncOperation::Create {
        return Detection::Apply;
    }
    let Some(baseline) = baseline else {
        return Detection::Apply;
    };

    if entry.operation != SyncOperation::Delete
        && content_equal(&entry.payload, &baseline.data)
        && !baseline.is_deleted
    {
        return Detection::NoOp;
    }

    match client_version(&entry.payload) {
        Some(v) if v == baseline.version => Detection::Apply,
        // A delete without a version claim carries no baseline opinion;
        // the registry stays the authority on whether the target exists.
        None if entry.operation == SyncOperation::Delete => Detection::Apply,
        _ => Detection::Conflict,
    }
}

fn client_version(payload: &Value) -> Option<u64> {
    payload.get("version").and_then(Value::as_u64)
}

/// A detected disagreement between client and server state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: u64,
    pub queue_entry_id: u64,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub device_id: String,
    pub user_id: i64,
    pub operation: SyncOperation,
    /// Server snapshot at detection time
    pub server_version: Value,
    /// What the client submitted
    pub client_version: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    pub auto_resolved: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SyncConflict {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Attempt the automatic critical-fields merge for an update conflict
///
/// Succeeds only when every field that differs between client and server
/// is non-critical for the entity type (the `version` field is counter
/// metadata and is ignored). The merged payload takes the server's value
/// for every critical field and the client's value everywhere else.
pub fn auto_merge(policy: &EntityPolicy, server: &Value, client: &Value) -> Option<Value> {
    let (Some(server_map), Some(client_map)) = (server.as_object(), client.as_object()) else {
        return None;
    };

    for (field, client_value) in client_map {
        if field == "version" || !policy.is_critical(field) {
            continue;
        }
        match server_map.get(field) {
            Some(server_value) if server_value == client_value => {}
            _ => return None,
        }
    }
    for field in server_map.keys() {
        if field != "version" && policy.is_critical(field) && !client_map.contains_key(field) {
            return None;
        }
    }

    let mut merged = client_map.clone();
    for (field, server_value) in server_map {
        if field != "version" && policy.is_critical(field) {
            merged.insert(field.clone(), server_value.clone());
        }
    }
    merged.remove("version");
    Some(Value::Object(merged))
}

/// Conflict records behind an RwLock, one unresolved conflict per key
#[derive(Clone, Default)]
pub struct ConflictStore {
    conflicts: Arc<RwLock<HashMap<u64, SyncConflict>>>,
    next_id: Arc<AtomicU64>,
}

impl ConflictStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new conflict for a queue entry
    pub async fn create(&self, entry: &SyncQueueEntry, server_version: Value) -> SyncConflict {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let conflict = SyncConflict {
            id,
            queue_entry_id: entry.id,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            device_id: entry.device_id.clone(),
            user_id: entry.user_id,
            operation: entry.operation,
            server_version,
            client_version: entry.payload.clone(),
            resolution: None,
            resolved_by: None,
            auto_resolved: false,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.conflicts.write().await.insert(id, conflict.clone());
        conflict
    }

    pub async fn get(&self, id: u64) -> SyncResult<SyncConflict> {
        self.conflicts
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SyncError::ConflictNotFound(id))
    }

    /// The unresolved conflict for a key, if one exists
    pub async fn open_for_key(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        device_id: &str,
    ) -> Option<SyncConflict> {
        self.conflicts
            .read()
            .await
            .values()
            .find(|c| {
                !c.is_resolved()
                    && c.entity_type == entity_type
                    && c.entity_id == entity_id
                    && c.device_id == device_id
            })
            .cloned()
    }

    /// Close a conflict with a resolution payload
    pub async fn resolve(
        &self,
        id: u64,
        resolution: Value,
        resolved_by: Option<String>,
        auto_resolved: bool,
    ) -> SyncResult<SyncConflict> {
        let mut conflicts = self.conflicts.write().await;
        let conflict = conflicts
            .get_mut(&id)
            .ok_or(SyncError::ConflictNotFound(id))?;
        if conflict.is_resolved() {
            return Err(SyncError::ConflictAlreadyResolved(id));
        }
        conflict.resolution = Some(resolution);
        conflict.resolved_by = resolved_by;
        conflict.auto_resolved = auto_resolved;
        conflict.resolved_at = Some(Utc::now());
        Ok(conflict.clone())
    }

    pub async fn list_for_device(
        &self,
        device_id: &str,
        resolved: Option<bool>,
    ) -> Vec<SyncConflict> {
        let conflicts = self.conflicts.read().await;
        let mut result: Vec<SyncConflict> = conflicts
            .values()
            .filter(|c| c.device_id == device_id)
            .filter(|c| resolved.map_or(true, |r| c.is_resolved() == r))
            .cloned()
            .collect();
        result.sort_by_key(|c| c.id);
        result
    }

    pub async fn unresolved_count(&self, device_id: &str) -> usize {
        self.conflicts
            .read()
            .await
            .values()
            .filter(|c| c.device_id == device_id && !c.is_resolved())
            .count()
    }
}
