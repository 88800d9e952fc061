//! Offline cache store
//!
//! Server-side snapshot of the last entity state known to each device,
//! scoped to (device_id, entity_type, entity_id). Entries serve two
//! purposes: offline bootstrap data for reconnecting devices, and the
//! baseline the conflict detector compares incoming payloads against.
//!
//! Deletions leave tombstones so a device pulling "what changed since X"
//! learns about them instead of seeing missing data. Entries older than
//! the retention window are excluded from offline-data responses but not
//! physically removed; the device re-pulls them from scratch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::registry::EntityType;

/// One cached snapshot for a (device, entity) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineCacheEntry {
    pub device_id: String,
    pub entity_type: EntityType,
    pub entity_id: i64,
    /// Full record snapshot; its `version` field mirrors `version` below
    pub data: Value,
    /// Incremented exactly once per successful apply, never decreases
    pub version: u64,
    pub last_synced: DateTime<Utc>,
    pub is_deleted: bool,
}

type CacheKey = (String, EntityType, i64);

/// In-memory cache store keyed by (device_id, entity_type, entity_id)
#[derive(Clone, Default)]
pub struct OfflineCacheStore {
    entries: Arc<RwLock<HashMap<CacheKey, OfflineCacheEntry>>>,
}

impl OfflineCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(
        &self,
        device_id: &str,
        entity_type: EntityType,
        entity_id: i64,
    ) -> Option<OfflineCacheEntry> {
        let key = (device_id.to_string(), entity_type, entity_id);
        self.entries.read().await.get(&key).cloned()
    }

    /// Store a newly applied state for a device
    ///
    /// Increments the entry version (initializing at 1), stamps
    /// last_synced, clears any tombstone, and rewrites the snapshot's
    /// `version` field to match the entry version.
    pub async fn put(
        &self,
        device_id: &str,
        entity_type: EntityType,
        entity_id: i64,
        data: &Value,
    ) -> OfflineCacheEntry {
        let key = (device_id.to_string(), entity_type, entity_id);
        let mut entries = self.entries.write().await;

        let version = entries.get(&key).map_or(1, |e| e.version + 1);
        let entry = OfflineCacheEntry {
            device_id: device_id.to_string(),
            entity_type,
            entity_id,
            data: stamp_version(data, version),
            version,
            last_synced: Utc::now(),
            is_deleted: false,
        };
        entries.insert(key, entry.clone());
        entry
    }

    /// Tombstone an entry; the row stays so the deletion still syncs out
    pub async fn mark_deleted(&self, device_id: &str, entity_type: EntityType, entity_id: i64) {
        let key = (device_id.to_string(), entity_type, entity_id);
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&key) {
            entry.is_deleted = true;
            entry.version += 1;
            entry.last_synced = Utc::now();
        }
    }

    /// Fan an applied state out to every OTHER device already tracking
    /// the key, keeping their conflict baselines current
    pub async fn propagate(
        &self,
        origin_device: &str,
        entity_type: EntityType,
        entity_id: i64,
        data: &Value,
        deleted: bool,
    ) {
        let mut entries = self.entries.write().await;
        for ((device, etype, eid), entry) in entries.iter_mut() {
            if *etype != entity_type || *eid != entity_id || device == origin_device {
                continue;
            }
            entry.version += 1;
            entry.last_synced = Utc::now();
            entry.is_deleted = deleted;
            if !deleted {
                entry.data = stamp_version(data, entry.version);
            }
        }
    }

    /// Entries for a device with last_synced inside the retention window
    ///
    /// Older entries are silently excluded; the device treats them as
    /// stale and re-syncs from scratch.
    pub async fn list_for_device(
        &self,
        device_id: &str,
        entity_type: Option<EntityType>,
        retention_window: Duration,
    ) -> Vec<OfflineCacheEntry> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention_window).unwrap_or(chrono::Duration::zero());

        let entries = self.entries.read().await;
        let mut result: Vec<OfflineCacheEntry> = entries
            .values()
            .filter(|e| e.device_id == device_id)
            .filter(|e| entity_type.map_or(true, |t| e.entity_type == t))
            .filter(|e| e.last_synced >= cutoff)
            .cloned()
            .collect();
        result.sort_by_key(|e| (e.entity_type.as_str(), e.entity_id));
        result
    }

    #[cfg(test)]
    pub async fn backdate(
        &self,
        device_id: &str,
        entity_type: EntityType,
        entity_id: i64,
        last_synced: DateTime<Utc>,
    ) {
        let key = (device_id.to_string(), entity_type, entity_id);
        if let Some(entry) = self.entries.write().await.get_mut(&key) {
            entry.last_synced = last_synced;
        }
    }
}

fn stamp_version(data: &Value, version: u64) -> Value {
    let mut data = data.clone();
    if let Some(map) = data.as_object_mut() {
        map.insert("version".to_string(), Value::from(version));
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_initializes_at_version_one() {
        let store = OfflineCacheStore::new();
        let entry = store
            .put("tablet-1", EntityType::Patient, 42, &json!({"phone": "0700000000"}))
            .await;

        assert_eq!(entry.version, 1);
        assert_eq!(entry.data["version"], 1);
        assert!(!entry.is_deleted);
    }

    #[tokio::test]
    async fn test_put_increments_version() {
        let store = OfflineCacheStore::new();
        store
            .put("tablet-1", EntityType::Patient, 42, &json!({"phone": "a"}))
            .await;
        let entry = store
            .put("tablet-1", EntityType::Patient, 42, &json!({"phone": "b"}))
            .await;

        assert_eq!(entry.version, 2);
        assert_eq!(entry.data["phone"], "b");
    }

    #[tokio::test]
    async fn test_mark_deleted_keeps_tombstone() {
        let store = OfflineCacheStore::new();
        store
            .put("tablet-1", EntityType::Patient, 42, &json!({"phone": "a"}))
            .await;
        store.mark_deleted("tablet-1", EntityType::Patient, 42).await;

        let entry = store.get("tablet-1", EntityType::Patient, 42).await.unwrap();
        assert!(entry.is_deleted);
        assert_eq!(entry.version, 2);
    }

    #[tokio::test]
    async fn test_put_clears_tombstone() {
        let store = OfflineCacheStore::new();
        store
            .put("tablet-1", EntityType::Patient, 42, &json!({"phone": "a"}))
            .await;
        store.mark_deleted("tablet-1", EntityType::Patient, 42).await;
        let entry = store
            .put("tablet-1", EntityType::Patient, 42, &json!({"phone": "b"}))
            .await;

        assert!(!entry.is_deleted);
        assert_eq!(entry.version, 3);
    }

    #[tokio::test]
    async fn test_propagate_updates_other_devices_only() {
        let store = OfflineCacheStore::new();
        store
            .put("tablet-1", EntityType::Patient, 42, &json!({"phone": "a"}))
            .await;
        store
            .put("tablet-2", EntityType::Patient, 42, &json!({"phone": "a"}))
            .await;

        store
            .propagate("tablet-1", EntityType::Patient, 42, &json!({"phone": "b"}), false)
            .await;

        let origin = store.get("tablet-1", EntityType::Patient, 42).await.unwrap();
        let peer = store.get("tablet-2", EntityType::Patient, 42).await.unwrap();

        assert_eq!(origin.data["phone"], "a");
        assert_eq!(origin.version, 1);
        assert_eq!(peer.data["phone"], "b");
        assert_eq!(peer.version, 2);
    }

    #[tokio::test]
    async fn test_propagate_does_not_create_entries() {
        let store = OfflineCacheStore::new();
        store
            .put("tablet-1", EntityType::Patient, 42, &json!({"phone": "a"}))
            .await;

        store
            .propagate("tablet-1", EntityType::Patient, 42, &json!({"phone": "b"}), false)
            .await;

        assert!(store.get("tablet-2", EntityType::Patient, 42).await.is_none());
    }

    #[tokio::test]
    async fn test_list_excludes_entries_outside_retention() {
        let store = OfflineCacheStore::new();
        store
            .put("tablet-1", EntityType::Patient, 1, &json!({"a": 1}))
            .await;
        store
            .put("tablet-1", EntityType::Patient, 2, &json!({"a": 2}))
            .await;

        // Entry 2 was last synced five days ago; retention is three days
        store
            .backdate(
                "tablet-1",
                EntityType::Patient,
                2,
                Utc::now() - chrono::Duration::days(5),
            )
            .await;

        let listed = store
            .list_for_device("tablet-1", None, Duration::from_secs(3 * 24 * 60 * 60))
            .await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].entity_id, 1);
    }

    #[tokio::test]
    async fn test_list_filters_by_entity_type() {
        let store = OfflineCacheStore::new();
        store
            .put("tablet-1", EntityType::Patient, 1, &json!({"a": 1}))
            .await;
        store
            .put("tablet-1", EntityType::Appointment, 1, &json!({"a": 2}))
            .await;

        let listed = store
            .list_for_device(
                "tablet-1",
                Some(EntityType::Appointment),
                Duration::from_secs(3600),
            )
            .await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].entity_type, EntityType::Appointment);
    }
}
