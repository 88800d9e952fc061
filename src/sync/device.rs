//! Device tracking
//!
//! Devices register before syncing; the tracker keeps their metadata and
//! last-sync timestamps. Aggregate statistics are derived by counting
//! queue and conflict rows, never stored separately, so they cannot drift
//! from the tables they summarize.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{SyncError, SyncResult};

/// One physical or logical client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    pub is_active: bool,
    pub registered_at: DateTime<Utc>,
}

/// Device registry behind an RwLock
#[derive(Clone, Default)]
pub struct DeviceTracker {
    devices: Arc<RwLock<HashMap<String, DeviceInfo>>>,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device or update its metadata
    pub async fn upsert(
        &self,
        device_id: &str,
        user_id: i64,
        platform: Option<String>,
        app_version: Option<String>,
    ) -> DeviceInfo {
        let mut devices = self.devices.write().await;
        match devices.get_mut(device_id) {
            Some(device) => {
                device.user_id = user_id;
                if platform.is_some() {
                    device.platform = platform;
                }
                if app_version.is_some() {
                    device.app_version = app_version;
                }
                device.is_active = true;
                device.clone()
            }
            None => {
                let device = DeviceInfo {
                    device_id: device_id.to_string(),
                    user_id,
                    last_sync_time: None,
                    platform,
                    app_version,
                    is_active: true,
                    registered_at: Utc::now(),
                };
                devices.insert(device_id.to_string(), device.clone());
                device
            }
        }
    }

    pub async fn get(&self, device_id: &str) -> SyncResult<DeviceInfo> {
        self.devices
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| SyncError::DeviceNotFound(device_id.to_string()))
    }

    /// Advance last_sync_time; it only ever moves forward
    pub async fn touch_last_sync(&self, device_id: &str) -> SyncResult<DateTime<Utc>> {
        let now = Utc::now();
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| SyncError::DeviceNotFound(device_id.to_string()))?;
        if device.last_sync_time.map_or(true, |t| now > t) {
            device.last_sync_time = Some(now);
        }
        Ok(device.last_sync_time.unwrap_or(now))
    }

    pub async fn set_active(&self, device_id: &str, is_active: bool) -> SyncResult<DeviceInfo> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| SyncError::DeviceNotFound(device_id.to_string()))?;
        device.is_active = is_active;
        Ok(device.clone())
    }

    pub async fn list_for_user(&self, user_id: i64) -> Vec<DeviceInfo> {
        let devices = self.devices.read().await;
        let mut result: Vec<DeviceInfo> = devices
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        result
    }
}

/// Aggregate sync state for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSyncStatus {
    pub device_id: String,
    pub pending_count: usize,
    pub syncing_count: usize,
    pub synced_count: usize,
    pub conflict_count: usize,
    pub failed_count: usize,
    pub unresolved_conflicts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
}
