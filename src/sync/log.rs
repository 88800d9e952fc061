//! Sync audit log
//!
//! Append-only record of every processing attempt. One row per attempt,
//! not per queue entry: an entry retried three times leaves three rows.
//! The log is independent of the mutable queue and status tables, so the
//! history of an entry survives its later transitions.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::EntityType;
use crate::sync::queue::{SyncOperation, SyncStatus};

/// One processing attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub sequence: u64,
    pub queue_entry_id: u64,
    pub device_id: String,
    pub entity_type: EntityType,
    pub operation: SyncOperation,
    pub entity_id: i64,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Bounded in-memory audit log with a monotonic sequence
pub struct SyncLog {
    entries: Arc<RwLock<VecDeque<SyncLogEntry>>>,
    sequence: Arc<RwLock<u64>>,
    capacity: usize,
}

impl SyncLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(capacity.min(1024)))),
            sequence: Arc::new(RwLock::new(0)),
            capacity,
        }
    }

    /// Append an attempt row, returning its sequence number
    pub fn append(
        &self,
        queue_entry_id: u64,
        device_id: &str,
        entity_type: EntityType,
        operation: SyncOperation,
        entity_id: i64,
        status: SyncStatus,
        started_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> u64 {
        let mut seq = self.sequence.write().unwrap();
        *seq += 1;

        let completed_at = match status {
            SyncStatus::Pending | SyncStatus::Syncing => None,
            _ => Some(Utc::now()),
        };
        let entry = SyncLogEntry {
            sequence: *seq,
            queue_entry_id,
            device_id: device_id.to_string(),
            entity_type,
            operation,
            entity_id,
            status,
            started_at,
            completed_at,
            error_message,
        };

        let mut entries = self.entries.write().unwrap();
        entries.push_back(entry);
        if entries.len() > self.capacity {
            entries.pop_front();
        }
        *seq
    }

    /// Most recent rows for a device, newest last
    pub fn for_device(&self, device_id: &str, limit: usize) -> Vec<SyncLogEntry> {
        let entries = self.entries.read().unwrap();
        let mut result: Vec<SyncLogEntry> = entries
            .iter()
            .filter(|e| e.device_id == device_id)
            .cloned()
            .collect();
        if result.len() > limit {
            result.drain(..result.len() - limit);
        }
        result
    }

    /// Rows after a sequence number, oldest first
    pub fn entries_after(&self, after_sequence: u64, limit: usize) -> Vec<SyncLogEntry> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .filter(|e| e.sequence > after_sequence)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn current_sequence(&self) -> u64 {
        *self.sequence.read().unwrap()
    }
}

impl Clone for SyncLog {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            sequence: self.sequence.clone(),
            capacity: self.capacity,
        }
    }
}
