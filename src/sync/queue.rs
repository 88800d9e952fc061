//! Sync queue
//!
//! Holds every change a device has submitted and tracks it through the
//! status state machine: PENDING → SYNCING → {SYNCED | CONFLICT | FAILED}.
//! A failed attempt lands in FAILED behind an exponential backoff gate
//! and returns to PENDING while retries remain; once the budget is
//! exhausted FAILED is terminal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::SyncEngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::registry::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOperation::Create => f.write_str("create"),
            SyncOperation::Update => f.write_str("update"),
            SyncOperation::Delete => f.write_str("delete"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Conflict,
    Failed,
}

impl std::str::FromStr for SyncStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "conflict" => Ok(SyncStatus::Conflict),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(SyncError::BadRequest(format!(
                "unknown status '{}'",
                other
            ))),
        }
    }
}

/// One submitted change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub id: u64,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub operation: SyncOperation,
    pub payload: Value,
    pub device_id: String,
    pub user_id: i64,
    pub status: SyncStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// Entry is not eligible for processing before this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Set while SYNCING, used to requeue entries from crashed attempts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syncing_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncQueueEntry {
    pub fn entity_key(&self) -> (EntityType, i64) {
        (self.entity_type, self.entity_id)
    }
}

/// In-memory queue with monotonic entry ids (id order == submission order)
#[derive(Clone, Default)]
pub struct SyncQueue {
    entries: Arc<RwLock<HashMap<u64, SyncQueueEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        operation: SyncOperation,
        payload: Value,
        device_id: &str,
        user_id: i64,
    ) -> SyncQueueEntry {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let entry = SyncQueueEntry {
            id,
            entity_type,
            entity_id,
            operation,
            payload,
            device_id: device_id.to_string(),
            user_id,
            status: SyncStatus::Pending,
            error_message: None,
            retry_count: 0,
            next_retry_at: None,
            syncing_since: None,
            created_at: now,
            updated_at: now,
        };
        self.entries.write().await.insert(id, entry.clone());
        entry
    }

    pub async fn get(&self, id: u64) -> SyncResult<SyncQueueEntry> {
        self.entries
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SyncError::EntryNotFound(id))
    }

    /// PENDING entries for a device that are past their backoff gate,
    /// in submission order
    pub async fn pending_for_device(&self, device_id: &str) -> Vec<SyncQueueEntry> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        let mut pending: Vec<SyncQueueEntry> = entries
            .values()
            .filter(|e| e.device_id == device_id && e.status == SyncStatus::Pending)
            .filter(|e| e.next_retry_at.map_or(true, |at| at <= now))
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.id);
        pending
    }

    /// Claim a PENDING entry for processing; fails if someone else already
    /// moved it out of PENDING
    pub async fn mark_syncing(&self, id: u64) -> SyncResult<SyncQueueEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(SyncError::EntryNotFound(id))?;
        if entry.status != SyncStatus::Pending {
            return Err(SyncError::BadRequest(format!(
                "entry '{}' is not pending",
                id
            )));
        }
        entry.status = SyncStatus::Syncing;
        entry.syncing_since = Some(Utc::now());
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    pub async fn mark_synced(&self, id: u64) -> SyncResult<SyncQueueEntry> {
        self.transition(id, SyncStatus::Synced).await
    }

    pub async fn mark_conflict(&self, id: u64) -> SyncResult<SyncQueueEntry> {
        self.transition(id, SyncStatus::Conflict).await
    }

    async fn transition(&self, id: u64, status: SyncStatus) -> SyncResult<SyncQueueEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(SyncError::EntryNotFound(id))?;
        entry.status = status;
        entry.syncing_since = None;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// Record a failed attempt
    ///
    /// The entry lands in FAILED. While retries remain it carries a
    /// backoff gate and is released back to PENDING by
    /// `release_due_retries`; once retry_count exceeds max_retries the
    /// gate is cleared and FAILED is terminal.
    pub async fn mark_failed(
        &self,
        id: u64,
        error: &str,
        config: &SyncEngineConfig,
    ) -> SyncResult<SyncQueueEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(SyncError::EntryNotFound(id))?;

        entry.retry_count += 1;
        entry.error_message = Some(error.to_string());
        entry.syncing_since = None;
        entry.status = SyncStatus::Failed;
        entry.updated_at = Utc::now();

        if entry.retry_count > config.max_retries {
            entry.next_retry_at = None;
        } else {
            let delay = config.retry_delay(entry.retry_count);
            entry.next_retry_at = Some(
                Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
            );
        }
        Ok(entry.clone())
    }

    /// Move FAILED entries whose backoff expired back to PENDING
    ///
    /// This is the only automatic FAILED → PENDING transition, so the
    /// retry bound holds by construction: entries past max_retries carry
    /// no gate and are never released.
    pub async fn release_due_retries(&self, device_id: &str) -> Vec<u64> {
        let now = Utc::now();
        let mut released = Vec::new();
        let mut entries = self.entries.write().await;
        for entry in entries.values_mut() {
            if entry.device_id != device_id || entry.status != SyncStatus::Failed {
                continue;
            }
            let Some(at) = entry.next_retry_at else {
                continue;
            };
            if at > now {
                continue;
            }
            entry.status = SyncStatus::Pending;
            entry.next_retry_at = None;
            entry.updated_at = now;
            released.push(entry.id);
        }
        released
    }

    /// Explicit retry of a FAILED entry, skipping the backoff wait
    ///
    /// Entries past the retry budget are terminal and stay that way.
    pub async fn retry(&self, id: u64, config: &SyncEngineConfig) -> SyncResult<SyncQueueEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(SyncError::EntryNotFound(id))?;

        if entry.status != SyncStatus::Failed {
            return Err(SyncError::BadRequest(format!(
                "entry '{}' is not failed",
                id
            )));
        }
        if entry.retry_count > config.max_retries {
            return Err(SyncError::RetryExhausted(id));
        }
        entry.status = SyncStatus::Pending;
        entry.next_retry_at = None;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// Requeue SYNCING entries whose attempt outlived the processing
    /// timeout (crashed or abandoned workers)
    pub async fn requeue_stuck(&self, config: &SyncEngineConfig) -> Vec<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(config.processing_timeout)
                .unwrap_or(chrono::Duration::zero());

        let mut requeued = Vec::new();
        let mut entries = self.entries.write().await;
        for entry in entries.values_mut() {
            if entry.status != SyncStatus::Syncing {
                continue;
            }
            let Some(since) = entry.syncing_since else {
                continue;
            };
            if since > cutoff {
                continue;
            }
            entry.retry_count += 1;
            entry.syncing_since = None;
            entry.error_message = Some("processing timed out".to_string());
            entry.updated_at = Utc::now();
            if entry.retry_count > config.max_retries {
                entry.status = SyncStatus::Failed;
            } else {
                entry.status = SyncStatus::Pending;
                entry.next_retry_at = None;
            }
            requeued.push(entry.id);
        }
        requeued
    }

    /// Entries for a device, optionally filtered by status
    pub async fn list_for_device(
        &self,
        device_id: &str,
        status: Option<SyncStatus>,
    ) -> Vec<SyncQueueEntry> {
        let entries = self.entries.read().await;
        let mut result: Vec<SyncQueueEntry> = entries
            .values()
            .filter(|e| e.device_id == device_id)
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        result.sort_by_key(|e| e.id);
        result
    }

    /// SYNCED entries from other devices of the same user updated after
    /// the given instant, in apply order
    pub async fn synced_since(
        &self,
        exclude_device: &str,
        user_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Vec<SyncQueueEntry> {
        let entries = self.entries.read().await;
        let mut result: Vec<SyncQueueEntry> = entries
            .values()
            .filter(|e| e.status == SyncStatus::Synced)
            .filter(|e| e.user_id == user_id && e.device_id != exclude_device)
            .filter(|e| since.map_or(true, |t| e.updated_at > t))
            .cloned()
            .collect();
        result.sort_by_key(|e| e.updated_at);
        result
    }

    /// Status counts for a device's entries
    pub async fn status_counts(&self, device_id: &str) -> HashMap<SyncStatus, usize> {
        let entries = self.entries.read().await;
        let mut counts = HashMap::new();
        for entry in entries.values().filter(|e| e.device_id == device_id) {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        counts
    }

    #[cfg(test)]
    pub async fn force_syncing_since(&self, id: u64, since: DateTime<Utc>) {
        if let Some(entry) = self.entries.write().await.get_mut(&id) {
            entry.status = SyncStatus::Syncing;
            entry.syncing_since = Some(since);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> SyncEngineConfig {
        SyncEngineConfig::default()
    }

    async fn enqueue_one(queue: &SyncQueue) -> SyncQueueEntry {
        queue
            .enqueue(
                EntityType::Patient,
                42,
                SyncOperation::Update,
                json!({"version": 1, "phone": "0700000000"}),
                "tablet-1",
                7,
            )
            .await
    }

    #[tokio::test]
    async fn test_enqueue_assigns_submission_order() {
        let queue = SyncQueue::new();
        let a = enqueue_one(&queue).await;
        let b = enqueue_one(&queue).await;
        assert!(b.id > a.id);
        assert_eq!(a.status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_happy_path_transitions() {
        let queue = SyncQueue::new();
        let entry = enqueue_one(&queue).await;

        let entry = queue.mark_syncing(entry.id).await.unwrap();
        assert_eq!(entry.status, SyncStatus::Syncing);
        assert!(entry.syncing_since.is_some());

        let entry = queue.mark_synced(entry.id).await.unwrap();
        assert_eq!(entry.status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_mark_syncing_requires_pending() {
        let queue = SyncQueue::new();
        let entry = enqueue_one(&queue).await;
        queue.mark_syncing(entry.id).await.unwrap();

        assert!(queue.mark_syncing(entry.id).await.is_err());
    }

    #[tokio::test]
    async fn test_failure_sets_backoff_gate() {
        let queue = SyncQueue::new();
        let entry = enqueue_one(&queue).await;
        queue.mark_syncing(entry.id).await.unwrap();

        let entry = queue
            .mark_failed(entry.id, "downstream rejected", &config())
            .await
            .unwrap();
        assert_eq!(entry.status, SyncStatus::Failed);
        assert_eq!(entry.retry_count, 1);
        assert!(entry.next_retry_at.unwrap() > Utc::now());
        assert_eq!(entry.error_message.as_deref(), Some("downstream rejected"));

        // Still backing off, so neither pending nor released
        assert!(queue.pending_for_device("tablet-1").await.is_empty());
        assert!(queue.release_due_retries("tablet-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let queue = SyncQueue::new();
        let cfg = config();
        let entry = enqueue_one(&queue).await;

        // max_retries failures each leave the entry retriable
        for attempt in 1..=cfg.max_retries {
            queue.mark_syncing(entry.id).await.unwrap();
            let e = queue.mark_failed(entry.id, "boom", &cfg).await.unwrap();
            assert!(e.next_retry_at.is_some(), "attempt {}", attempt);
            queue.retry(entry.id, &cfg).await.unwrap();
        }

        // The (max_retries + 1)-th failure is terminal: no gate, no retry
        queue.mark_syncing(entry.id).await.unwrap();
        let e = queue.mark_failed(entry.id, "boom", &cfg).await.unwrap();
        assert_eq!(e.status, SyncStatus::Failed);
        assert_eq!(e.retry_count, cfg.max_retries + 1);
        assert!(e.next_retry_at.is_none());

        let err = queue.retry(entry.id, &cfg).await.unwrap_err();
        assert!(matches!(err, SyncError::RetryExhausted(_)));
    }

    #[tokio::test]
    async fn test_explicit_retry_only_from_failed() {
        let queue = SyncQueue::new();
        let cfg = config();
        let entry = enqueue_one(&queue).await;

        assert!(queue.retry(entry.id, &cfg).await.is_err());

        queue.mark_syncing(entry.id).await.unwrap();
        queue.mark_failed(entry.id, "boom", &cfg).await.unwrap();

        let e = queue.retry(entry.id, &cfg).await.unwrap();
        assert_eq!(e.status, SyncStatus::Pending);
        assert!(e.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_release_due_retries() {
        let queue = SyncQueue::new();
        let cfg = config();
        let entry = enqueue_one(&queue).await;
        queue.mark_syncing(entry.id).await.unwrap();
        queue.mark_failed(entry.id, "boom", &cfg).await.unwrap();

        // Force the gate into the past
        {
            let mut entries = queue.entries.write().await;
            entries.get_mut(&entry.id).unwrap().next_retry_at =
                Some(Utc::now() - chrono::Duration::seconds(1));
        }

        let released = queue.release_due_retries("tablet-1").await;
        assert_eq!(released, vec![entry.id]);
        let entry = queue.get(entry.id).await.unwrap();
        assert_eq!(entry.status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_requeue_stuck_entries() {
        let queue = SyncQueue::new();
        let cfg = config();
        let entry = enqueue_one(&queue).await;

        queue
            .force_syncing_since(entry.id, Utc::now() - chrono::Duration::seconds(120))
            .await;

        let requeued = queue.requeue_stuck(&cfg).await;
        assert_eq!(requeued, vec![entry.id]);

        let entry = queue.get(entry.id).await.unwrap();
        assert_eq!(entry.status, SyncStatus::Pending);
        assert_eq!(entry.retry_count, 1);
    }

    #[tokio::test]
    async fn test_requeue_leaves_fresh_syncing_alone() {
        let queue = SyncQueue::new();
        let entry = enqueue_one(&queue).await;
        queue.mark_syncing(entry.id).await.unwrap();

        assert!(queue.requeue_stuck(&config()).await.is_empty());
        let entry = queue.get(entry.id).await.unwrap();
        assert_eq!(entry.status, SyncStatus::Syncing);
    }

    #[tokio::test]
    async fn test_synced_since_filters_peer_devices() {
        let queue = SyncQueue::new();
        let mine = enqueue_one(&queue).await;
        let theirs = queue
            .enqueue(
                EntityType::Patient,
                43,
                SyncOperation::Update,
                json!({"version": 1}),
                "tablet-2",
                7,
            )
            .await;
        let other_user = queue
            .enqueue(
                EntityType::Patient,
                44,
                SyncOperation::Update,
                json!({"version": 1}),
                "tablet-3",
                8,
            )
            .await;

        for id in [mine.id, theirs.id, other_user.id] {
            queue.mark_syncing(id).await.unwrap();
            queue.mark_synced(id).await.unwrap();
        }

        let synced = queue.synced_since("tablet-1", 7, None).await;
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].device_id, "tablet-2");
    }

    #[tokio::test]
    async fn test_status_counts() {
        let queue = SyncQueue::new();
        let a = enqueue_one(&queue).await;
        enqueue_one(&queue).await;
        queue.mark_syncing(a.id).await.unwrap();
        queue.mark_synced(a.id).await.unwrap();

        let counts = queue.status_counts("tablet-1").await;
        assert_eq!(counts.get(&SyncStatus::Pending), Some(&1));
        assert_eq!(counts.get(&SyncStatus::Synced), Some(&1));
    }
}
