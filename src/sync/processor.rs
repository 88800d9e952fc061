//! Sync processor
//!
//! `SyncEngine` ties the queue, cache, conflict store, device tracker,
//! and audit log together behind one facade. Processing is per-entity-key
//! serialized and cross-key parallel: a keyed mutex map guarantees
//! at-most-one in-flight apply per (entity_type, entity_id) while groups
//! for unrelated keys run on separate tasks. Entry tasks are spawned, so
//! a cancelled sync request cannot abandon an entry mid-SYNCING; every
//! claimed entry reaches a terminal status.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SyncEngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::registry::{EntityRegistry, EntityType};
use crate::sync::cache::OfflineCacheStore;
use crate::sync::conflict::{auto_merge, detect, ConflictStore, Detection, SyncConflict};
use crate::sync::device::{DeviceSyncStatus, DeviceTracker};
use crate::sync::log::SyncLog;
use crate::sync::queue::{SyncOperation, SyncQueue, SyncQueueEntry, SyncStatus};

type EntityKey = (EntityType, i64);

/// Outcome of processing one queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// Applied (or already applied; idempotent no-op)
    Synced,
    /// Conflict recorded, waiting for resolution
    Conflict,
    /// Conflict recorded and closed by the critical-fields merge
    AutoResolved,
    /// Apply failed; retried later or terminal
    Failed,
    /// Skipped this round (open conflict ahead of it, or already claimed)
    Deferred,
}

/// Per-entry result returned from a processing round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub entry_id: u64,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub operation: SyncOperation,
    pub outcome: ProcessOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<u64>,
}

/// A change a pulling device should apply locally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeToApply {
    pub entity_type: EntityType,
    pub entity_id: i64,
    /// Current server-side state; absent for deletions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub version: u64,
    pub is_deleted: bool,
}

/// The offline-first synchronization engine
#[derive(Clone)]
pub struct SyncEngine {
    config: SyncEngineConfig,
    registry: Arc<EntityRegistry>,
    queue: SyncQueue,
    cache: OfflineCacheStore,
    conflicts: ConflictStore,
    devices: DeviceTracker,
    log: SyncLog,
    key_locks: Arc<DashMap<EntityKey, Arc<Mutex<()>>>>,
}

impl SyncEngine {
    pub fn new(registry: EntityRegistry, config: SyncEngineConfig) -> Self {
        let log_capacity = config.log_capacity;
        Self {
            config,
            registry: Arc::new(registry),
            queue: SyncQueue::new(),
            cache: OfflineCacheStore::new(),
            conflicts: ConflictStore::new(),
            devices: DeviceTracker::new(),
            log: SyncLog::new(log_capacity),
            key_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn cache(&self) -> &OfflineCacheStore {
        &self.cache
    }

    pub fn conflicts(&self) -> &ConflictStore {
        &self.conflicts
    }

    pub fn devices(&self) -> &DeviceTracker {
        &self.devices
    }

    pub fn log(&self) -> &SyncLog {
        &self.log
    }

    /// Accept a change from a device
    ///
    /// Unknown entity types and non-object payloads are rejected here and
    /// never enter the queue.
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        operation: SyncOperation,
        payload: Value,
        device_id: &str,
        user_id: i64,
    ) -> SyncResult<SyncQueueEntry> {
        if !self.registry.contains(entity_type) {
            return Err(SyncError::UnknownEntityType(entity_type.to_string()));
        }
        if !payload.is_object() {
            return Err(SyncError::MalformedPayload(
                "payload must be a JSON object".to_string(),
            ));
        }
        let entry = self
            .queue
            .enqueue(entity_type, entity_id, operation, payload, device_id, user_id)
            .await;
        debug!(
            entry_id = entry.id,
            entity_type = %entity_type,
            entity_id,
            device_id,
            "change queued"
        );
        Ok(entry)
    }

    /// Process every eligible pending entry for a device
    ///
    /// Entries are grouped by entity key; groups run concurrently, entries
    /// inside a group strictly in submission order. Entries still inside a
    /// backoff window or waiting behind an open conflict are skipped.
    pub async fn process_pending(&self, device_id: &str) -> Vec<ProcessingResult> {
        let stuck = self.queue.requeue_stuck(&self.config).await;
        if !stuck.is_empty() {
            warn!(count = stuck.len(), "requeued stuck syncing entries");
        }
        self.queue.release_due_retries(device_id).await;

        let pending = self.queue.pending_for_device(device_id).await;
        if pending.is_empty() {
            return Vec::new();
        }

        // Group by key, preserving submission order inside each group
        let mut order: Vec<EntityKey> = Vec::new();
        let mut groups: HashMap<EntityKey, Vec<SyncQueueEntry>> = HashMap::new();
        for entry in pending {
            let key = entry.entity_key();
            if !groups.contains_key(&key) {
                order.push(key);
            }
            groups.entry(key).or_default().push(entry);
        }

        let mut handles = Vec::with_capacity(order.len());
        for key in order {
            let entries = groups.remove(&key).unwrap_or_default();
            let engine = self.clone();
            handles.push(tokio::spawn(async move {
                let mut results = Vec::with_capacity(entries.len());
                for entry in entries {
                    results.push(engine.process_entry(entry).await);
                }
                results
            }));
        }

        let mut results: Vec<ProcessingResult> = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter_map(Result::ok)
            .flatten()
            .collect();
        results.sort_by_key(|r| r.entry_id);
        results
    }

    /// Run one entry through detection and apply inside its key lock
    async fn process_entry(&self, entry: SyncQueueEntry) -> ProcessingResult {
        let lock = self
            .key_locks
            .entry(entry.entity_key())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A later change for a key with an open conflict waits its turn
        if let Some(open) = self
            .conflicts
            .open_for_key(entry.entity_type, entry.entity_id, &entry.device_id)
            .await
        {
            if open.queue_entry_id != entry.id {
                return self.result(&entry, ProcessOutcome::Deferred, None, Some(open.id));
            }
        }

        let entry = match self.queue.mark_syncing(entry.id).await {
            Ok(entry) => entry,
            // Claimed by a concurrent round
            Err(_) => return self.result(&entry, ProcessOutcome::Deferred, None, None),
        };
        let started_at = Utc::now();
        self.log_attempt(&entry, SyncStatus::Syncing, started_at, None);

        let baseline = self
            .cache
            .get(&entry.device_id, entry.entity_type, entry.entity_id)
            .await;

        match detect(&entry, baseline.as_ref()) {
            Detection::NoOp => {
                // Content already applied; do not touch the cache version
                let _ = self.queue.mark_synced(entry.id).await;
                self.log_attempt(&entry, SyncStatus::Synced, started_at, None);
                self.result(&entry, ProcessOutcome::Synced, None, None)
            }
            Detection::Apply => match self.apply(&entry, &entry.payload).await {
                Ok(()) => {
                    let _ = self.queue.mark_synced(entry.id).await;
                    self.log_attempt(&entry, SyncStatus::Synced, started_at, None);
                    self.result(&entry, ProcessOutcome::Synced, None, None)
                }
                Err(err) => self.record_failure(&entry, started_at, &err).await,
            },
            Detection::Conflict => {
                let server_snapshot = baseline
                    .as_ref()
                    .map(|b| b.data.clone())
                    .unwrap_or(Value::Null);
                let conflict = self.conflicts.create(&entry, server_snapshot.clone()).await;
                info!(
                    conflict_id = conflict.id,
                    entry_id = entry.id,
                    entity_type = %entry.entity_type,
                    entity_id = entry.entity_id,
                    "conflict detected"
                );

                // An update against a tombstoned baseline never auto-merges;
                // resurrecting a deleted record needs an operator decision
                let baseline_deleted = baseline.as_ref().map_or(false, |b| b.is_deleted);
                if entry.operation == SyncOperation::Update && !baseline_deleted {
                    let policy = self.registry.policy(entry.entity_type);
                    if let Some(merged) = auto_merge(&policy, &server_snapshot, &entry.payload) {
                        return self
                            .apply_auto_resolution(&entry, conflict.id, merged, started_at)
                            .await;
                    }
                }

                let _ = self.queue.mark_conflict(entry.id).await;
                self.log_attempt(&entry, SyncStatus::Conflict, started_at, None);
                self.result(&entry, ProcessOutcome::Conflict, None, Some(conflict.id))
            }
        }
    }

    /// Apply a merged payload produced by the critical-fields policy
    async fn apply_auto_resolution(
        &self,
        entry: &SyncQueueEntry,
        conflict_id: u64,
        merged: Value,
        started_at: DateTime<Utc>,
    ) -> ProcessingResult {
        match self.apply(entry, &merged).await {
            Ok(()) => {
                let _ = self
                    .conflicts
                    .resolve(conflict_id, merged, None, true)
                    .await;
                let _ = self.queue.mark_synced(entry.id).await;
                self.log_attempt(entry, SyncStatus::Synced, started_at, None);
                self.result(entry, ProcessOutcome::AutoResolved, None, Some(conflict_id))
            }
            Err(err) => {
                // Merge apply failed; the conflict stays open for manual
                // resolution instead of burning the retry budget
                let _ = self.queue.mark_conflict(entry.id).await;
                self.log_attempt(
                    entry,
                    SyncStatus::Conflict,
                    started_at,
                    Some(err.to_string()),
                );
                self.result(
                    entry,
                    ProcessOutcome::Conflict,
                    Some(err.to_string()),
                    Some(conflict_id),
                )
            }
        }
    }

    /// Dispatch to the entity registry and update the cache on success
    async fn apply(&self, entry: &SyncQueueEntry, payload: &Value) -> SyncResult<()> {
        let handler = self.registry.handler(entry.entity_type)?;
        let timeout = self.config.processing_timeout;

        let applied = tokio::time::timeout(timeout, async {
            match entry.operation {
                SyncOperation::Create => handler.create(entry.entity_id, payload).await.map(Some),
                SyncOperation::Update => handler.update(entry.entity_id, payload).await.map(Some),
                SyncOperation::Delete => handler.delete(entry.entity_id).await.map(|()| None),
            }
        })
        .await
        .map_err(|_| SyncError::Timeout(timeout.as_secs()))??;

        match applied {
            Some(stored) => {
                self.cache
                    .put(&entry.device_id, entry.entity_type, entry.entity_id, &stored)
                    .await;
                self.cache
                    .propagate(
                        &entry.device_id,
                        entry.entity_type,
                        entry.entity_id,
                        &stored,
                        false,
                    )
                    .await;
            }
            None => {
                self.cache
                    .mark_deleted(&entry.device_id, entry.entity_type, entry.entity_id)
                    .await;
                self.cache
                    .propagate(
                        &entry.device_id,
                        entry.entity_type,
                        entry.entity_id,
                        &Value::Null,
                        true,
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        entry: &SyncQueueEntry,
        started_at: DateTime<Utc>,
        err: &SyncError,
    ) -> ProcessingResult {
        let failed = self
            .queue
            .mark_failed(entry.id, &err.to_string(), &self.config)
            .await;
        self.log_attempt(entry, SyncStatus::Failed, started_at, Some(err.to_string()));
        if let Ok(failed) = &failed {
            if failed.next_retry_at.is_none() {
                warn!(
                    entry_id = entry.id,
                    retries = failed.retry_count,
                    "entry failed terminally"
                );
            }
        }
        self.result(entry, ProcessOutcome::Failed, Some(err.to_string()), None)
    }

    /// Changes applied by the user's other devices after `since`
    ///
    /// Returns the cache entries' current data, not the originally
    /// submitted payloads; server state is authoritative once applied.
    /// Delivery installs that state into the pulling device's own cache so
    /// it becomes the baseline for the device's next submissions.
    pub async fn get_changes_since(
        &self,
        device_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<ChangeToApply>> {
        let device = self.devices.get(device_id).await?;
        let synced = self
            .queue
            .synced_since(device_id, device.user_id, since)
            .await;

        // Latest change per key wins; earlier ones are superseded
        let mut keys: Vec<EntityKey> = Vec::new();
        for entry in &synced {
            let key = entry.entity_key();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        let mut changes = Vec::with_capacity(keys.len());
        for (entity_type, entity_id) in keys {
            // The origin device's entry holds the applied state
            let origin = synced
                .iter()
                .rev()
                .find(|e| e.entity_key() == (entity_type, entity_id))
                .map(|e| e.device_id.clone());
            let Some(origin) = origin else { continue };
            let Some(source) = self.cache.get(&origin, entity_type, entity_id).await else {
                continue;
            };

            if source.is_deleted {
                self.cache.mark_deleted(device_id, entity_type, entity_id).await;
                let version = self
                    .cache
                    .get(device_id, entity_type, entity_id)
                    .await
                    .map_or(source.version, |e| e.version);
                changes.push(ChangeToApply {
                    entity_type,
                    entity_id,
                    data: None,
                    version,
                    is_deleted: true,
                });
            } else {
                let installed = self
                    .cache
                    .put(device_id, entity_type, entity_id, &source.data)
                    .await;
                changes.push(ChangeToApply {
                    entity_type,
                    entity_id,
                    data: Some(installed.data),
                    version: installed.version,
                    is_deleted: false,
                });
            }
        }
        Ok(changes)
    }

    /// Close a conflict with an operator-approved payload and re-attempt
    /// the original operation with it
    pub async fn resolve_conflict(
        &self,
        conflict_id: u64,
        resolution: Value,
        resolved_by: Option<String>,
    ) -> SyncResult<SyncConflict> {
        let conflict = self.conflicts.get(conflict_id).await?;
        if conflict.is_resolved() {
            return Err(SyncError::ConflictAlreadyResolved(conflict_id));
        }
        let entry = self.queue.get(conflict.queue_entry_id).await?;

        let lock = self
            .key_locks
            .entry(entry.entity_key())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let started_at = Utc::now();
        self.apply(&entry, &resolution).await?;

        let resolved = self
            .conflicts
            .resolve(conflict_id, resolution, resolved_by, false)
            .await?;
        let _ = self.queue.mark_synced(entry.id).await;
        self.log_attempt(&entry, SyncStatus::Synced, started_at, None);
        info!(conflict_id, entry_id = entry.id, "conflict resolved manually");
        Ok(resolved)
    }

    /// Aggregate sync state for one device, derived from the live tables
    pub async fn device_status(&self, device_id: &str) -> SyncResult<DeviceSyncStatus> {
        let device = self.devices.get(device_id).await?;
        let counts = self.queue.status_counts(device_id).await;
        let count = |status: SyncStatus| counts.get(&status).copied().unwrap_or(0);
        Ok(DeviceSyncStatus {
            device_id: device_id.to_string(),
            pending_count: count(SyncStatus::Pending),
            syncing_count: count(SyncStatus::Syncing),
            synced_count: count(SyncStatus::Synced),
            conflict_count: count(SyncStatus::Conflict),
            failed_count: count(SyncStatus::Failed),
            unresolved_conflicts: self.conflicts.unresolved_count(device_id).await,
            last_sync_time: device.last_sync_time,
        })
    }

    /// Aggregate sync state across every device a user owns
    pub async fn user_status(&self, user_id: i64) -> Vec<DeviceSyncStatus> {
        let mut statuses = Vec::new();
        for device in self.devices.list_for_user(user_id).await {
            if let Ok(status) = self.device_status(&device.device_id).await {
                statuses.push(status);
            }
        }
        statuses
    }

    fn result(
        &self,
        entry: &SyncQueueEntry,
        outcome: ProcessOutcome,
        error_message: Option<String>,
        conflict_id: Option<u64>,
    ) -> ProcessingResult {
        ProcessingResult {
            entry_id: entry.id,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            operation: entry.operation,
            outcome,
            error_message,
            conflict_id,
        }
    }

    fn log_attempt(
        &self,
        entry: &SyncQueueEntry,
        status: SyncStatus,
        started_at: DateTime<Utc>,
        error_message: Option<String>,
    ) {
        self.log.append(
            entry.id,
            &entry.device_id,
            entry.entity_type,
            entry.operation,
            entry.entity_id,
            status,
            started_at,
            error_message,
        );
    }
}
