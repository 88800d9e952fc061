//! HTTP handlers for the sync API
//!
//! `/sync` always answers 200 with per-change outcomes embedded in the
//! body; one failing change never blocks the rest of the batch. Only
//! structurally invalid requests (unknown device, malformed body) produce
//! a 4xx response.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::AppState;
use crate::error::SyncError;
use crate::registry::EntityType;
use crate::sync::queue::{SyncOperation, SyncStatus};
use crate::sync::{ProcessOutcome, SyncConflict};

// ==================== Request/Response Types ====================

#[derive(Debug, Deserialize)]
pub struct PendingChange {
    pub entity_type: String,
    pub entity_id: i64,
    pub operation: SyncOperation,
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub device_id: String,
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_changes: Vec<PendingChange>,
}

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    pub device_id: String,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConflictsQuery {
    pub device_id: String,
    pub resolved: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveConflictRequest {
    pub resolution: Value,
    pub resolved_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OfflineDataQuery {
    pub device_id: String,
    pub entity_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub device_id: Option<String>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub device_id: String,
    pub user_id: i64,
    pub platform: Option<String>,
    pub app_version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDeviceRequest {
    pub user_id: Option<i64>,
    pub platform: Option<String>,
    pub app_version: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DevicesQuery {
    pub user_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub device_id: String,
    pub limit: Option<usize>,
}

fn conflict_summary(conflict: &SyncConflict) -> Value {
    serde_json::json!({
        "id": conflict.id,
        "queue_entry_id": conflict.queue_entry_id,
        "entity_type": conflict.entity_type,
        "entity_id": conflict.entity_id,
        "operation": conflict.operation,
        "server_version": conflict.server_version,
        "client_version": conflict.client_version,
        "created_at": conflict.created_at,
    })
}

// ==================== Handlers ====================

/// POST /sync
/// Submit queued device changes, process them, and pull peer changes
pub async fn sync(
    State(state): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<Value>, SyncError> {
    let engine = &state.engine;
    let device = engine.devices().get(&req.device_id).await?;

    // Enqueue each change; per-change validation failures are reported in
    // the response instead of failing the batch
    let mut rejected = Vec::new();
    for change in &req.pending_changes {
        let entity_type: EntityType = match change.entity_type.parse() {
            Ok(t) => t,
            Err(err) => {
                rejected.push(serde_json::json!({
                    "entity_type": change.entity_type,
                    "entity_id": change.entity_id,
                    "error": err.to_string(),
                }));
                continue;
            }
        };
        if let Err(err) = engine
            .enqueue(
                entity_type,
                change.entity_id,
                change.operation,
                change.payload.clone(),
                &req.device_id,
                device.user_id,
            )
            .await
        {
            rejected.push(serde_json::json!({
                "entity_type": change.entity_type,
                "entity_id": change.entity_id,
                "error": err.to_string(),
            }));
        }
    }

    let results = engine.process_pending(&req.device_id).await;
    let changes_to_apply = engine
        .get_changes_since(&req.device_id, req.last_sync_time)
        .await?;
    let open_conflicts = engine
        .conflicts()
        .list_for_device(&req.device_id, Some(false))
        .await;
    let sync_time = engine.devices().touch_last_sync(&req.device_id).await?;

    let count = |outcome: ProcessOutcome| results.iter().filter(|r| r.outcome == outcome).count();
    let synced = count(ProcessOutcome::Synced) + count(ProcessOutcome::AutoResolved);
    let conflicted = count(ProcessOutcome::Conflict);
    let failed = count(ProcessOutcome::Failed);
    let deferred = count(ProcessOutcome::Deferred);
    let sync_status = serde_json::json!({
        "submitted": req.pending_changes.len(),
        "rejected": rejected,
        "results": results,
        "synced": synced,
        "conflicts": conflicted,
        "failed": failed,
        "deferred": deferred,
    });

    Ok(Json(serde_json::json!({
        "sync_time": sync_time,
        "changes_to_apply": changes_to_apply,
        "conflicts": open_conflicts.iter().map(conflict_summary).collect::<Vec<_>>(),
        "sync_status": sync_status,
    })))
}

/// GET /sync/queue?device_id=&status=
pub async fn list_queue(
    State(state): State<AppState>,
    Query(params): Query<QueueQuery>,
) -> Result<Json<Value>, SyncError> {
    state.engine.devices().get(&params.device_id).await?;
    let status = params
        .status
        .as_deref()
        .map(str::parse::<SyncStatus>)
        .transpose()?;

    let entries = state
        .engine
        .queue()
        .list_for_device(&params.device_id, status)
        .await;
    Ok(Json(serde_json::json!({ "entries": entries })))
}

/// POST /sync/queue/{id}/retry
/// Explicit retry of a FAILED entry, skipping its backoff wait
pub async fn retry_entry(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, SyncError> {
    let entry = state
        .engine
        .queue()
        .retry(id, state.engine.config())
        .await?;
    Ok(Json(serde_json::json!({ "entry": entry })))
}

/// GET /sync/conflicts?device_id=&resolved=
pub async fn list_conflicts(
    State(state): State<AppState>,
    Query(params): Query<ConflictsQuery>,
) -> Result<Json<Value>, SyncError> {
    state.engine.devices().get(&params.device_id).await?;
    let conflicts = state
        .engine
        .conflicts()
        .list_for_device(&params.device_id, params.resolved)
        .await;
    Ok(Json(serde_json::json!({ "conflicts": conflicts })))
}

/// POST /sync/conflicts/{id}/resolve
/// Close a conflict with an operator-approved payload and re-apply
pub async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<ResolveConflictRequest>,
) -> Result<Json<Value>, SyncError> {
    if !req.resolution.is_object() {
        return Err(SyncError::MalformedPayload(
            "resolution must be a JSON object".to_string(),
        ));
    }
    let conflict = state
        .engine
        .resolve_conflict(id, req.resolution, req.resolved_by)
        .await?;
    Ok(Json(serde_json::json!({ "conflict": conflict })))
}

/// GET /sync/offline-data?device_id=&entity_type=
/// Cached entries within the retention window for offline bootstrap
pub async fn offline_data(
    State(state): State<AppState>,
    Query(params): Query<OfflineDataQuery>,
) -> Result<Json<Value>, SyncError> {
    state.engine.devices().get(&params.device_id).await?;
    let entity_type = params
        .entity_type
        .as_deref()
        .map(str::parse::<EntityType>)
        .transpose()?;

    let entries = state
        .engine
        .cache()
        .list_for_device(
            &params.device_id,
            entity_type,
            state.engine.config().retention_window,
        )
        .await;
    Ok(Json(serde_json::json!({
        "entries": entries,
        "retention_window_secs": state.engine.config().retention_window.as_secs(),
    })))
}

/// GET /sync/stats?device_id= or ?user_id=
pub async fn stats(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<Value>, SyncError> {
    if let Some(device_id) = &params.device_id {
        let status = state.engine.device_status(device_id).await?;
        return Ok(Json(serde_json::json!({ "devices": [status] })));
    }
    if let Some(user_id) = params.user_id {
        let statuses = state.engine.user_status(user_id).await;
        return Ok(Json(serde_json::json!({ "devices": statuses })));
    }
    Err(SyncError::BadRequest(
        "device_id or user_id is required".to_string(),
    ))
}

/// POST /sync/devices
pub async fn register_device(
    State(state): State<AppState>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<Json<Value>, SyncError> {
    if req.device_id.trim().is_empty() {
        return Err(SyncError::BadRequest(
            "device_id must not be empty".to_string(),
        ));
    }
    let device = state
        .engine
        .devices()
        .upsert(&req.device_id, req.user_id, req.platform, req.app_version)
        .await;
    Ok(Json(serde_json::json!({ "device": device })))
}

/// PUT /sync/devices/{device_id}
pub async fn update_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(req): Json<UpdateDeviceRequest>,
) -> Result<Json<Value>, SyncError> {
    let existing = state.engine.devices().get(&device_id).await?;
    let device = state
        .engine
        .devices()
        .upsert(
            &device_id,
            req.user_id.unwrap_or(existing.user_id),
            req.platform,
            req.app_version,
        )
        .await;
    let device = match req.is_active {
        Some(active) => state.engine.devices().set_active(&device_id, active).await?,
        None => device,
    };
    Ok(Json(serde_json::json!({ "device": device })))
}

/// GET /sync/devices?user_id=
pub async fn list_devices(
    State(state): State<AppState>,
    Query(params): Query<DevicesQuery>,
) -> Result<Json<Value>, SyncError> {
    let devices = state.engine.devices().list_for_user(params.user_id).await;
    Ok(Json(serde_json::json!({ "devices": devices })))
}

/// GET /sync/log?device_id=&limit=
pub async fn sync_log(
    State(state): State<AppState>,
    Query(params): Query<LogQuery>,
) -> Result<Json<Value>, SyncError> {
    state.engine.devices().get(&params.device_id).await?;
    let rows = state
        .engine
        .log()
        .for_device(&params.device_id, params.limit.unwrap_or(100));
    Ok(Json(serde_json::json!({ "log": rows })))
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
