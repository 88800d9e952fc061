//! Entity registry
//!
//! The sync engine never inspects clinical semantics. Every domain record
//! is an opaque JSON payload identified by an `EntityType` tag and numeric
//! id, applied through an `EntityHandler` the host application registers at
//! startup. The registry also carries the per-type critical-fields policy
//! used by conflict resolution.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{SyncError, SyncResult};

/// Tag identifying the domain entity a payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Patient,
    Appointment,
    FollowUp,
    MedicalRecord,
    ChwVisit,
    Caregiver,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Patient => "patient",
            EntityType::Appointment => "appointment",
            EntityType::FollowUp => "follow_up",
            EntityType::MedicalRecord => "medical_record",
            EntityType::ChwVisit => "chw_visit",
            EntityType::Caregiver => "caregiver",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(EntityType::Patient),
            "appointment" => Ok(EntityType::Appointment),
            "follow_up" => Ok(EntityType::FollowUp),
            "medical_record" => Ok(EntityType::MedicalRecord),
            "chw_visit" => Ok(EntityType::ChwVisit),
            "caregiver" => Ok(EntityType::Caregiver),
            other => Err(SyncError::UnknownEntityType(other.to_string())),
        }
    }
}

/// Write operations the sync engine issues against a domain store
#[async_trait::async_trait]
pub trait EntityHandler: Send + Sync {
    /// Create a record with the given id and data
    async fn create(&self, id: i64, data: &Value) -> SyncResult<Value>;

    /// Update the record with the given id, returning the stored state
    async fn update(&self, id: i64, data: &Value) -> SyncResult<Value>;

    /// Delete the record with the given id
    async fn delete(&self, id: i64) -> SyncResult<()>;
}

/// Per-entity-type conflict policy
///
/// Fields listed here always take the server's value during an automatic
/// merge, and any client/server disagreement on one of them forces manual
/// resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityPolicy {
    pub critical_fields: Vec<String>,
}

impl EntityPolicy {
    pub fn new(critical_fields: &[&str]) -> Self {
        Self {
            critical_fields: critical_fields.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_critical(&self, field: &str) -> bool {
        self.critical_fields.iter().any(|f| f == field)
    }
}

/// Lookup table from entity type to handler + policy
#[derive(Clone, Default)]
pub struct EntityRegistry {
    handlers: HashMap<EntityType, Arc<dyn EntityHandler>>,
    policies: HashMap<EntityType, EntityPolicy>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler and conflict policy for an entity type
    pub fn register(
        mut self,
        entity_type: EntityType,
        handler: Arc<dyn EntityHandler>,
        policy: EntityPolicy,
    ) -> Self {
        self.handlers.insert(entity_type, handler);
        self.policies.insert(entity_type, policy);
        self
    }

    pub fn contains(&self, entity_type: EntityType) -> bool {
        self.handlers.contains_key(&entity_type)
    }

    pub fn handler(&self, entity_type: EntityType) -> SyncResult<Arc<dyn EntityHandler>> {
        self.handlers
            .get(&entity_type)
            .cloned()
            .ok_or_else(|| SyncError::UnknownEntityType(entity_type.to_string()))
    }

    pub fn policy(&self, entity_type: EntityType) -> EntityPolicy {
        self.policies.get(&entity_type).cloned().unwrap_or_default()
    }

    pub fn registered_types(&self) -> Vec<EntityType> {
        self.handlers.keys().copied().collect()
    }
}

/// In-memory entity store
///
/// Backs the stand-alone server binary and the test suite. Hosts embedding
/// the engine against a real datastore supply their own handlers instead.
#[derive(Default)]
pub struct MemoryEntityStore {
    records: RwLock<HashMap<i64, Value>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: i64) -> Option<Value> {
        self.records.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl EntityHandler for MemoryEntityStore {
    async fn create(&self, id: i64, data: &Value) -> SyncResult<Value> {
        if !data.is_object() {
            return Err(SyncError::MalformedPayload(
                "payload must be a JSON object".to_string(),
            ));
        }
        let mut records = self.records.write().await;
        if records.contains_key(&id) {
            return Err(SyncError::ApplyFailed(format!(
                "record '{}' already exists",
                id
            )));
        }
        records.insert(id, data.clone());
        Ok(data.clone())
    }

    async fn update(&self, id: i64, data: &Value) -> SyncResult<Value> {
        if !data.is_object() {
            return Err(SyncError::MalformedPayload(
                "payload must be a JSON object".to_string(),
            ));
        }
        let mut records = self.records.write().await;
        // Updates from devices may arrive before any create reached this
        // store (first sync of a record the device authored offline).
        records.insert(id, data.clone());
        Ok(data.clone())
    }

    async fn delete(&self, id: i64) -> SyncResult<()> {
        let mut records = self.records.write().await;
        records.remove(&id).ok_or(SyncError::RecordNotFound(id))?;
        Ok(())
    }
}

/// Registry wired with in-memory stores for every clinical entity type
///
/// Critical fields per type: identifiers, creation timestamps, and the
/// foreign keys and contact points other records depend on.
pub fn default_registry() -> EntityRegistry {
    EntityRegistry::new()
        .register(
            EntityType::Patient,
            Arc::new(MemoryEntityStore::new()),
            EntityPolicy::new(&["id", "patient_number", "created_at", "phone"]),
        )
        .register(
            EntityType::Appointment,
            Arc::new(MemoryEntityStore::new()),
            EntityPolicy::new(&["id", "patient_id", "created_at", "scheduled_at"]),
        )
        .register(
            EntityType::FollowUp,
            Arc::new(MemoryEntityStore::new()),
            EntityPolicy::new(&["id", "patient_id", "appointment_id", "created_at"]),
        )
        .register(
            EntityType::MedicalRecord,
            Arc::new(MemoryEntityStore::new()),
            EntityPolicy::new(&["id", "patient_id", "created_at", "recorded_by"]),
        )
        .register(
            EntityType::ChwVisit,
            Arc::new(MemoryEntityStore::new()),
            EntityPolicy::new(&["id", "patient_id", "chw_id", "created_at"]),
        )
        .register(
            EntityType::Caregiver,
            Arc::new(MemoryEntityStore::new()),
            EntityPolicy::new(&["id", "patient_id", "created_at", "phone"]),
        )
}
