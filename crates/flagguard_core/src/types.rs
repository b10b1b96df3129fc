//! Pending-change lifecycle types: entity diffs, payloads, statuses and queries.
//! Pure value types with no sqlx or database dependencies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::conflict;
use crate::entities::GuardEntity;
use crate::error::{GuardError, Result};

// ── Entity kind / action ──────────────────────────────────────

/// Configuration entity kinds a guarded change can touch.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Feature,
    FeatureParams,
    Rule,
    FlagVariant,
    FeatureSchedule,
    FeatureTagRelation,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityAction {
    Insert,
    Update,
    Delete,
}

/// `(kind, entity_id)`, the unit of conflict scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub entity_id: Uuid,
}

impl EntityKey {
    pub fn new(kind: EntityKind, entity_id: Uuid) -> Self {
        Self { kind, entity_id }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.entity_id)
    }
}

// ── Field-level diff ──────────────────────────────────────────

/// Old/new pair for one field. A side that is absent is omitted from JSON;
/// a side that is present but JSON `null` stays `Some(Value::Null)` so that
/// stored payloads re-serialize to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeValue {
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub old: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub new: Option<Value>,
}

fn present_value<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ChangeValue {
    pub fn update(old: Value, new: Value) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn insert(new: Value) -> Self {
        Self {
            old: None,
            new: Some(new),
        }
    }

    pub fn delete(old: Value) -> Self {
        Self {
            old: Some(old),
            new: None,
        }
    }
}

/// One row-level insert/update/delete captured as a field-level diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChange {
    pub kind: EntityKind,
    pub entity_id: Uuid,
    pub action: EntityAction,
    #[serde(default)]
    pub changes: BTreeMap<String, ChangeValue>,
}

impl EntityChange {
    pub fn new(kind: EntityKind, entity_id: Uuid, action: EntityAction) -> Self {
        Self {
            kind,
            entity_id,
            action,
            changes: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.entity_id)
    }

    /// The `new` side of a field, if the change carries one.
    pub fn new_value(&self, field: &str) -> Option<&Value> {
        self.changes.get(field).and_then(|c| c.new.as_ref())
    }

    /// The `old` side of a field, if the change carries one.
    pub fn old_value(&self, field: &str) -> Option<&Value> {
        self.changes.get(field).and_then(|c| c.old.as_ref())
    }
}

// ── Payload ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingChangeMeta {
    pub reason: String,
    pub client: String,
    pub origin: String,
    /// Advisory only: the project had exactly one active user when proposed.
    #[serde(default)]
    pub single_user_project: bool,
}

/// The replayable body of a pending change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChangePayload {
    pub entities: Vec<EntityChange>,
    pub meta: PendingChangeMeta,
}

impl PendingChangePayload {
    /// Serialize to the exact text that is persisted and later replayed.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| GuardError::Internal(anyhow::anyhow!("serialize payload: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| GuardError::Internal(anyhow::anyhow!("deserialize payload: {e}")))
    }
}

// ── Status ────────────────────────────────────────────────────

/// Pending is the only non-terminal state.
///
/// Transitions:
///   Pending → Approved (approve, after every entity applied)
///   Pending → Rejected (reject)
///   Pending → Cancelled (cancel)
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PendingChangeStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl PendingChangeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

// ── Pending change (full row) ─────────────────────────────────

/// A durable record of one proposed multi-entity edit awaiting resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: Uuid,
    pub project_id: Uuid,
    pub environment_id: Uuid,
    /// The guarded feature; its key is the first entry of the conflict scope.
    pub feature_id: Uuid,
    pub status: PendingChangeStatus,
    pub requested_by: String,
    pub requested_user_id: Option<Uuid>,
    pub change: PendingChangePayload,
    pub approved_by: Option<String>,
    pub approved_user_id: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_user_id: Option<Uuid>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub cancelled_user_id: Option<Uuid>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PendingChange {
    /// Every entity key this change holds while Pending: the synthetic
    /// feature touch first, then each entity of the payload.
    pub fn conflict_scope(&self) -> Vec<EntityKey> {
        conflict::conflict_scope(self.feature_id, &self.change.entities)
    }
}

// ── Guard request ─────────────────────────────────────────────

/// A write intercepted on a domain path, before it touches live configuration.
#[derive(Debug, Clone)]
pub struct GuardRequest {
    pub project_id: Uuid,
    pub environment_id: Uuid,
    pub feature_id: Uuid,
    pub reason: String,
    pub origin: String,
    pub action: EntityAction,
    pub old_entity: Option<GuardEntity>,
    pub new_entity: Option<GuardEntity>,
    pub requested_by: String,
    pub requested_user_id: Option<Uuid>,
}

// ── Listing ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    CreatedAtAsc,
    #[default]
    CreatedAtDesc,
}

/// Filters for listing pending changes. `user_id` matches the requester.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingChangeQuery {
    pub project_id: Option<Uuid>,
    pub status: Option<PendingChangeStatus>,
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub sort: SortOrder,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingChangePage {
    pub items: Vec<PendingChange>,
    pub total: i64,
}
