//! Port traits the guard engine depends on.
//!
//! Collaborators outside this subsystem (guard policy, identity, permissions,
//! approver grants) return `anyhow::Result`; the services wrap their failures.
//! The store ports return [`crate::error::Result`] and adapters map their own
//! errors into `GuardError::Internal`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conflict::PendingConflict;
use crate::entities::{
    Feature, FeatureParams, FeatureSchedule, FeatureTagRelation, FlagVariant, Rule,
};
use crate::error::Result;
use crate::registry::Editable;
use crate::types::{EntityKey, EntityKind, PendingChange, PendingChangePage, PendingChangeQuery};

// ── External collaborators ────────────────────────────────────

/// Decides which features and entities require approval.
#[async_trait]
pub trait GuardPolicy: Send + Sync {
    async fn is_feature_guarded(&self, project_id: Uuid, feature_id: Uuid) -> anyhow::Result<bool>;

    /// Guard state of the feature owning an existing entity. The guard flow
    /// decides on `is_feature_guarded` alone, since every request names its
    /// feature; this lookup serves callers that only hold an entity id.
    async fn is_entity_guarded(&self, kind: EntityKind, entity_id: Uuid) -> anyhow::Result<bool>;

    async fn get_project_active_user_count(&self, project_id: Uuid) -> anyhow::Result<i64>;
}

/// Challenge handed to the approver's authenticator app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotpChallenge {
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Password and second-factor checks.
///
/// A TOTP session is bound to the pending change it was initiated for;
/// `verify_2fa` must refuse a session presented for any other change.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify_password(&self, user_id: Uuid, password: &str) -> anyhow::Result<bool>;

    async fn verify_2fa(
        &self,
        user_id: Uuid,
        pending_change_id: Uuid,
        session_id: &str,
        code: &str,
    ) -> anyhow::Result<bool>;

    async fn initiate_totp_approval(
        &self,
        user_id: Uuid,
        pending_change_id: Uuid,
    ) -> anyhow::Result<TotpChallenge>;
}

#[async_trait]
pub trait PermissionsOracle: Send + Sync {
    async fn can_manage_project(&self, user_id: Uuid, project_id: Uuid) -> anyhow::Result<bool>;
}

/// Explicit approver grants and superuser flags.
#[async_trait]
pub trait ApproverDirectory: Send + Sync {
    async fn is_project_approver(&self, project_id: Uuid, user_id: Uuid) -> anyhow::Result<bool>;

    async fn is_superuser(&self, user_id: Uuid) -> anyhow::Result<bool>;
}

// ── Pending change store ──────────────────────────────────────

#[async_trait]
pub trait GuardStore: Send + Sync {
    /// Open a unit of work. Dropping it without `commit` rolls back.
    async fn begin(&self) -> Result<Box<dyn GuardTx>>;

    async fn get_pending_change(&self, id: Uuid) -> Result<Option<PendingChange>>;

    async fn list_pending_changes(&self, query: &PendingChangeQuery) -> Result<PendingChangePage>;
}

/// One transaction over pending changes and live configuration.
#[async_trait]
pub trait GuardTx: Send {
    /// Serialize on `keys` until the transaction ends. Callers pass them sorted.
    async fn lock_entity_keys(&mut self, keys: &[EntityKey]) -> Result<()>;

    /// Pending changes in `project_id` whose scope overlaps `keys`.
    async fn find_pending_touching(
        &mut self,
        project_id: Uuid,
        keys: &[EntityKey],
    ) -> Result<Vec<PendingConflict>>;

    async fn insert_pending_change(&mut self, change: &PendingChange) -> Result<()>;

    /// Load with a row lock held until the transaction ends.
    async fn load_pending_change_for_update(&mut self, id: Uuid) -> Result<Option<PendingChange>>;

    /// Persist status and resolution fields. The payload is never rewritten.
    async fn update_pending_status(&mut self, change: &PendingChange) -> Result<()>;

    fn features(&mut self) -> &mut dyn FeatureRepository;

    fn feature_params(&mut self) -> &mut dyn FeatureParamsRepository;

    fn rules(&mut self) -> &mut dyn EntityRepository<Rule>;

    fn variants(&mut self) -> &mut dyn EntityRepository<FlagVariant>;

    fn schedules(&mut self) -> &mut dyn EntityRepository<FeatureSchedule>;

    fn tag_relations(&mut self) -> &mut dyn TagRelationRepository;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

// ── Live configuration repositories ───────────────────────────

#[async_trait]
pub trait FeatureRepository: Send {
    async fn get_feature(&mut self, id: Uuid) -> Result<Option<Feature>>;

    async fn update_feature(&mut self, feature: &Feature) -> Result<()>;
}

#[async_trait]
pub trait FeatureParamsRepository: Send {
    async fn get_feature_params(
        &mut self,
        feature_id: Uuid,
        environment_id: Uuid,
    ) -> Result<Option<FeatureParams>>;

    async fn upsert_feature_params(&mut self, params: &FeatureParams) -> Result<()>;
}

/// Rows with their own primary key (rules, variants, schedules).
#[async_trait]
pub trait EntityRepository<T: Editable>: Send {
    async fn get(&mut self, id: Uuid) -> Result<Option<T>>;

    async fn insert(&mut self, row: &T) -> Result<()>;

    async fn update(&mut self, row: &T) -> Result<()>;

    /// Returns false when no row had that id.
    async fn delete(&mut self, id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait TagRelationRepository: Send {
    async fn tag_exists(&mut self, tag_id: Uuid) -> Result<bool>;

    async fn attach_tag(&mut self, relation: &FeatureTagRelation) -> Result<()>;

    /// Returns false when the relation did not exist.
    async fn detach_tag(&mut self, relation: &FeatureTagRelation) -> Result<bool>;
}
