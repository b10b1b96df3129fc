//! In-process [`GuardStore`] for tests and embedders without a database.
//!
//! A transaction holds the store-wide lock for its whole life and works on a
//! copy of the state; `commit` swaps the copy in, anything else discards it.
//! Do not call the store's read methods while a transaction is open on the
//! same task.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::conflict::{overlapping_keys, PendingConflict};
use crate::entities::{
    Feature, FeatureParams, FeatureSchedule, FeatureTagRelation, FlagVariant, Rule,
};
use crate::error::{GuardError, Result};
use crate::ports::{
    EntityRepository, FeatureParamsRepository, FeatureRepository, GuardStore, GuardTx,
    TagRelationRepository,
};
use crate::types::{
    EntityKey, PendingChange, PendingChangePage, PendingChangePayload, PendingChangeQuery,
    PendingChangeStatus, SortOrder,
};

/// Pending row as persisted: the payload lives only as text.
#[derive(Debug, Clone)]
struct StoredPending {
    row: PendingChange,
    payload: String,
}

impl StoredPending {
    fn load(&self) -> Result<PendingChange> {
        let mut change = self.row.clone();
        change.change = PendingChangePayload::from_json(&self.payload)?;
        Ok(change)
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    pending: BTreeMap<Uuid, StoredPending>,
    features: HashMap<Uuid, Feature>,
    feature_params: HashMap<(Uuid, Uuid), FeatureParams>,
    rules: HashMap<Uuid, Rule>,
    variants: HashMap<Uuid, FlagVariant>,
    schedules: HashMap<Uuid, FeatureSchedule>,
    tags: HashSet<Uuid>,
    tag_relations: BTreeSet<FeatureTagRelation>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryGuardStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryGuardStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Seeding ───────────────────────────────────────────────

    pub async fn seed_feature(&self, feature: Feature) {
        let mut state = self.state.lock().await;
        if let Some(params) = &feature.params {
            state
                .feature_params
                .insert((feature.id, params.environment_id), params.clone());
        }
        state.features.insert(
            feature.id,
            Feature {
                params: None,
                ..feature
            },
        );
    }

    pub async fn seed_feature_params(&self, params: FeatureParams) {
        self.state
            .lock()
            .await
            .feature_params
            .insert((params.feature_id, params.environment_id), params);
    }

    pub async fn seed_rule(&self, rule: Rule) {
        self.state.lock().await.rules.insert(rule.id, rule);
    }

    pub async fn seed_variant(&self, variant: FlagVariant) {
        self.state.lock().await.variants.insert(variant.id, variant);
    }

    pub async fn seed_schedule(&self, schedule: FeatureSchedule) {
        self.state.lock().await.schedules.insert(schedule.id, schedule);
    }

    pub async fn seed_tag(&self, tag_id: Uuid) {
        self.state.lock().await.tags.insert(tag_id);
    }

    pub async fn seed_tag_relation(&self, relation: FeatureTagRelation) {
        let mut state = self.state.lock().await;
        state.tags.insert(relation.tag_id);
        state.tag_relations.insert(relation);
    }

    /// Store a pending change with a caller-supplied payload text, bypassing
    /// the guard. The text must parse as a payload.
    pub async fn insert_raw_pending(&self, row: PendingChange, payload: String) -> Result<()> {
        PendingChangePayload::from_json(&payload)?;
        self.state
            .lock()
            .await
            .pending
            .insert(row.id, StoredPending { row, payload });
        Ok(())
    }

    // ── Inspection ────────────────────────────────────────────

    pub async fn feature(&self, id: Uuid) -> Option<Feature> {
        self.state.lock().await.features.get(&id).cloned()
    }

    pub async fn feature_params_row(
        &self,
        feature_id: Uuid,
        environment_id: Uuid,
    ) -> Option<FeatureParams> {
        self.state
            .lock()
            .await
            .feature_params
            .get(&(feature_id, environment_id))
            .cloned()
    }

    pub async fn rule(&self, id: Uuid) -> Option<Rule> {
        self.state.lock().await.rules.get(&id).cloned()
    }

    pub async fn variant(&self, id: Uuid) -> Option<FlagVariant> {
        self.state.lock().await.variants.get(&id).cloned()
    }

    pub async fn schedule(&self, id: Uuid) -> Option<FeatureSchedule> {
        self.state.lock().await.schedules.get(&id).cloned()
    }

    pub async fn has_tag_relation(&self, relation: &FeatureTagRelation) -> bool {
        self.state.lock().await.tag_relations.contains(relation)
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// The exact payload text stored for a pending change.
    pub async fn payload_json(&self, id: Uuid) -> Option<String> {
        self.state
            .lock()
            .await
            .pending
            .get(&id)
            .map(|p| p.payload.clone())
    }
}

#[async_trait]
impl GuardStore for InMemoryGuardStore {
    async fn begin(&self) -> Result<Box<dyn GuardTx>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn get_pending_change(&self, id: Uuid) -> Result<Option<PendingChange>> {
        let state = self.state.lock().await;
        state.pending.get(&id).map(StoredPending::load).transpose()
    }

    async fn list_pending_changes(&self, query: &PendingChangeQuery) -> Result<PendingChangePage> {
        let state = self.state.lock().await;
        let mut matching: Vec<&StoredPending> = state
            .pending
            .values()
            .filter(|p| query.project_id.map_or(true, |id| p.row.project_id == id))
            .filter(|p| query.status.map_or(true, |s| p.row.status == s))
            .filter(|p| {
                query
                    .user_id
                    .map_or(true, |id| p.row.requested_user_id == Some(id))
            })
            .collect();
        matching.sort_by_key(|p| (p.row.created_at, p.row.id));
        if query.sort == SortOrder::CreatedAtDesc {
            matching.reverse();
        }

        let total = matching.len() as i64;
        let offset = usize::try_from(query.offset.max(0)).unwrap_or(usize::MAX);
        let limit = query
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l.max(0)).unwrap_or(usize::MAX));
        let items = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(StoredPending::load)
            .collect::<Result<Vec<_>>>()?;
        Ok(PendingChangePage { items, total })
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl GuardTx for MemoryTx {
    // The store-wide lock is already held for the life of the transaction.
    async fn lock_entity_keys(&mut self, _keys: &[EntityKey]) -> Result<()> {
        Ok(())
    }

    async fn find_pending_touching(
        &mut self,
        project_id: Uuid,
        keys: &[EntityKey],
    ) -> Result<Vec<PendingConflict>> {
        let mut conflicts = Vec::new();
        for stored in self.working.pending.values() {
            let row = &stored.row;
            if row.project_id != project_id || row.status != PendingChangeStatus::Pending {
                continue;
            }
            let scope = stored.load()?.conflict_scope();
            let overlap = overlapping_keys(keys, &scope);
            if !overlap.is_empty() {
                conflicts.push(PendingConflict {
                    pending_change_id: row.id,
                    keys: overlap,
                });
            }
        }
        Ok(conflicts)
    }

    async fn insert_pending_change(&mut self, change: &PendingChange) -> Result<()> {
        if self.working.pending.contains_key(&change.id) {
            return Err(GuardError::Internal(anyhow::anyhow!(
                "pending change {} already exists",
                change.id
            )));
        }
        let payload = change.change.to_json()?;
        self.working.pending.insert(
            change.id,
            StoredPending {
                row: change.clone(),
                payload,
            },
        );
        Ok(())
    }

    async fn load_pending_change_for_update(&mut self, id: Uuid) -> Result<Option<PendingChange>> {
        self.working
            .pending
            .get(&id)
            .map(StoredPending::load)
            .transpose()
    }

    async fn update_pending_status(&mut self, change: &PendingChange) -> Result<()> {
        let stored = self
            .working
            .pending
            .get_mut(&change.id)
            .ok_or_else(|| GuardError::NotFound(format!("pending change {}", change.id)))?;
        // Keep the stored payload text; only resolution fields move.
        let change_payload = std::mem::replace(&mut stored.row, change.clone()).change;
        stored.row.change = change_payload;
        Ok(())
    }

    fn features(&mut self) -> &mut dyn FeatureRepository {
        self
    }

    fn feature_params(&mut self) -> &mut dyn FeatureParamsRepository {
        self
    }

    fn rules(&mut self) -> &mut dyn EntityRepository<Rule> {
        self
    }

    fn variants(&mut self) -> &mut dyn EntityRepository<FlagVariant> {
        self
    }

    fn schedules(&mut self) -> &mut dyn EntityRepository<FeatureSchedule> {
        self
    }

    fn tag_relations(&mut self) -> &mut dyn TagRelationRepository {
        self
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FeatureRepository for MemoryTx {
    async fn get_feature(&mut self, id: Uuid) -> Result<Option<Feature>> {
        Ok(self.working.features.get(&id).cloned())
    }

    async fn update_feature(&mut self, feature: &Feature) -> Result<()> {
        let row = self
            .working
            .features
            .get_mut(&feature.id)
            .ok_or_else(|| GuardError::NotFound(format!("feature {}", feature.id)))?;
        *row = Feature {
            params: None,
            ..feature.clone()
        };
        Ok(())
    }
}

#[async_trait]
impl FeatureParamsRepository for MemoryTx {
    async fn get_feature_params(
        &mut self,
        feature_id: Uuid,
        environment_id: Uuid,
    ) -> Result<Option<FeatureParams>> {
        Ok(self
            .working
            .feature_params
            .get(&(feature_id, environment_id))
            .cloned())
    }

    async fn upsert_feature_params(&mut self, params: &FeatureParams) -> Result<()> {
        self.working
            .feature_params
            .insert((params.feature_id, params.environment_id), params.clone());
        Ok(())
    }
}

macro_rules! memory_entity_repository {
    ($ty:ty, $table:ident) => {
        #[async_trait]
        impl EntityRepository<$ty> for MemoryTx {
            async fn get(&mut self, id: Uuid) -> Result<Option<$ty>> {
                Ok(self.working.$table.get(&id).cloned())
            }

            async fn insert(&mut self, row: &$ty) -> Result<()> {
                if self.working.$table.contains_key(&row.id) {
                    return Err(GuardError::Internal(anyhow::anyhow!(
                        "{} {} already exists",
                        stringify!($table),
                        row.id
                    )));
                }
                self.working.$table.insert(row.id, row.clone());
                Ok(())
            }

            async fn update(&mut self, row: &$ty) -> Result<()> {
                match self.working.$table.get_mut(&row.id) {
                    Some(existing) => {
                        *existing = row.clone();
                        Ok(())
                    }
                    None => Err(GuardError::NotFound(format!(
                        "{} {}",
                        stringify!($table),
                        row.id
                    ))),
                }
            }

            async fn delete(&mut self, id: Uuid) -> Result<bool> {
                Ok(self.working.$table.remove(&id).is_some())
            }
        }
    };
}

memory_entity_repository!(Rule, rules);
memory_entity_repository!(FlagVariant, variants);
memory_entity_repository!(FeatureSchedule, schedules);

#[async_trait]
impl TagRelationRepository for MemoryTx {
    async fn tag_exists(&mut self, tag_id: Uuid) -> Result<bool> {
        Ok(self.working.tags.contains(&tag_id))
    }

    async fn attach_tag(&mut self, relation: &FeatureTagRelation) -> Result<()> {
        self.working.tag_relations.insert(*relation);
        Ok(())
    }

    async fn detach_tag(&mut self, relation: &FeatureTagRelation) -> Result<bool> {
        Ok(self.working.tag_relations.remove(relation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::types::{PendingChangeMeta, PendingChangePayload};

    fn pending(project_id: Uuid) -> PendingChange {
        PendingChange {
            id: Uuid::new_v4(),
            project_id,
            environment_id: Uuid::new_v4(),
            feature_id: Uuid::new_v4(),
            status: PendingChangeStatus::Pending,
            requested_by: "alice".into(),
            requested_user_id: None,
            change: PendingChangePayload {
                entities: vec![],
                meta: PendingChangeMeta::default(),
            },
            approved_by: None,
            approved_user_id: None,
            approved_at: None,
            rejected_by: None,
            rejected_user_id: None,
            rejected_at: None,
            rejection_reason: None,
            cancelled_by: None,
            cancelled_user_id: None,
            cancelled_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = InMemoryGuardStore::new();
        let change = pending(Uuid::new_v4());
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_pending_change(&change).await.unwrap();
        }
        assert_eq!(store.pending_count().await, 0);

        let mut tx = store.begin().await.unwrap();
        tx.insert_pending_change(&change).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.pending_count().await, 1);
    }

    #[tokio::test]
    async fn pending_touch_is_scoped_by_project() {
        let store = InMemoryGuardStore::new();
        let change = pending(Uuid::new_v4());
        let mut tx = store.begin().await.unwrap();
        tx.insert_pending_change(&change).await.unwrap();
        let touch = change.conflict_scope();

        let same = tx
            .find_pending_touching(change.project_id, &touch)
            .await
            .unwrap();
        assert_eq!(same.len(), 1);
        assert_eq!(same[0].pending_change_id, change.id);

        let other = tx
            .find_pending_touching(Uuid::new_v4(), &touch)
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn listing_filters_sorts_and_pages() {
        let store = InMemoryGuardStore::new();
        let project_id = Uuid::new_v4();
        let requester = Uuid::new_v4();
        let base = Utc::now();
        let mut tx = store.begin().await.unwrap();
        for i in 0..5 {
            let mut change = pending(project_id);
            change.created_at = base + chrono::Duration::seconds(i);
            change.requested_user_id = (i % 2 == 0).then_some(requester);
            tx.insert_pending_change(&change).await.unwrap();
        }
        tx.insert_pending_change(&pending(Uuid::new_v4()))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let page = store
            .list_pending_changes(&PendingChangeQuery {
                project_id: Some(project_id),
                limit: Some(2),
                offset: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert!(page.items[0].created_at > page.items[1].created_at);
        assert_eq!(page.items[0].created_at, base + chrono::Duration::seconds(3));

        let mine = store
            .list_pending_changes(&PendingChangeQuery {
                user_id: Some(requester),
                sort: SortOrder::CreatedAtAsc,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(mine.total, 3);
        assert_eq!(mine.items[0].created_at, base);
    }
}
