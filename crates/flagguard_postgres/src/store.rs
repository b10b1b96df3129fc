//! Postgres implementation of the guard store ports.
//!
//! All SQL is runtime-checked (sqlx::query, not sqlx::query!) to avoid a
//! compile-time DB requirement. A `PgGuardTx` wraps one sqlx transaction;
//! dropping it uncommitted rolls back.

use std::collections::BTreeMap;

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use flagguard_core::conflict::{advisory_lock_id, overlapping_keys, PendingConflict};
use flagguard_core::entities::{
    Feature, FeatureParams, FeatureSchedule, FeatureTagRelation, FlagVariant, Rule,
};
use flagguard_core::error::{GuardError, Result};
use flagguard_core::ports::{
    EntityRepository, FeatureParamsRepository, FeatureRepository, GuardStore, GuardTx,
    TagRelationRepository,
};
use flagguard_core::types::{
    EntityKey, EntityKind, PendingChange, PendingChangePage, PendingChangeQuery, SortOrder,
};

use crate::sqlx_types::{
    duration_ms, PgFeatureParamsRow, PgFeatureRow, PgFeatureScheduleRow, PgFlagVariantRow,
    PgPendingChangeRow, PgRuleRow, PENDING_CHANGE_COLUMNS,
};

fn into_pending(row: PgPendingChangeRow) -> Result<PendingChange> {
    row.try_into()
        .map_err(|e: String| GuardError::Internal(anyhow!(e)))
}

// ── PgGuardStore ──────────────────────────────────────────────

pub struct PgGuardStore {
    pool: PgPool,
}

impl PgGuardStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl GuardStore for PgGuardStore {
    async fn begin(&self) -> Result<Box<dyn GuardTx>> {
        let tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        Ok(Box::new(PgGuardTx { tx }))
    }

    async fn get_pending_change(&self, id: Uuid) -> Result<Option<PendingChange>> {
        let query = format!("SELECT {PENDING_CHANGE_COLUMNS} FROM pending_changes WHERE id = $1");
        let row = sqlx::query_as::<_, PgPendingChangeRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        row.map(into_pending).transpose()
    }

    async fn list_pending_changes(&self, query: &PendingChangeQuery) -> Result<PendingChangePage> {
        const FILTER: &str = r#"
            WHERE ($1::uuid IS NULL OR project_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR requested_user_id = $3)
        "#;
        let order = match query.sort {
            SortOrder::CreatedAtAsc => "ASC",
            SortOrder::CreatedAtDesc => "DESC",
        };
        let status = query.status.map(|s| s.as_ref().to_string());

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM pending_changes {FILTER}"
        ))
        .bind(query.project_id)
        .bind(status.as_deref())
        .bind(query.user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        let sql = format!(
            "SELECT {PENDING_CHANGE_COLUMNS} FROM pending_changes {FILTER} \
             ORDER BY created_at {order}, id {order} LIMIT $4 OFFSET $5"
        );
        let rows = sqlx::query_as::<_, PgPendingChangeRow>(&sql)
            .bind(query.project_id)
            .bind(status.as_deref())
            .bind(query.user_id)
            .bind(query.limit)
            .bind(query.offset.max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        let items = rows
            .into_iter()
            .map(into_pending)
            .collect::<Result<Vec<_>>>()?;
        Ok(PendingChangePage { items, total })
    }
}

// ── PgGuardTx ─────────────────────────────────────────────────

pub struct PgGuardTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl GuardTx for PgGuardTx {
    async fn lock_entity_keys(&mut self, keys: &[EntityKey]) -> Result<()> {
        tracing::debug!(count = keys.len(), "acquiring entity key locks");
        for key in keys {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(advisory_lock_id(key))
                .execute(&mut *self.tx)
                .await
                .map_err(|e| anyhow!(e))?;
        }
        Ok(())
    }

    async fn find_pending_touching(
        &mut self,
        project_id: Uuid,
        keys: &[EntityKey],
    ) -> Result<Vec<PendingConflict>> {
        let kinds: Vec<String> = keys.iter().map(|k| k.kind.to_string()).collect();
        let ids: Vec<Uuid> = keys.iter().map(|k| k.entity_id).collect();
        let rows: Vec<(Uuid, String, Uuid)> = sqlx::query_as(
            r#"
            SELECT s.pending_change_id, s.entity_kind, s.entity_id
            FROM pending_change_scope s
            JOIN pending_changes p ON p.id = s.pending_change_id
            WHERE s.project_id = $1
              AND p.status = 'pending'
              AND (s.entity_kind, s.entity_id) IN (
                  SELECT * FROM UNNEST($2::text[], $3::uuid[])
              )
            ORDER BY p.created_at, s.pending_change_id
            "#,
        )
        .bind(project_id)
        .bind(&kinds)
        .bind(&ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;

        let mut order: Vec<Uuid> = Vec::new();
        let mut held: BTreeMap<Uuid, Vec<EntityKey>> = BTreeMap::new();
        for (pending_change_id, kind, entity_id) in rows {
            let kind: EntityKind = kind
                .parse()
                .map_err(|_| GuardError::Internal(anyhow!("unknown entity kind '{kind}'")))?;
            if !held.contains_key(&pending_change_id) {
                order.push(pending_change_id);
            }
            held.entry(pending_change_id)
                .or_default()
                .push(EntityKey::new(kind, entity_id));
        }
        Ok(order
            .into_iter()
            .map(|id| PendingConflict {
                pending_change_id: id,
                keys: overlapping_keys(keys, held.get(&id).map(Vec::as_slice).unwrap_or(&[])),
            })
            .collect())
    }

    async fn insert_pending_change(&mut self, change: &PendingChange) -> Result<()> {
        let payload = change.change.to_json()?;
        sqlx::query(
            r#"
            INSERT INTO pending_changes (
                id, project_id, environment_id, feature_id, status,
                requested_by, requested_user_id, change, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(change.id)
        .bind(change.project_id)
        .bind(change.environment_id)
        .bind(change.feature_id)
        .bind(change.status.as_ref())
        .bind(&change.requested_by)
        .bind(change.requested_user_id)
        .bind(&payload)
        .bind(change.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;

        let scope = change.conflict_scope();
        let kinds: Vec<String> = scope.iter().map(|k| k.kind.to_string()).collect();
        let ids: Vec<Uuid> = scope.iter().map(|k| k.entity_id).collect();
        sqlx::query(
            r#"
            INSERT INTO pending_change_scope (pending_change_id, project_id, entity_kind, entity_id)
            SELECT $1, $2, k.kind, k.id
            FROM UNNEST($3::text[], $4::uuid[]) AS k(kind, id)
            "#,
        )
        .bind(change.id)
        .bind(change.project_id)
        .bind(&kinds)
        .bind(&ids)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;

        tracing::debug!(
            pending_change_id = %change.id,
            scope = scope.len(),
            "inserted pending change"
        );
        Ok(())
    }

    async fn load_pending_change_for_update(&mut self, id: Uuid) -> Result<Option<PendingChange>> {
        let query = format!(
            "SELECT {PENDING_CHANGE_COLUMNS} FROM pending_changes WHERE id = $1 FOR UPDATE"
        );
        let row = sqlx::query_as::<_, PgPendingChangeRow>(&query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        row.map(into_pending).transpose()
    }

    async fn update_pending_status(&mut self, change: &PendingChange) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE pending_changes
            SET status = $2,
                approved_by = $3, approved_user_id = $4, approved_at = $5,
                rejected_by = $6, rejected_user_id = $7, rejected_at = $8,
                rejection_reason = $9,
                cancelled_by = $10, cancelled_user_id = $11, cancelled_at = $12
            WHERE id = $1
            "#,
        )
        .bind(change.id)
        .bind(change.status.as_ref())
        .bind(&change.approved_by)
        .bind(change.approved_user_id)
        .bind(change.approved_at)
        .bind(&change.rejected_by)
        .bind(change.rejected_user_id)
        .bind(change.rejected_at)
        .bind(&change.rejection_reason)
        .bind(&change.cancelled_by)
        .bind(change.cancelled_user_id)
        .bind(change.cancelled_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;
        if result.rows_affected() == 0 {
            return Err(GuardError::NotFound(format!("pending change {}", change.id)));
        }

        if change.status.is_terminal() {
            sqlx::query("DELETE FROM pending_change_scope WHERE pending_change_id = $1")
                .bind(change.id)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| anyhow!(e))?;
        }
        tracing::debug!(
            pending_change_id = %change.id,
            status = %change.status,
            "updated pending change status"
        );
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
        self.tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        if let Err(e) = self.tx.rollback().await {
            tracing::warn!(error = %e, "guard transaction rollback failed");
            return Err(GuardError::Internal(anyhow!(e)));
        }
        Ok(())
    }
}

// ── Live configuration ────────────────────────────────────────

#[async_trait]
impl FeatureRepository for PgGuardTx {
    async fn get_feature(&mut self, id: Uuid) -> Result<Option<Feature>> {
        let row = sqlx::query_as::<_, PgFeatureRow>(
            r#"
            SELECT id, project_id, key, name, description, rollout_key, value_type, permanent
            FROM features
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(row.map(Feature::from))
    }

    async fn update_feature(&mut self, feature: &Feature) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE features
            SET name = $2, description = $3, rollout_key = $4, value_type = $5, permanent = $6
            WHERE id = $1
            "#,
        )
        .bind(feature.id)
        .bind(&feature.name)
        .bind(&feature.description)
        .bind(&feature.rollout_key)
        .bind(&feature.value_type)
        .bind(feature.permanent)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }
}

#[async_trait]
impl FeatureParamsRepository for PgGuardTx {
    async fn get_feature_params(
        &mut self,
        feature_id: Uuid,
        environment_id: Uuid,
    ) -> Result<Option<FeatureParams>> {
        let row = sqlx::query_as::<_, PgFeatureParamsRow>(
            r#"
            SELECT feature_id, environment_id, enabled, default_value
            FROM feature_params
            WHERE feature_id = $1 AND environment_id = $2
            FOR UPDATE
            "#,
        )
        .bind(feature_id)
        .bind(environment_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(row.map(FeatureParams::from))
    }

    async fn upsert_feature_params(&mut self, params: &FeatureParams) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feature_params (feature_id, environment_id, enabled, default_value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (feature_id, environment_id)
            DO UPDATE SET enabled = EXCLUDED.enabled, default_value = EXCLUDED.default_value
            "#,
        )
        .bind(params.feature_id)
        .bind(params.environment_id)
        .bind(params.enabled)
        .bind(&params.default_value)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }
}

#[async_trait]
impl EntityRepository<Rule> for PgGuardTx {
    async fn get(&mut self, id: Uuid) -> Result<Option<Rule>> {
        let row = sqlx::query_as::<_, PgRuleRow>(
            r#"
            SELECT id, feature_id, project_id, environment_id, name, priority, value,
                   rollout_percent, condition
            FROM rules
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(row.map(Rule::from))
    }

    async fn insert(&mut self, row: &Rule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rules (id, feature_id, project_id, environment_id, name, priority, value,
                               rollout_percent, condition)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(row.id)
        .bind(row.feature_id)
        .bind(row.project_id)
        .bind(row.environment_id)
        .bind(&row.name)
        .bind(row.priority)
        .bind(&row.value)
        .bind(row.rollout_percent)
        .bind(row.condition.as_ref().map(Json))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn update(&mut self, row: &Rule) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE rules
            SET name = $2, priority = $3, value = $4, rollout_percent = $5, condition = $6
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(row.priority)
        .bind(&row.value)
        .bind(row.rollout_percent)
        .bind(row.condition.as_ref().map(Json))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn delete(&mut self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM rules WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl EntityRepository<FlagVariant> for PgGuardTx {
    async fn get(&mut self, id: Uuid) -> Result<Option<FlagVariant>> {
        let row = sqlx::query_as::<_, PgFlagVariantRow>(
            r#"
            SELECT id, feature_id, project_id, name, rollout_percent
            FROM flag_variants
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(row.map(FlagVariant::from))
    }

    async fn insert(&mut self, row: &FlagVariant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO flag_variants (id, feature_id, project_id, name, rollout_percent)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(row.id)
        .bind(row.feature_id)
        .bind(row.project_id)
        .bind(&row.name)
        .bind(row.rollout_percent)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn update(&mut self, row: &FlagVariant) -> Result<()> {
        sqlx::query("UPDATE flag_variants SET name = $2, rollout_percent = $3 WHERE id = $1")
            .bind(row.id)
            .bind(&row.name)
            .bind(row.rollout_percent)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn delete(&mut self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM flag_variants WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl EntityRepository<FeatureSchedule> for PgGuardTx {
    async fn get(&mut self, id: Uuid) -> Result<Option<FeatureSchedule>> {
        let row = sqlx::query_as::<_, PgFeatureScheduleRow>(
            r#"
            SELECT id, feature_id, project_id, environment_id, name, enabled, value,
                   start_at, end_at, rollout_step_ms
            FROM feature_schedules
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(row.map(FeatureSchedule::from))
    }

    async fn insert(&mut self, row: &FeatureSchedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feature_schedules (id, feature_id, project_id, environment_id, name,
                                           enabled, value, start_at, end_at, rollout_step_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(row.id)
        .bind(row.feature_id)
        .bind(row.project_id)
        .bind(row.environment_id)
        .bind(&row.name)
        .bind(row.enabled)
        .bind(&row.value)
        .bind(row.start_at)
        .bind(row.end_at)
        .bind(duration_ms(row.rollout_step))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn update(&mut self, row: &FeatureSchedule) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE feature_schedules
            SET name = $2, enabled = $3, value = $4, start_at = $5, end_at = $6,
                rollout_step_ms = $7
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(row.enabled)
        .bind(&row.value)
        .bind(row.start_at)
        .bind(row.end_at)
        .bind(duration_ms(row.rollout_step))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn delete(&mut self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feature_schedules WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TagRelationRepository for PgGuardTx {
    async fn tag_exists(&mut self, tag_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM tags WHERE id = $1)")
            .bind(tag_id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(exists)
    }

    async fn attach_tag(&mut self, relation: &FeatureTagRelation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feature_tags (feature_id, tag_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(relation.feature_id)
        .bind(relation.tag_id)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn detach_tag(&mut self, relation: &FeatureTagRelation) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feature_tags WHERE feature_id = $1 AND tag_id = $2")
            .bind(relation.feature_id)
            .bind(relation.tag_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(result.rows_affected() > 0)
    }
}
