//! Guard policy and approver facts read from the project tables.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use flagguard_core::ports::{ApproverDirectory, GuardPolicy};
use flagguard_core::types::EntityKind;

pub struct PgGuardPolicy {
    pool: PgPool,
}

impl PgGuardPolicy {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GuardPolicy for PgGuardPolicy {
    async fn is_feature_guarded(&self, project_id: Uuid, feature_id: Uuid) -> anyhow::Result<bool> {
        let guarded: Option<bool> =
            sqlx::query_scalar("SELECT guarded FROM features WHERE id = $1 AND project_id = $2")
                .bind(feature_id)
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;
        guarded.with_context(|| format!("feature {feature_id} not found in project {project_id}"))
    }

    async fn is_entity_guarded(&self, kind: EntityKind, entity_id: Uuid) -> anyhow::Result<bool> {
        // Every kind resolves to its owning feature.
        let sql = match kind {
            EntityKind::Feature | EntityKind::FeatureParams => {
                "SELECT guarded FROM features WHERE id = $1"
            }
            EntityKind::Rule => {
                "SELECT f.guarded FROM rules r JOIN features f ON f.id = r.feature_id WHERE r.id = $1"
            }
            EntityKind::FlagVariant => {
                "SELECT f.guarded FROM flag_variants v JOIN features f ON f.id = v.feature_id \
                 WHERE v.id = $1"
            }
            EntityKind::FeatureSchedule => {
                "SELECT f.guarded FROM feature_schedules s JOIN features f ON f.id = s.feature_id \
                 WHERE s.id = $1"
            }
            EntityKind::FeatureTagRelation => {
                "SELECT COALESCE(bool_or(f.guarded), false) FROM feature_tags t \
                 JOIN features f ON f.id = t.feature_id WHERE t.tag_id = $1"
            }
        };
        let guarded: Option<bool> = sqlx::query_scalar(sql)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        guarded.ok_or_else(|| anyhow!("{kind} {entity_id} not found"))
    }

    async fn get_project_active_user_count(&self, project_id: Uuid) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM project_members WHERE project_id = $1 AND active",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

pub struct PgApproverDirectory {
    pool: PgPool,
}

impl PgApproverDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApproverDirectory for PgApproverDirectory {
    async fn is_project_approver(&self, project_id: Uuid, user_id: Uuid) -> anyhow::Result<bool> {
        let granted: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM project_approvers WHERE project_id = $1 AND user_id = $2
            )
            "#,
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(granted)
    }

    async fn is_superuser(&self, user_id: Uuid) -> anyhow::Result<bool> {
        let superuser: Option<bool> =
            sqlx::query_scalar("SELECT is_superuser FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(superuser.unwrap_or(false))
    }
}
