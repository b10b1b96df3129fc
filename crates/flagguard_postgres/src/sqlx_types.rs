//! Row shapes read with `sqlx::query_as`, converted into core types.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use flagguard_core::entities::{Feature, FeatureParams, FeatureSchedule, FlagVariant, Rule};
use flagguard_core::rollout::RolloutExpression;
use flagguard_core::types::{PendingChange, PendingChangePayload, PendingChangeStatus};

pub const PENDING_CHANGE_COLUMNS: &str = "id, project_id, environment_id, feature_id, status, \
     requested_by, requested_user_id, change, approved_by, approved_user_id, approved_at, \
     rejected_by, rejected_user_id, rejected_at, rejection_reason, cancelled_by, \
     cancelled_user_id, cancelled_at, created_at";

#[derive(Debug, sqlx::FromRow)]
pub struct PgPendingChangeRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub environment_id: Uuid,
    pub feature_id: Uuid,
    pub status: String,
    pub requested_by: String,
    pub requested_user_id: Option<Uuid>,
    pub change: String,
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

impl TryFrom<PgPendingChangeRow> for PendingChange {
    type Error = String;

    fn try_from(row: PgPendingChangeRow) -> Result<Self, Self::Error> {
        let status = PendingChangeStatus::from_str(&row.status)
            .map_err(|_| format!("pending change {}: unknown status '{}'", row.id, row.status))?;
        let change = PendingChangePayload::from_json(&row.change)
            .map_err(|e| format!("pending change {}: {e}", row.id))?;
        Ok(PendingChange {
            id: row.id,
            project_id: row.project_id,
            environment_id: row.environment_id,
            feature_id: row.feature_id,
            status,
            requested_by: row.requested_by,
            requested_user_id: row.requested_user_id,
            change,
            approved_by: row.approved_by,
            approved_user_id: row.approved_user_id,
            approved_at: row.approved_at,
            rejected_by: row.rejected_by,
            rejected_user_id: row.rejected_user_id,
            rejected_at: row.rejected_at,
            rejection_reason: row.rejection_reason,
            cancelled_by: row.cancelled_by,
            cancelled_user_id: row.cancelled_user_id,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct PgFeatureRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub key: String,
    pub name: String,
    pub description: String,
    pub rollout_key: String,
    pub value_type: String,
    pub permanent: bool,
}

impl From<PgFeatureRow> for Feature {
    fn from(row: PgFeatureRow) -> Self {
        Feature {
            id: row.id,
            project_id: row.project_id,
            key: row.key,
            name: row.name,
            description: row.description,
            rollout_key: row.rollout_key,
            value_type: row.value_type,
            permanent: row.permanent,
            params: None,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct PgFeatureParamsRow {
    pub feature_id: Uuid,
    pub environment_id: Uuid,
    pub enabled: bool,
    pub default_value: String,
}

impl From<PgFeatureParamsRow> for FeatureParams {
    fn from(row: PgFeatureParamsRow) -> Self {
        FeatureParams {
            feature_id: row.feature_id,
            environment_id: row.environment_id,
            enabled: row.enabled,
            default_value: row.default_value,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct PgRuleRow {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub project_id: Uuid,
    pub environment_id: Uuid,
    pub name: String,
    pub priority: i32,
    pub value: String,
    pub rollout_percent: f64,
    pub condition: Option<Json<RolloutExpression>>,
}

impl From<PgRuleRow> for Rule {
    fn from(row: PgRuleRow) -> Self {
        Rule {
            id: row.id,
            feature_id: row.feature_id,
            project_id: row.project_id,
            environment_id: row.environment_id,
            name: row.name,
            priority: row.priority,
            value: row.value,
            rollout_percent: row.rollout_percent,
            condition: row.condition.map(|Json(expr)| expr),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct PgFlagVariantRow {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub rollout_percent: i32,
}

impl From<PgFlagVariantRow> for FlagVariant {
    fn from(row: PgFlagVariantRow) -> Self {
        FlagVariant {
            id: row.id,
            feature_id: row.feature_id,
            project_id: row.project_id,
            name: row.name,
            rollout_percent: row.rollout_percent,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct PgFeatureScheduleRow {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub project_id: Uuid,
    pub environment_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub value: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub rollout_step_ms: i64,
}

impl From<PgFeatureScheduleRow> for FeatureSchedule {
    fn from(row: PgFeatureScheduleRow) -> Self {
        FeatureSchedule {
            id: row.id,
            feature_id: row.feature_id,
            project_id: row.project_id,
            environment_id: row.environment_id,
            name: row.name,
            enabled: row.enabled,
            value: row.value,
            start_at: row.start_at,
            end_at: row.end_at,
            rollout_step: Duration::from_millis(u64::try_from(row.rollout_step_ms).unwrap_or(0)),
        }
    }
}

/// Milliseconds for the `rollout_step_ms` column.
pub fn duration_ms(step: Duration) -> i64 {
    i64::try_from(step.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str, change: &str) -> PgPendingChangeRow {
        PgPendingChangeRow {
            id: Uuid::nil(),
            project_id: Uuid::nil(),
            environment_id: Uuid::nil(),
            feature_id: Uuid::nil(),
            status: status.into(),
            requested_by: "alice".into(),
            requested_user_id: None,
            change: change.into(),
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

    const EMPTY_PAYLOAD: &str =
        r#"{"entities":[],"meta":{"reason":"","client":"ui","origin":"","single_user_project":false}}"#;

    #[test]
    fn pending_row_converts() {
        let change = PendingChange::try_from(row("approved", EMPTY_PAYLOAD)).unwrap();
        assert_eq!(change.status, PendingChangeStatus::Approved);
        assert_eq!(change.change.to_json().unwrap(), EMPTY_PAYLOAD);
    }

    #[test]
    fn bad_status_or_payload_is_reported() {
        assert!(PendingChange::try_from(row("stale", EMPTY_PAYLOAD))
            .unwrap_err()
            .contains("unknown status"));
        assert!(PendingChange::try_from(row("pending", "{")).is_err());
    }

    #[test]
    fn negative_step_clamps_to_zero() {
        let schedule = FeatureSchedule::from(PgFeatureScheduleRow {
            id: Uuid::nil(),
            feature_id: Uuid::nil(),
            project_id: Uuid::nil(),
            environment_id: Uuid::nil(),
            name: "ramp".into(),
            enabled: true,
            value: "on".into(),
            start_at: Utc::now(),
            end_at: None,
            rollout_step_ms: -5,
        });
        assert_eq!(schedule.rollout_step, Duration::ZERO);
        assert_eq!(duration_ms(Duration::from_secs(90)), 90_000);
    }
}
