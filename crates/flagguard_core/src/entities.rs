//! Live configuration entities that a guarded write can touch, and the
//! [`GuardEntity`] union callers build from the old/new sides of a write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rollout::RolloutExpression;
use crate::types::EntityKind;

/// Core feature descriptor, optionally carrying the environment-scoped
/// parameters the caller edited alongside it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: Uuid,
    pub project_id: Uuid,
    pub key: String,
    pub name: String,
    pub description: String,
    pub rollout_key: String,
    pub value_type: String,
    pub permanent: bool,
    /// Stored separately as a `FeatureParams` row; repositories return `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<FeatureParams>,
}

/// Environment-scoped feature parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureParams {
    pub feature_id: Uuid,
    pub environment_id: Uuid,
    pub enabled: bool,
    pub default_value: String,
}

impl FeatureParams {
    /// The implicit row of a feature that predates any params for `environment_id`.
    pub fn baseline(feature_id: Uuid, environment_id: Uuid) -> Self {
        Self {
            feature_id,
            environment_id,
            enabled: false,
            default_value: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub project_id: Uuid,
    pub environment_id: Uuid,
    pub name: String,
    pub priority: i32,
    pub value: String,
    pub rollout_percent: f64,
    pub condition: Option<RolloutExpression>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagVariant {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub rollout_percent: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchedule {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub project_id: Uuid,
    pub environment_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub value: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub rollout_step: Duration,
}

/// Feature ↔ tag association. Has no canonical row of its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureTagRelation {
    pub feature_id: Uuid,
    pub tag_id: Uuid,
}

/// One side of an intercepted write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardEntity {
    Feature(Feature),
    FeatureParams(FeatureParams),
    Rule(Rule),
    FlagVariant(FlagVariant),
    FeatureSchedule(FeatureSchedule),
    FeatureTagRelation(FeatureTagRelation),
}

impl GuardEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Feature(_) => EntityKind::Feature,
            Self::FeatureParams(_) => EntityKind::FeatureParams,
            Self::Rule(_) => EntityKind::Rule,
            Self::FlagVariant(_) => EntityKind::FlagVariant,
            Self::FeatureSchedule(_) => EntityKind::FeatureSchedule,
            Self::FeatureTagRelation(_) => EntityKind::FeatureTagRelation,
        }
    }

    /// Row identity. Params are keyed by their feature; tag relations by the tag.
    pub fn entity_id(&self) -> Uuid {
        match self {
            Self::Feature(f) => f.id,
            Self::FeatureParams(p) => p.feature_id,
            Self::Rule(r) => r.id,
            Self::FlagVariant(v) => v.id,
            Self::FeatureSchedule(s) => s.id,
            Self::FeatureTagRelation(t) => t.tag_id,
        }
    }
}

// Value, reference, Box and Arc forms all convert the same way.
macro_rules! guard_entity_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for GuardEntity {
                fn from(entity: $variant) -> Self {
                    Self::$variant(entity)
                }
            }

            impl From<&$variant> for GuardEntity {
                fn from(entity: &$variant) -> Self {
                    Self::$variant(entity.clone())
                }
            }

            impl From<Box<$variant>> for GuardEntity {
                fn from(entity: Box<$variant>) -> Self {
                    Self::$variant(*entity)
                }
            }

            impl From<Arc<$variant>> for GuardEntity {
                fn from(entity: Arc<$variant>) -> Self {
                    Self::$variant(Arc::unwrap_or_clone(entity))
                }
            }
        )*
    };
}

guard_entity_from!(
    Feature,
    FeatureParams,
    Rule,
    FlagVariant,
    FeatureSchedule,
    FeatureTagRelation,
);
