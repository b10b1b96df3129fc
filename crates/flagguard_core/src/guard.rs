//! Guard decision service: decides whether an intercepted write proceeds,
//! conflicts with an outstanding proposal, or becomes a new pending change.
//!
//! | Step | Outcome on exit                                   |
//! |------|---------------------------------------------------|
//! | 1    | empty diff → `Proceed`                            |
//! | 2    | feature not guarded → `Proceed`                   |
//! | 3    | scope overlaps a Pending change → `Conflict`      |
//! | 4    | insert + commit → `Pending`                       |

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::GuardConfig;
use crate::conflict::{conflict_scope, ConflictDetector, PendingConflict};
use crate::diff::{build_entity_changes, ensure_environment};
use crate::error::{GuardError, Result};
use crate::observability::{GuardEvent, GuardObserver, ProceedReason, TracingObserver};
use crate::ports::{GuardPolicy, GuardStore};
use crate::types::{
    GuardRequest, PendingChange, PendingChangeMeta, PendingChangePayload, PendingChangeStatus,
};

/// Outcome of a guard check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GuardDecision {
    /// Write directly; nothing was stored.
    Proceed,
    /// Another Pending change already holds part of the scope.
    Conflict { conflicting: Vec<PendingConflict> },
    /// The write was captured for approval.
    Pending(PendingChange),
}

impl GuardDecision {
    pub fn proceed(&self) -> bool {
        matches!(self, Self::Proceed)
    }

    pub fn conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn pending_change(&self) -> Option<&PendingChange> {
        match self {
            Self::Pending(change) => Some(change),
            _ => None,
        }
    }
}

pub struct GuardDecisionService {
    store: Arc<dyn GuardStore>,
    policy: Arc<dyn GuardPolicy>,
    observer: Arc<dyn GuardObserver>,
    conflicts: ConflictDetector,
    config: GuardConfig,
}

impl GuardDecisionService {
    pub fn new(store: Arc<dyn GuardStore>, policy: Arc<dyn GuardPolicy>) -> Self {
        Self {
            store,
            policy,
            observer: Arc::new(TracingObserver),
            conflicts: ConflictDetector,
            config: GuardConfig::default(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn GuardObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn check_guarded_operation(&self, request: GuardRequest) -> Result<GuardDecision> {
        for entity in request.old_entity.iter().chain(request.new_entity.iter()) {
            ensure_environment(entity, request.environment_id)?;
        }
        let entities = build_entity_changes(
            request.action,
            request.old_entity.as_ref(),
            request.new_entity.as_ref(),
        )?;
        if entities.is_empty() {
            return Ok(self.proceed(&request, ProceedReason::NoChanges));
        }

        let guarded = self
            .policy
            .is_feature_guarded(request.project_id, request.feature_id)
            .await
            .map_err(GuardError::GuardPolicyLookupFailed)?;
        if !guarded {
            return Ok(self.proceed(&request, ProceedReason::NotGuarded));
        }

        let scope = conflict_scope(request.feature_id, &entities);
        let active_users = self
            .policy
            .get_project_active_user_count(request.project_id)
            .await
            .map_err(GuardError::GuardPolicyLookupFailed)?;

        let mut tx = self.store.begin().await?;
        let conflicting = self
            .conflicts
            .check(tx.as_mut(), request.project_id, &scope)
            .await?;
        if !conflicting.is_empty() {
            tx.rollback().await?;
            self.observer.record(&GuardEvent::ConflictDetected {
                project_id: request.project_id,
                feature_id: request.feature_id,
                conflicting: conflicting.iter().map(|c| c.pending_change_id).collect(),
            });
            return Ok(GuardDecision::Conflict { conflicting });
        }

        let change = PendingChange {
            id: Uuid::new_v4(),
            project_id: request.project_id,
            environment_id: request.environment_id,
            feature_id: request.feature_id,
            status: PendingChangeStatus::Pending,
            requested_by: request.requested_by,
            requested_user_id: request.requested_user_id,
            change: PendingChangePayload {
                entities,
                meta: PendingChangeMeta {
                    reason: request.reason,
                    client: self.config.client.clone(),
                    origin: request.origin,
                    single_user_project: active_users == 1,
                },
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
        };
        tx.insert_pending_change(&change).await?;
        tx.commit().await?;

        self.observer.record(&GuardEvent::PendingCreated {
            pending_change_id: change.id,
            project_id: change.project_id,
            feature_id: change.feature_id,
            entity_count: change.change.entities.len(),
            single_user_project: change.change.meta.single_user_project,
        });
        Ok(GuardDecision::Pending(change))
    }

    fn proceed(&self, request: &GuardRequest, reason: ProceedReason) -> GuardDecision {
        self.observer.record(&GuardEvent::Proceeded {
            project_id: request.project_id,
            feature_id: request.feature_id,
            reason,
        });
        GuardDecision::Proceed
    }
}
