//! Structured guard events and the observer port that receives them.

use std::sync::Mutex;

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProceedReason {
    NoChanges,
    NotGuarded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GuardEvent {
    Proceeded {
        project_id: Uuid,
        feature_id: Uuid,
        reason: ProceedReason,
    },
    ConflictDetected {
        project_id: Uuid,
        feature_id: Uuid,
        conflicting: Vec<Uuid>,
    },
    PendingCreated {
        pending_change_id: Uuid,
        project_id: Uuid,
        feature_id: Uuid,
        entity_count: usize,
        single_user_project: bool,
    },
    TotpInitiated {
        pending_change_id: Uuid,
        approver_user_id: Uuid,
    },
    Approved {
        pending_change_id: Uuid,
        project_id: Uuid,
        approver_user_id: Uuid,
        entity_count: usize,
    },
    ApprovalFailed {
        pending_change_id: Uuid,
        approver_user_id: Uuid,
        error: String,
    },
    Rejected {
        pending_change_id: Uuid,
        project_id: Uuid,
        user_id: Uuid,
    },
    Cancelled {
        pending_change_id: Uuid,
        project_id: Uuid,
        user_id: Uuid,
    },
}

/// Receives every guard outcome. Implementations must not block.
pub trait GuardObserver: Send + Sync {
    fn record(&self, event: &GuardEvent);
}

/// Default observer: one `tracing` event per outcome under `flagguard::events`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl GuardObserver for TracingObserver {
    fn record(&self, event: &GuardEvent) {
        match event {
            GuardEvent::Proceeded {
                project_id,
                feature_id,
                reason,
            } => tracing::debug!(
                target: "flagguard::events",
                %project_id,
                %feature_id,
                ?reason,
                "guard check proceeded"
            ),
            GuardEvent::ConflictDetected {
                project_id,
                feature_id,
                conflicting,
            } => tracing::info!(
                target: "flagguard::events",
                %project_id,
                %feature_id,
                ?conflicting,
                "guarded change conflicts with pending change"
            ),
            GuardEvent::PendingCreated {
                pending_change_id,
                project_id,
                feature_id,
                entity_count,
                single_user_project,
            } => tracing::info!(
                target: "flagguard::events",
                %pending_change_id,
                %project_id,
                %feature_id,
                entity_count,
                single_user_project,
                "pending change created"
            ),
            GuardEvent::TotpInitiated {
                pending_change_id,
                approver_user_id,
            } => tracing::info!(
                target: "flagguard::events",
                %pending_change_id,
                %approver_user_id,
                "totp approval initiated"
            ),
            GuardEvent::Approved {
                pending_change_id,
                project_id,
                approver_user_id,
                entity_count,
            } => tracing::info!(
                target: "flagguard::events",
                %pending_change_id,
                %project_id,
                %approver_user_id,
                entity_count,
                "pending change approved"
            ),
            GuardEvent::ApprovalFailed {
                pending_change_id,
                approver_user_id,
                error,
            } => tracing::warn!(
                target: "flagguard::events",
                %pending_change_id,
                %approver_user_id,
                error = %error,
                "approval failed"
            ),
            GuardEvent::Rejected {
                pending_change_id,
                project_id,
                user_id,
            } => tracing::info!(
                target: "flagguard::events",
                %pending_change_id,
                %project_id,
                %user_id,
                "pending change rejected"
            ),
            GuardEvent::Cancelled {
                pending_change_id,
                project_id,
                user_id,
            } => tracing::info!(
                target: "flagguard::events",
                %pending_change_id,
                %project_id,
                %user_id,
                "pending change cancelled"
            ),
        }
    }
}

/// Keeps every event in memory. Used by tests and by embedders that forward
/// events in batches.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<GuardEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GuardEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn take(&self) -> Vec<GuardEvent> {
        std::mem::take(
            &mut *self
                .events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

impl GuardObserver for RecordingObserver {
    fn record(&self, event: &GuardEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}
