use thiserror::Error;
use uuid::Uuid;

use crate::types::{EntityAction, EntityKind, PendingChangeStatus};

pub type Result<T> = std::result::Result<T, GuardError>;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("unknown entity kind: {0}")]
    EntityKindUnknown(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("guard policy lookup failed: {0:#}")]
    GuardPolicyLookupFailed(#[source] anyhow::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("pending change {id} is {status}, not pending")]
    PendingChangeNotPending {
        id: Uuid,
        status: PendingChangeStatus,
    },

    #[error("user {user_id} is not an approver for project {project_id}")]
    NotAnApprover { user_id: Uuid, project_id: Uuid },

    #[error("credential verification failed: {0}")]
    CredentialVerificationFailed(String),

    #[error("apply failed for {kind} {entity_id}: {source}")]
    ApplyFailed {
        kind: EntityKind,
        entity_id: Uuid,
        #[source]
        source: ApplyError,
    },

    #[error("internal: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl GuardError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::EntityKindUnknown(_) | Self::InvalidInput(_) => 400,
            Self::CredentialVerificationFailed(_) => 401,
            Self::NotAnApprover { .. } => 403,
            Self::NotFound(_) => 404,
            Self::PendingChangeNotPending { .. } => 409,
            Self::ApplyFailed { .. } => 422,
            Self::GuardPolicyLookupFailed(_) => 502,
            Self::Internal(_) => 500,
        }
    }
}

/// Failure while replaying one entity change onto live configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApplyError {
    #[error("field '{field}' expects {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: String,
    },

    #[error("{kind} {id} does not exist")]
    ForeignEntityMissing { kind: EntityKind, id: Uuid },

    #[error("insert is missing field '{field}'")]
    MissingField { field: String },

    #[error("{action} is not supported for {kind}")]
    UnsupportedAction {
        kind: EntityKind,
        action: EntityAction,
    },

    #[error("{kind} has no editable field '{field}'")]
    UnknownField { kind: EntityKind, field: String },
}

impl ApplyError {
    pub fn type_mismatch(
        field: impl Into<String>,
        expected: &'static str,
        found: &serde_json::Value,
    ) -> Self {
        let mut found = found.to_string();
        if found.len() > 64 {
            let cut = (0..=64).rev().find(|i| found.is_char_boundary(*i)).unwrap_or(0);
            found.truncate(cut);
            found.push('…');
        }
        Self::TypeMismatch {
            field: field.into(),
            expected,
            found,
        }
    }
}
