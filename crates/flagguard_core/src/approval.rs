//! Approval coordinator: resolves pending changes.
//!
//! | Operation              | Requires                          | Effect                       |
//! |------------------------|-----------------------------------|------------------------------|
//! | approve                | Pending, approver, credential     | apply all → Approved         |
//! | initiate_totp_approval | Pending, approver                 | TOTP challenge issued        |
//! | reject                 | Pending                           | → Rejected                   |
//! | cancel                 | Pending                           | → Cancelled                  |
//! | get_by_id / list       | n/a                               | read-only                    |
//!
//! Approve, reject and cancel each load the row for update, check it, do their
//! work and write the new status in a single transaction.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::apply::ChangeApplier;
use crate::config::GuardConfig;
use crate::error::{GuardError, Result};
use crate::lifecycle::StatusTransition;
use crate::observability::{GuardEvent, GuardObserver, TracingObserver};
use crate::ports::{
    ApproverDirectory, GuardStore, GuardTx, IdentityVerifier, PermissionsOracle, TotpChallenge,
};
use crate::types::{PendingChange, PendingChangePage, PendingChangeQuery};

/// Proof of identity presented with an approval.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalCredential {
    Password {
        password: String,
    },
    /// `session_id` comes from [`ApprovalCoordinator::initiate_totp_approval`].
    Totp {
        session_id: Option<String>,
        code: String,
    },
}

impl std::fmt::Debug for ApprovalCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password { .. } => f.debug_struct("Password").finish_non_exhaustive(),
            Self::Totp { session_id, .. } => f
                .debug_struct("Totp")
                .field("session_id", session_id)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveRequest {
    pub pending_change_id: Uuid,
    pub approver_user_id: Uuid,
    pub approver_name: String,
    pub credential: ApprovalCredential,
}

pub struct ApprovalCoordinator {
    store: Arc<dyn GuardStore>,
    identity: Arc<dyn IdentityVerifier>,
    permissions: Arc<dyn PermissionsOracle>,
    approvers: Arc<dyn ApproverDirectory>,
    applier: ChangeApplier,
    observer: Arc<dyn GuardObserver>,
    config: GuardConfig,
}

impl ApprovalCoordinator {
    pub fn new(
        store: Arc<dyn GuardStore>,
        identity: Arc<dyn IdentityVerifier>,
        permissions: Arc<dyn PermissionsOracle>,
        approvers: Arc<dyn ApproverDirectory>,
    ) -> Self {
        Self {
            store,
            identity,
            permissions,
            approvers,
            applier: ChangeApplier,
            observer: Arc::new(TracingObserver),
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

    // ── approve ───────────────────────────────────────────────

    /// Verify the approver, replay every entity, then mark Approved. Any
    /// failure leaves the change Pending and live configuration untouched.
    pub async fn approve(&self, request: ApproveRequest) -> Result<PendingChange> {
        let pending_change_id = request.pending_change_id;
        let approver_user_id = request.approver_user_id;
        match self.approve_in_tx(request).await {
            Ok(change) => {
                self.observer.record(&GuardEvent::Approved {
                    pending_change_id,
                    project_id: change.project_id,
                    approver_user_id,
                    entity_count: change.change.entities.len(),
                });
                Ok(change)
            }
            Err(e) => {
                self.observer.record(&GuardEvent::ApprovalFailed {
                    pending_change_id,
                    approver_user_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn approve_in_tx(&self, request: ApproveRequest) -> Result<PendingChange> {
        let mut tx = self.store.begin().await?;
        let mut change = load_pending(tx.as_mut(), request.pending_change_id).await?;
        change.ensure_pending()?;
        self.ensure_approver(&change, request.approver_user_id).await?;
        self.verify_credential(&change, request.approver_user_id, &request.credential)
            .await?;

        for entity in &change.change.entities {
            self.applier
                .apply(tx.as_mut(), change.environment_id, entity)
                .await?;
        }

        change.apply_transition(StatusTransition::Approve {
            by: request.approver_name,
            user_id: request.approver_user_id,
            at: Utc::now(),
        })?;
        tx.update_pending_status(&change).await?;
        tx.commit().await?;
        Ok(change)
    }

    /// Start a TOTP approval for an approver; the returned session id is
    /// presented back with the code in [`ApprovalCredential::Totp`].
    pub async fn initiate_totp_approval(
        &self,
        pending_change_id: Uuid,
        approver_user_id: Uuid,
    ) -> Result<TotpChallenge> {
        let change = self.get_by_id(pending_change_id).await?;
        change.ensure_pending()?;
        self.ensure_approver(&change, approver_user_id).await?;
        let challenge = self
            .identity
            .initiate_totp_approval(approver_user_id, pending_change_id)
            .await
            .context("initiating totp approval")?;
        self.observer.record(&GuardEvent::TotpInitiated {
            pending_change_id,
            approver_user_id,
        });
        Ok(challenge)
    }

    // ── reject / cancel ───────────────────────────────────────

    pub async fn reject(
        &self,
        pending_change_id: Uuid,
        user_id: Uuid,
        user_name: &str,
        reason: Option<String>,
    ) -> Result<PendingChange> {
        let change = self
            .transition(
                pending_change_id,
                StatusTransition::Reject {
                    by: user_name.to_string(),
                    user_id,
                    reason,
                    at: Utc::now(),
                },
            )
            .await?;
        self.observer.record(&GuardEvent::Rejected {
            pending_change_id,
            project_id: change.project_id,
            user_id,
        });
        Ok(change)
    }

    pub async fn cancel(
        &self,
        pending_change_id: Uuid,
        user_id: Uuid,
        user_name: &str,
    ) -> Result<PendingChange> {
        let change = self
            .transition(
                pending_change_id,
                StatusTransition::Cancel {
                    by: user_name.to_string(),
                    user_id,
                    at: Utc::now(),
                },
            )
            .await?;
        self.observer.record(&GuardEvent::Cancelled {
            pending_change_id,
            project_id: change.project_id,
            user_id,
        });
        Ok(change)
    }

    async fn transition(
        &self,
        pending_change_id: Uuid,
        transition: StatusTransition,
    ) -> Result<PendingChange> {
        let mut tx = self.store.begin().await?;
        let mut change = load_pending(tx.as_mut(), pending_change_id).await?;
        change.apply_transition(transition)?;
        tx.update_pending_status(&change).await?;
        tx.commit().await?;
        Ok(change)
    }

    // ── reads ─────────────────────────────────────────────────

    pub async fn get_by_id(&self, pending_change_id: Uuid) -> Result<PendingChange> {
        self.store
            .get_pending_change(pending_change_id)
            .await?
            .ok_or_else(|| GuardError::NotFound(format!("pending change {pending_change_id}")))
    }

    /// List with the page size clamped to the configured bounds.
    pub async fn list(&self, query: &PendingChangeQuery) -> Result<PendingChangePage> {
        let query = PendingChangeQuery {
            limit: Some(self.config.page_size(query.limit)),
            offset: query.offset.max(0),
            ..query.clone()
        };
        self.store.list_pending_changes(&query).await
    }

    // ── helpers ───────────────────────────────────────────────

    /// Explicit grant, then superuser, then manage permission.
    async fn ensure_approver(&self, change: &PendingChange, user_id: Uuid) -> Result<()> {
        let project_id = change.project_id;
        if self
            .approvers
            .is_project_approver(project_id, user_id)
            .await
            .context("checking project approver grant")?
        {
            return Ok(());
        }
        if self
            .approvers
            .is_superuser(user_id)
            .await
            .context("checking superuser flag")?
        {
            return Ok(());
        }
        if self
            .permissions
            .can_manage_project(user_id, project_id)
            .await
            .context("checking manage permission")?
        {
            return Ok(());
        }
        Err(GuardError::NotAnApprover {
            user_id,
            project_id,
        })
    }

    async fn verify_credential(
        &self,
        change: &PendingChange,
        user_id: Uuid,
        credential: &ApprovalCredential,
    ) -> Result<()> {
        let verdict = match credential {
            ApprovalCredential::Password { password } => {
                self.identity.verify_password(user_id, password).await
            }
            ApprovalCredential::Totp {
                session_id: Some(session_id),
                code,
            } => {
                self.identity
                    .verify_2fa(user_id, change.id, session_id, code)
                    .await
            }
            ApprovalCredential::Totp {
                session_id: None, ..
            } => {
                return Err(GuardError::CredentialVerificationFailed(
                    "totp approval requires a session id; initiate it first".into(),
                ))
            }
        };
        match verdict {
            Ok(true) => Ok(()),
            Ok(false) => Err(GuardError::CredentialVerificationFailed(
                match credential {
                    ApprovalCredential::Password { .. } => "invalid password",
                    ApprovalCredential::Totp { .. } => "invalid verification code",
                }
                .into(),
            )),
            Err(e) => Err(GuardError::CredentialVerificationFailed(format!("{e:#}"))),
        }
    }
}

async fn load_pending(tx: &mut dyn GuardTx, id: Uuid) -> Result<PendingChange> {
    tx.load_pending_change_for_update(id)
        .await?
        .ok_or_else(|| GuardError::NotFound(format!("pending change {id}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_debug_hides_secrets() {
        let password = ApprovalCredential::Password {
            password: "hunter2".into(),
        };
        let totp = ApprovalCredential::Totp {
            session_id: Some("sess-1".into()),
            code: "123456".into(),
        };
        assert!(!format!("{password:?}").contains("hunter2"));
        let shown = format!("{totp:?}");
        assert!(shown.contains("sess-1"));
        assert!(!shown.contains("123456"));
    }

    #[test]
    fn credential_serde_is_tagged() {
        let credential: ApprovalCredential = serde_json::from_value(serde_json::json!({
            "type": "totp",
            "session_id": null,
            "code": "000000"
        }))
        .unwrap();
        assert_eq!(
            credential,
            ApprovalCredential::Totp {
                session_id: None,
                code: "000000".into()
            }
        );
    }
}
