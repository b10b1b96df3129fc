//! Pending change state machine.
//!
//! ```text
//!            approve            reject             cancel
//! Pending ──────────► Approved  Pending ──► Rejected  Pending ──► Cancelled
//! ```
//!
//! Terminal rows never change again.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{GuardError, Result};
use crate::types::{PendingChange, PendingChangeStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum StatusTransition {
    Approve {
        by: String,
        user_id: Uuid,
        at: DateTime<Utc>,
    },
    Reject {
        by: String,
        user_id: Uuid,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    Cancel {
        by: String,
        user_id: Uuid,
        at: DateTime<Utc>,
    },
}

impl StatusTransition {
    pub fn target(&self) -> PendingChangeStatus {
        match self {
            Self::Approve { .. } => PendingChangeStatus::Approved,
            Self::Reject { .. } => PendingChangeStatus::Rejected,
            Self::Cancel { .. } => PendingChangeStatus::Cancelled,
        }
    }
}

impl PendingChange {
    pub fn ensure_pending(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(GuardError::PendingChangeNotPending {
                id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Move out of Pending, recording who resolved the change and when.
    pub fn apply_transition(&mut self, transition: StatusTransition) -> Result<()> {
        self.ensure_pending()?;
        self.status = transition.target();
        match transition {
            StatusTransition::Approve { by, user_id, at } => {
                self.approved_by = Some(by);
                self.approved_user_id = Some(user_id);
                self.approved_at = Some(at);
            }
            StatusTransition::Reject {
                by,
                user_id,
                reason,
                at,
            } => {
                self.rejected_by = Some(by);
                self.rejected_user_id = Some(user_id);
                self.rejection_reason = reason;
                self.rejected_at = Some(at);
            }
            StatusTransition::Cancel { by, user_id, at } => {
                self.cancelled_by = Some(by);
                self.cancelled_user_id = Some(user_id);
                self.cancelled_at = Some(at);
            }
        }
        Ok(())
    }
}
