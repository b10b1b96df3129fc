//! Conflict detection between a proposed edit and unresolved pending changes.
//!
//! A pending change "holds" every key in its scope: the synthetic touch key
//! of its feature, then each entity in its payload. Two proposals conflict
//! when their scopes share a key within one project.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::Result;
use crate::ports::GuardTx;
use crate::types::{EntityChange, EntityKey, EntityKind};

/// An existing Pending change and the keys it shares with the proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub pending_change_id: Uuid,
    pub keys: Vec<EntityKey>,
}

/// Feature touch key first, then payload keys in order, without repeats.
pub fn conflict_scope(feature_id: Uuid, entities: &[EntityChange]) -> Vec<EntityKey> {
    let mut scope = vec![EntityKey::new(EntityKind::Feature, feature_id)];
    for entity in entities {
        let key = entity.key();
        if !scope.contains(&key) {
            scope.push(key);
        }
    }
    scope
}

/// Keys of `proposed` that also appear in `existing`, in `proposed` order.
pub fn overlapping_keys(proposed: &[EntityKey], existing: &[EntityKey]) -> Vec<EntityKey> {
    proposed
        .iter()
        .filter(|k| existing.contains(k))
        .copied()
        .collect()
}

/// Transaction-scoped advisory lock id for one entity key: the first eight
/// bytes of SHA-256 over `kind:entity_id`, big-endian.
pub fn advisory_lock_id(key: &EntityKey) -> i64 {
    let digest = Sha256::digest(key.to_string().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Runs the lock-then-check sequence inside an open transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictDetector;

impl ConflictDetector {
    /// Lock every key of `scope` (sorted, so concurrent callers lock in the
    /// same order) and return the Pending changes already holding any of them.
    pub async fn check(
        &self,
        tx: &mut dyn GuardTx,
        project_id: Uuid,
        scope: &[EntityKey],
    ) -> Result<Vec<PendingConflict>> {
        let mut keys = scope.to_vec();
        keys.sort();
        keys.dedup();
        tx.lock_entity_keys(&keys).await?;
        tx.find_pending_touching(project_id, &keys).await
    }
}
