//! Entity classification: which `(kind, id)` a guarded write is about.

use serde_json::Value;

use crate::entities::{FeatureTagRelation, GuardEntity};
use crate::error::{GuardError, Result};
use crate::types::EntityKey;

/// Identify the entity behind an old/new pair. The old side wins when both
/// are given, since it names the row that exists today.
pub fn classify(old: Option<&GuardEntity>, new: Option<&GuardEntity>) -> Result<EntityKey> {
    match (old, new) {
        (None, None) => Err(GuardError::EntityKindUnknown(
            "neither an old nor a new value was supplied".into(),
        )),
        (Some(old), Some(new)) if old.kind() != new.kind() => {
            Err(GuardError::EntityKindUnknown(format!(
                "old value is {} but new value is {}",
                old.kind(),
                new.kind()
            )))
        }
        (Some(entity), _) | (None, Some(entity)) => {
            Ok(EntityKey::new(entity.kind(), entity.entity_id()))
        }
    }
}

/// Untyped write paths hand over raw JSON. Accepts a `kind`-tagged entity or
/// the bare two-key `{feature_id, tag_id}` relation record.
impl TryFrom<Value> for GuardEntity {
    type Error = GuardError;

    fn try_from(value: Value) -> Result<Self> {
        let Value::Object(map) = &value else {
            return Err(GuardError::EntityKindUnknown(format!(
                "expected an object, found {}",
                json_type(&value)
            )));
        };

        if map.contains_key("kind") {
            return serde_json::from_value(value)
                .map_err(|e| GuardError::EntityKindUnknown(e.to_string()));
        }

        if map.len() == 2 && map.contains_key("feature_id") && map.contains_key("tag_id") {
            return serde_json::from_value::<FeatureTagRelation>(value)
                .map(GuardEntity::FeatureTagRelation)
                .map_err(|e| GuardError::EntityKindUnknown(e.to_string()));
        }

        let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
        keys.sort_unstable();
        Err(GuardError::EntityKindUnknown(format!(
            "unrecognized object with keys [{}]",
            keys.join(", ")
        )))
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
