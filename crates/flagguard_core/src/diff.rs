//! Field-level change detection over the registry whitelists.
//!
//! Update emits only differing fields, insert emits every whitelisted field
//! plus the parent keys, and delete emits nothing except the relation pair a
//! tag detach needs. A feature update is split into a core `Feature` entry
//! and a `FeatureParams` entry.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::classify::classify;
use crate::entities::{Feature, FeatureParams, FeatureTagRelation, GuardEntity};
use crate::error::{GuardError, Result};
use crate::registry::{Editable, FieldSpec};
use crate::types::{ChangeValue, EntityAction, EntityChange, EntityKind};

fn ensure_representable<T: Editable>(spec: &FieldSpec<T>, new: &T) -> Result<()> {
    if (spec.representable)(new) {
        return Ok(());
    }
    Err(GuardError::InvalidInput(format!(
        "{}.{} = {} cannot be stored exactly",
        T::KIND,
        spec.name,
        (spec.get)(new)
    )))
}

/// Whitelisted fields whose stored values differ between `old` and `new`.
pub fn diff_update<T: Editable>(old: &T, new: &T) -> Result<BTreeMap<String, ChangeValue>> {
    let mut changes = BTreeMap::new();
    for spec in T::editable_fields().iter().filter(|f| !(f.eq)(old, new)) {
        ensure_representable(spec, new)?;
        changes.insert(
            spec.name.to_string(),
            ChangeValue::update((spec.get)(old), (spec.get)(new)),
        );
    }
    Ok(changes)
}

/// Every whitelisted and identity field of a row about to be created.
pub fn diff_insert<T: Editable>(new: &T) -> Result<BTreeMap<String, ChangeValue>> {
    let mut changes = BTreeMap::new();
    for spec in T::editable_fields().iter().chain(T::identity_fields()) {
        ensure_representable(spec, new)?;
        changes.insert(spec.name.to_string(), ChangeValue::insert((spec.get)(new)));
    }
    Ok(changes)
}

fn update_entry<T: Editable>(entity_id: Uuid, old: &T, new: &T) -> Result<Option<EntityChange>> {
    let changes = diff_update(old, new)?;
    Ok((!changes.is_empty()).then(|| EntityChange {
        kind: T::KIND,
        entity_id,
        action: EntityAction::Update,
        changes,
    }))
}

fn insert_entry<T: Editable>(new: &T) -> Result<EntityChange> {
    Ok(EntityChange {
        kind: T::KIND,
        entity_id: new.entity_id(),
        action: EntityAction::Insert,
        changes: diff_insert(new)?,
    })
}

fn feature_update(old: &Feature, new: &Feature) -> Result<Vec<EntityChange>> {
    let mut entries: Vec<EntityChange> = update_entry(old.id, old, new)?.into_iter().collect();
    // Params only take part when the caller submitted them.
    if let Some(new_params) = &new.params {
        let baseline;
        let old_params = match &old.params {
            Some(p) => p,
            None => {
                baseline = FeatureParams::baseline(old.id, new_params.environment_id);
                &baseline
            }
        };
        entries.extend(update_entry(old.id, old_params, new_params)?);
    }
    Ok(entries)
}

fn update_changes(old: &GuardEntity, new: &GuardEntity) -> Result<Vec<EntityChange>> {
    use GuardEntity as E;
    let entries = match (old, new) {
        (E::Feature(o), E::Feature(n)) => feature_update(o, n)?,
        (E::FeatureParams(o), E::FeatureParams(n)) => {
            update_entry(o.feature_id, o, n)?.into_iter().collect()
        }
        (E::Rule(o), E::Rule(n)) => update_entry(o.id, o, n)?.into_iter().collect(),
        (E::FlagVariant(o), E::FlagVariant(n)) => update_entry(o.id, o, n)?.into_iter().collect(),
        (E::FeatureSchedule(o), E::FeatureSchedule(n)) => {
            update_entry(o.id, o, n)?.into_iter().collect()
        }
        (E::FeatureTagRelation(o), E::FeatureTagRelation(n)) => {
            if o != n {
                return Err(GuardError::InvalidInput(
                    "a tag relation cannot be updated; detach and attach instead".into(),
                ));
            }
            Vec::new()
        }
        (o, n) => {
            return Err(GuardError::EntityKindUnknown(format!(
                "old value is {} but new value is {}",
                o.kind(),
                n.kind()
            )))
        }
    };
    Ok(entries)
}

fn insert_changes(new: &GuardEntity) -> Result<Vec<EntityChange>> {
    Ok(match new {
        GuardEntity::Feature(_) => {
            return Err(GuardError::InvalidInput(
                "feature creation is not a guarded operation".into(),
            ))
        }
        // A params row "insert" is a change against the implicit baseline.
        GuardEntity::FeatureParams(p) => {
            let baseline = FeatureParams::baseline(p.feature_id, p.environment_id);
            update_entry(p.feature_id, &baseline, p)?.into_iter().collect()
        }
        GuardEntity::Rule(r) => vec![insert_entry(r)?],
        GuardEntity::FlagVariant(v) => vec![insert_entry(v)?],
        GuardEntity::FeatureSchedule(s) => vec![insert_entry(s)?],
        GuardEntity::FeatureTagRelation(t) => vec![insert_entry(t)?],
    })
}

fn delete_changes(old: &GuardEntity) -> Result<Vec<EntityChange>> {
    let kind = old.kind();
    match old {
        GuardEntity::Feature(_) | GuardEntity::FeatureParams(_) => Err(GuardError::InvalidInput(
            format!("{kind} cannot be deleted through a guarded change"),
        )),
        GuardEntity::FeatureTagRelation(rel) => Ok(vec![relation_detach(rel)]),
        other => Ok(vec![EntityChange::new(
            kind,
            other.entity_id(),
            EntityAction::Delete,
        )]),
    }
}

fn relation_detach(rel: &FeatureTagRelation) -> EntityChange {
    let mut change = EntityChange::new(EntityKind::FeatureTagRelation, rel.tag_id, EntityAction::Delete);
    for field in FeatureTagRelation::editable_fields() {
        change
            .changes
            .insert(field.name.to_string(), ChangeValue::delete((field.get)(rel)));
    }
    change
}

/// Params carried by a write must belong to the environment the write was
/// made in; approval patches the params row of that environment.
pub fn ensure_environment(entity: &GuardEntity, environment_id: Uuid) -> Result<()> {
    let params = match entity {
        GuardEntity::Feature(f) => f.params.as_ref(),
        GuardEntity::FeatureParams(p) => Some(p),
        _ => None,
    };
    match params {
        Some(p) if p.environment_id != environment_id => Err(GuardError::InvalidInput(format!(
            "feature params of environment {} submitted for environment {environment_id}",
            p.environment_id
        ))),
        _ => Ok(()),
    }
}

/// Turn an intercepted write into the entity changes a pending change would
/// carry. An empty result means nothing whitelisted differs.
pub fn build_entity_changes(
    action: EntityAction,
    old: Option<&GuardEntity>,
    new: Option<&GuardEntity>,
) -> Result<Vec<EntityChange>> {
    let key = classify(old, new)?;
    match (action, old, new) {
        (EntityAction::Update, Some(old), Some(new)) => update_changes(old, new),
        (EntityAction::Insert, _, Some(new)) => insert_changes(new),
        (EntityAction::Delete, Some(old), _) => delete_changes(old),
        (action, ..) => Err(GuardError::InvalidInput(format!(
            "{action} of {key} is missing its {} value",
            if action == EntityAction::Insert { "new" } else { "old" }
        ))),
    }
}
