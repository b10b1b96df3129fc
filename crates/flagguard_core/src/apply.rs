//! Replays approved entity changes onto live configuration.
//!
//! Runs inside the approval transaction; the first failure aborts the whole
//! approval and nothing applied so far survives.

use uuid::Uuid;

use crate::entities::{
    Feature, FeatureParams, FeatureSchedule, FeatureTagRelation, FlagVariant, Rule,
};
use crate::error::{ApplyError, GuardError, Result};
use crate::ports::{EntityRepository, GuardTx};
use crate::registry::{build_from_insert, patch, Editable};
use crate::types::{EntityAction, EntityChange, EntityKind};

/// Either a replay problem with the change itself or a storage failure.
enum Failure {
    Apply(ApplyError),
    Store(GuardError),
}

impl From<ApplyError> for Failure {
    fn from(e: ApplyError) -> Self {
        Self::Apply(e)
    }
}

impl From<GuardError> for Failure {
    fn from(e: GuardError) -> Self {
        Self::Store(e)
    }
}

type Step = std::result::Result<(), Failure>;

/// Row kinds with their own primary key and a parent feature.
trait RowEntity: Editable {
    fn repository(tx: &mut dyn GuardTx) -> &mut dyn EntityRepository<Self>;

    fn feature_id(&self) -> Uuid;
}

impl RowEntity for Rule {
    fn repository(tx: &mut dyn GuardTx) -> &mut dyn EntityRepository<Self> {
        tx.rules()
    }

    fn feature_id(&self) -> Uuid {
        self.feature_id
    }
}

impl RowEntity for FlagVariant {
    fn repository(tx: &mut dyn GuardTx) -> &mut dyn EntityRepository<Self> {
        tx.variants()
    }

    fn feature_id(&self) -> Uuid {
        self.feature_id
    }
}

impl RowEntity for FeatureSchedule {
    fn repository(tx: &mut dyn GuardTx) -> &mut dyn EntityRepository<Self> {
        tx.schedules()
    }

    fn feature_id(&self) -> Uuid {
        self.feature_id
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeApplier;

impl ChangeApplier {
    /// Apply one entity change. `environment_id` scopes feature params.
    pub async fn apply(
        &self,
        tx: &mut dyn GuardTx,
        environment_id: Uuid,
        change: &EntityChange,
    ) -> Result<()> {
        let step = match change.kind {
            EntityKind::Feature => apply_feature(tx, change).await,
            EntityKind::FeatureParams => apply_feature_params(tx, environment_id, change).await,
            EntityKind::Rule => apply_row::<Rule>(tx, change).await,
            EntityKind::FlagVariant => apply_row::<FlagVariant>(tx, change).await,
            EntityKind::FeatureSchedule => apply_row::<FeatureSchedule>(tx, change).await,
            EntityKind::FeatureTagRelation => apply_tag_relation(tx, change).await,
        };
        step.map_err(|failure| match failure {
            Failure::Apply(source) => GuardError::ApplyFailed {
                kind: change.kind,
                entity_id: change.entity_id,
                source,
            },
            Failure::Store(e) => e,
        })
    }
}

fn unsupported(change: &EntityChange) -> Failure {
    Failure::Apply(ApplyError::UnsupportedAction {
        kind: change.kind,
        action: change.action,
    })
}

fn missing(kind: EntityKind, id: Uuid) -> ApplyError {
    ApplyError::ForeignEntityMissing { kind, id }
}

async fn ensure_feature(tx: &mut dyn GuardTx, feature_id: Uuid) -> Step {
    match tx.features().get_feature(feature_id).await? {
        Some(_) => Ok(()),
        None => Err(missing(EntityKind::Feature, feature_id).into()),
    }
}

async fn apply_feature(tx: &mut dyn GuardTx, change: &EntityChange) -> Step {
    if change.action != EntityAction::Update {
        return Err(unsupported(change));
    }
    let mut feature: Feature = tx
        .features()
        .get_feature(change.entity_id)
        .await?
        .ok_or_else(|| missing(EntityKind::Feature, change.entity_id))?;
    patch(&mut feature, change)?;
    tx.features().update_feature(&feature).await?;
    Ok(())
}

async fn apply_feature_params(
    tx: &mut dyn GuardTx,
    environment_id: Uuid,
    change: &EntityChange,
) -> Step {
    if change.action == EntityAction::Delete {
        return Err(unsupported(change));
    }
    let feature_id = change.entity_id;
    ensure_feature(tx, feature_id).await?;
    let mut params = tx
        .feature_params()
        .get_feature_params(feature_id, environment_id)
        .await?
        .unwrap_or_else(|| FeatureParams::baseline(feature_id, environment_id));
    patch(&mut params, change)?;
    tx.feature_params().upsert_feature_params(&params).await?;
    Ok(())
}

async fn apply_row<T: RowEntity>(tx: &mut dyn GuardTx, change: &EntityChange) -> Step {
    match change.action {
        EntityAction::Insert => {
            let row: T = build_from_insert(change)?;
            ensure_feature(tx, row.feature_id()).await?;
            T::repository(tx).insert(&row).await?;
        }
        EntityAction::Update => {
            let mut row = T::repository(tx)
                .get(change.entity_id)
                .await?
                .ok_or_else(|| missing(T::KIND, change.entity_id))?;
            patch(&mut row, change)?;
            T::repository(tx).update(&row).await?;
        }
        EntityAction::Delete => {
            if !T::repository(tx).delete(change.entity_id).await? {
                return Err(missing(T::KIND, change.entity_id).into());
            }
        }
    }
    Ok(())
}

/// Rebuild the `(feature_id, tag_id)` pair from the `old` side of a detach.
fn relation_from_old(change: &EntityChange) -> std::result::Result<FeatureTagRelation, ApplyError> {
    let mut relation = FeatureTagRelation::blank(change.entity_id);
    for spec in FeatureTagRelation::editable_fields() {
        let value = change
            .old_value(spec.name)
            .ok_or_else(|| ApplyError::MissingField {
                field: spec.name.to_string(),
            })?;
        (spec.set)(&mut relation, value)?;
    }
    Ok(relation)
}

async fn apply_tag_relation(tx: &mut dyn GuardTx, change: &EntityChange) -> Step {
    let relation = match change.action {
        EntityAction::Insert => build_from_insert::<FeatureTagRelation>(change)?,
        EntityAction::Delete => relation_from_old(change)?,
        EntityAction::Update => return Err(unsupported(change)),
    };
    ensure_feature(tx, relation.feature_id).await?;
    if !tx.tag_relations().tag_exists(relation.tag_id).await? {
        return Err(missing(EntityKind::FeatureTagRelation, relation.tag_id).into());
    }
    match change.action {
        EntityAction::Insert => tx.tag_relations().attach_tag(&relation).await?,
        _ => {
            if !tx.tag_relations().detach_tag(&relation).await? {
                return Err(missing(EntityKind::FeatureTagRelation, relation.tag_id).into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryGuardStore;
    use crate::ports::GuardStore;
    use crate::types::ChangeValue;
    use serde_json::json;

    async fn store_with_feature() -> (InMemoryGuardStore, Feature) {
        let store = InMemoryGuardStore::new();
        let feature = Feature {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            key: "checkout".into(),
            name: "Checkout".into(),
            ..Default::default()
        };
        store.seed_feature(feature.clone()).await;
        (store, feature)
    }

    fn variant_insert(feature: &Feature, id: Uuid) -> EntityChange {
        let mut change = EntityChange::new(EntityKind::FlagVariant, id, EntityAction::Insert);
        for (field, value) in [
            ("name", json!("V")),
            ("rollout_percent", json!(75)),
            ("feature_id", json!(feature.id)),
            ("project_id", json!(feature.project_id)),
        ] {
            change.changes.insert(field.into(), ChangeValue::insert(value));
        }
        change
    }

    #[tokio::test]
    async fn inserts_variant_under_existing_feature() {
        let (store, feature) = store_with_feature().await;
        let id = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        ChangeApplier
            .apply(tx.as_mut(), Uuid::new_v4(), &variant_insert(&feature, id))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        let variant = store.variant(id).await.unwrap();
        assert_eq!(variant.rollout_percent, 75);
        assert_eq!(variant.feature_id, feature.id);
    }

    #[tokio::test]
    async fn insert_under_missing_feature_fails() {
        let (store, _) = store_with_feature().await;
        let orphan = Feature {
            id: Uuid::new_v4(),
            ..Default::default()
        };
        let mut tx = store.begin().await.unwrap();
        let err = ChangeApplier
            .apply(tx.as_mut(), Uuid::new_v4(), &variant_insert(&orphan, Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GuardError::ApplyFailed {
                kind: EntityKind::FlagVariant,
                source: ApplyError::ForeignEntityMissing {
                    kind: EntityKind::Feature,
                    ..
                },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn params_are_created_from_baseline() {
        let (store, feature) = store_with_feature().await;
        let env = Uuid::new_v4();
        let mut change = EntityChange::new(EntityKind::FeatureParams, feature.id, EntityAction::Update);
        change
            .changes
            .insert("enabled".into(), ChangeValue::update(json!(false), json!(true)));
        let mut tx = store.begin().await.unwrap();
        ChangeApplier.apply(tx.as_mut(), env, &change).await.unwrap();
        tx.commit().await.unwrap();
        let params = store.feature_params_row(feature.id, env).await.unwrap();
        assert!(params.enabled);
        assert_eq!(params.default_value, "");
    }

    #[tokio::test]
    async fn delete_of_missing_row_fails() {
        let (store, _) = store_with_feature().await;
        let change = EntityChange::new(EntityKind::Rule, Uuid::new_v4(), EntityAction::Delete);
        let mut tx = store.begin().await.unwrap();
        let err = ChangeApplier
            .apply(tx.as_mut(), Uuid::new_v4(), &change)
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 422);
    }

    #[tokio::test]
    async fn tag_relation_attach_and_detach() {
        let (store, feature) = store_with_feature().await;
        let tag_id = Uuid::new_v4();
        store.seed_tag(tag_id).await;
        let relation = FeatureTagRelation {
            feature_id: feature.id,
            tag_id,
        };

        let mut attach = EntityChange::new(EntityKind::FeatureTagRelation, tag_id, EntityAction::Insert);
        attach
            .changes
            .insert("feature_id".into(), ChangeValue::insert(json!(feature.id)));
        attach
            .changes
            .insert("tag_id".into(), ChangeValue::insert(json!(tag_id)));
        let mut tx = store.begin().await.unwrap();
        ChangeApplier.apply(tx.as_mut(), Uuid::nil(), &attach).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.has_tag_relation(&relation).await);

        let mut detach = EntityChange::new(EntityKind::FeatureTagRelation, tag_id, EntityAction::Delete);
        detach
            .changes
            .insert("feature_id".into(), ChangeValue::delete(json!(feature.id)));
        detach
            .changes
            .insert("tag_id".into(), ChangeValue::delete(json!(tag_id)));
        let mut tx = store.begin().await.unwrap();
        ChangeApplier.apply(tx.as_mut(), Uuid::nil(), &detach).await.unwrap();
        tx.commit().await.unwrap();
        assert!(!store.has_tag_relation(&relation).await);
    }

    #[tokio::test]
    async fn feature_insert_is_unsupported() {
        let (store, feature) = store_with_feature().await;
        let change = EntityChange::new(EntityKind::Feature, feature.id, EntityAction::Insert);
        let mut tx = store.begin().await.unwrap();
        let err = ChangeApplier
            .apply(tx.as_mut(), Uuid::nil(), &change)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GuardError::ApplyFailed {
                source: ApplyError::UnsupportedAction { .. },
                ..
            }
        ));
    }
}
