//! Per-kind field registry.
//!
//! Every editable entity declares a fixed whitelist of fields, each with a
//! getter into JSON, a coercing setter back from JSON, and an equality taken
//! over the stored form.
//! The diff builder and the applier both walk these tables, so a field that
//! is not listed here can neither be proposed nor replayed.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::entities::{
    Feature, FeatureParams, FeatureSchedule, FeatureTagRelation, FlagVariant, Rule,
};
use crate::error::ApplyError;
use crate::rollout::RolloutExpression;
use crate::types::{EntityChange, EntityKind};

// ── Field values ──────────────────────────────────────────────

/// A typed field that can travel through a payload as loose JSON.
pub trait FieldValue: Sized {
    /// Shown in `TypeMismatch` errors.
    const TYPE_NAME: &'static str;

    fn to_value(&self) -> Value;

    /// Coerce a stored JSON value back; `None` when it does not fit.
    fn from_value(value: &Value) -> Option<Self>;

    /// Equal once stored. Values that encode alike never produce a diff.
    fn same_as(&self, other: &Self) -> bool {
        self.to_value() == other.to_value()
    }

    /// Whether the stored form reads back as exactly this value.
    fn representable(&self) -> bool {
        true
    }
}

impl FieldValue for String {
    const TYPE_NAME: &'static str = "string";

    fn to_value(&self) -> Value {
        Value::String(self.clone())
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl FieldValue for bool {
    const TYPE_NAME: &'static str = "boolean";

    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

fn integer_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl FieldValue for i32 {
    const TYPE_NAME: &'static str = "integer";

    fn to_value(&self) -> Value {
        Value::from(*self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        integer_of(value).and_then(|i| i32::try_from(i).ok())
    }
}

impl FieldValue for i64 {
    const TYPE_NAME: &'static str = "integer";

    fn to_value(&self) -> Value {
        Value::from(*self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        integer_of(value)
    }
}

impl FieldValue for f64 {
    const TYPE_NAME: &'static str = "number";

    fn to_value(&self) -> Value {
        Value::from(*self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok().filter(|f: &f64| f.is_finite()),
            _ => None,
        }
    }

    // NaN and infinities serialize as null.
    fn representable(&self) -> bool {
        self.is_finite()
    }
}

impl FieldValue for Uuid {
    const TYPE_NAME: &'static str = "uuid";

    fn to_value(&self) -> Value {
        Value::String(self.to_string())
    }

    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().and_then(|s| Uuid::parse_str(s).ok())
    }
}

impl FieldValue for DateTime<Utc> {
    const TYPE_NAME: &'static str = "timestamp";

    fn to_value(&self) -> Value {
        Value::String(self.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    fn from_value(value: &Value) -> Option<Self> {
        value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Durations are stored as whole milliseconds. Strings such as `"90s"`,
/// `"15m"` or `"1d"` are accepted on the way back in.
impl FieldValue for Duration {
    const TYPE_NAME: &'static str = "duration";

    fn to_value(&self) -> Value {
        Value::from(u64::try_from(self.as_millis()).unwrap_or(u64::MAX))
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(Duration::from_millis),
            Value::String(s) => parse_duration(s),
            _ => None,
        }
    }

    fn representable(&self) -> bool {
        self.subsec_nanos() % 1_000_000 == 0 && u64::try_from(self.as_millis()).is_ok()
    }
}

fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let split = text.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = text.split_at(split);
    let amount: u64 = amount.parse().ok()?;
    let millis = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return None,
    };
    amount.checked_mul(millis).map(Duration::from_millis)
}

impl FieldValue for RolloutExpression {
    const TYPE_NAME: &'static str = "rollout expression";

    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    // Semantic: operand order of and/or does not matter.
    fn same_as(&self, other: &Self) -> bool {
        self == other
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;

    fn to_value(&self) -> Value {
        self.as_ref().map_or(Value::Null, FieldValue::to_value)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }

    fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.same_as(b),
            (None, None) => true,
            _ => false,
        }
    }

    fn representable(&self) -> bool {
        self.as_ref().map_or(true, FieldValue::representable)
    }
}

// ── Field specs ───────────────────────────────────────────────

/// Accessors for one whitelisted field of `T`.
pub struct FieldSpec<T: 'static> {
    pub name: &'static str,
    pub get: fn(&T) -> Value,
    pub set: fn(&mut T, &Value) -> Result<(), ApplyError>,
    pub eq: fn(&T, &T) -> bool,
    pub representable: fn(&T) -> bool,
}

impl<T: 'static> std::fmt::Debug for FieldSpec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldSpec").field("name", &self.name).finish()
    }
}

fn expected_of<V: FieldValue>(_: &V) -> &'static str {
    V::TYPE_NAME
}

macro_rules! field {
    ($owner:ty, $name:ident) => {
        FieldSpec {
            name: stringify!($name),
            get: |row: &$owner| FieldValue::to_value(&row.$name),
            set: |row: &mut $owner, value: &Value| {
                let expected = expected_of(&row.$name);
                row.$name = FieldValue::from_value(value).ok_or_else(|| {
                    ApplyError::type_mismatch(stringify!($name), expected, value)
                })?;
                Ok(())
            },
            eq: |a: &$owner, b: &$owner| FieldValue::same_as(&a.$name, &b.$name),
            representable: |row: &$owner| FieldValue::representable(&row.$name),
        }
    };
}

/// A configuration entity the guard can diff and replay.
pub trait Editable: Sized + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Fields a guarded change may alter.
    fn editable_fields() -> &'static [FieldSpec<Self>];

    /// Parent keys an insert must carry to recreate the row.
    fn identity_fields() -> &'static [FieldSpec<Self>];

    fn entity_id(&self) -> Uuid;

    /// Empty row with only its primary key set, filled in by an insert.
    fn blank(id: Uuid) -> Self;
}

const FEATURE_FIELDS: &[FieldSpec<Feature>] = &[
    field!(Feature, name),
    field!(Feature, description),
    field!(Feature, rollout_key),
    field!(Feature, value_type),
    field!(Feature, permanent),
];

const FEATURE_IDENTITY: &[FieldSpec<Feature>] =
    &[field!(Feature, project_id), field!(Feature, key)];

impl Editable for Feature {
    const KIND: EntityKind = EntityKind::Feature;

    fn editable_fields() -> &'static [FieldSpec<Self>] {
        FEATURE_FIELDS
    }

    fn identity_fields() -> &'static [FieldSpec<Self>] {
        FEATURE_IDENTITY
    }

    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn blank(id: Uuid) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

const FEATURE_PARAMS_FIELDS: &[FieldSpec<FeatureParams>] = &[
    field!(FeatureParams, enabled),
    field!(FeatureParams, default_value),
];

impl Editable for FeatureParams {
    const KIND: EntityKind = EntityKind::FeatureParams;

    fn editable_fields() -> &'static [FieldSpec<Self>] {
        FEATURE_PARAMS_FIELDS
    }

    // Keyed by (feature, environment); both come from the pending change.
    fn identity_fields() -> &'static [FieldSpec<Self>] {
        &[]
    }

    fn entity_id(&self) -> Uuid {
        self.feature_id
    }

    fn blank(id: Uuid) -> Self {
        Self {
            feature_id: id,
            ..Default::default()
        }
    }
}

const RULE_FIELDS: &[FieldSpec<Rule>] = &[
    field!(Rule, name),
    field!(Rule, priority),
    field!(Rule, value),
    field!(Rule, rollout_percent),
    field!(Rule, condition),
];

const RULE_IDENTITY: &[FieldSpec<Rule>] = &[
    field!(Rule, feature_id),
    field!(Rule, project_id),
    field!(Rule, environment_id),
];

impl Editable for Rule {
    const KIND: EntityKind = EntityKind::Rule;

    fn editable_fields() -> &'static [FieldSpec<Self>] {
        RULE_FIELDS
    }

    fn identity_fields() -> &'static [FieldSpec<Self>] {
        RULE_IDENTITY
    }

    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn blank(id: Uuid) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

const FLAG_VARIANT_FIELDS: &[FieldSpec<FlagVariant>] = &[
    field!(FlagVariant, name),
    field!(FlagVariant, rollout_percent),
];

const FLAG_VARIANT_IDENTITY: &[FieldSpec<FlagVariant>] = &[
    field!(FlagVariant, feature_id),
    field!(FlagVariant, project_id),
];

impl Editable for FlagVariant {
    const KIND: EntityKind = EntityKind::FlagVariant;

    fn editable_fields() -> &'static [FieldSpec<Self>] {
        FLAG_VARIANT_FIELDS
    }

    fn identity_fields() -> &'static [FieldSpec<Self>] {
        FLAG_VARIANT_IDENTITY
    }

    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn blank(id: Uuid) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

const FEATURE_SCHEDULE_FIELDS: &[FieldSpec<FeatureSchedule>] = &[
    field!(FeatureSchedule, name),
    field!(FeatureSchedule, enabled),
    field!(FeatureSchedule, value),
    field!(FeatureSchedule, start_at),
    field!(FeatureSchedule, end_at),
    field!(FeatureSchedule, rollout_step),
];

const FEATURE_SCHEDULE_IDENTITY: &[FieldSpec<FeatureSchedule>] = &[
    field!(FeatureSchedule, feature_id),
    field!(FeatureSchedule, project_id),
    field!(FeatureSchedule, environment_id),
];

impl Editable for FeatureSchedule {
    const KIND: EntityKind = EntityKind::FeatureSchedule;

    fn editable_fields() -> &'static [FieldSpec<Self>] {
        FEATURE_SCHEDULE_FIELDS
    }

    fn identity_fields() -> &'static [FieldSpec<Self>] {
        FEATURE_SCHEDULE_IDENTITY
    }

    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn blank(id: Uuid) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

const FEATURE_TAG_RELATION_FIELDS: &[FieldSpec<FeatureTagRelation>] = &[
    field!(FeatureTagRelation, feature_id),
    field!(FeatureTagRelation, tag_id),
];

impl Editable for FeatureTagRelation {
    const KIND: EntityKind = EntityKind::FeatureTagRelation;

    fn editable_fields() -> &'static [FieldSpec<Self>] {
        FEATURE_TAG_RELATION_FIELDS
    }

    fn identity_fields() -> &'static [FieldSpec<Self>] {
        &[]
    }

    fn entity_id(&self) -> Uuid {
        self.tag_id
    }

    fn blank(id: Uuid) -> Self {
        Self {
            feature_id: Uuid::nil(),
            tag_id: id,
        }
    }
}

// ── Replay helpers ────────────────────────────────────────────

fn find_field<T: Editable>(name: &str) -> Option<&'static FieldSpec<T>> {
    T::editable_fields().iter().find(|f| f.name == name)
}

/// Overwrite `target` with every `new` value carried by `change`.
/// Only editable fields may be patched; identity fields are fixed.
pub fn patch<T: Editable>(target: &mut T, change: &EntityChange) -> Result<(), ApplyError> {
    for (name, value) in &change.changes {
        let Some(new) = value.new.as_ref() else {
            continue;
        };
        let spec = find_field::<T>(name).ok_or_else(|| ApplyError::UnknownField {
            kind: T::KIND,
            field: name.clone(),
        })?;
        (spec.set)(target, new)?;
    }
    Ok(())
}

/// Construct a whole row from an insert diff. Every editable and identity
/// field must be present.
pub fn build_from_insert<T: Editable>(change: &EntityChange) -> Result<T, ApplyError> {
    let known = |name: &str| {
        T::editable_fields()
            .iter()
            .chain(T::identity_fields())
            .any(|f| f.name == name)
    };
    if let Some(unknown) = change.changes.keys().find(|name| !known(name)) {
        return Err(ApplyError::UnknownField {
            kind: T::KIND,
            field: unknown.clone(),
        });
    }

    let mut row = T::blank(change.entity_id);
    for spec in T::editable_fields().iter().chain(T::identity_fields()) {
        let value = change
            .new_value(spec.name)
            .ok_or_else(|| ApplyError::MissingField {
                field: spec.name.to_string(),
            })?;
        (spec.set)(&mut row, value)?;
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeValue, EntityAction};
    use serde_json::json;

    #[test]
    fn coercion_accepts_loose_json() {
        assert_eq!(i32::from_value(&json!(75)), Some(75));
        assert_eq!(i32::from_value(&json!(75.0)), Some(75));
        assert_eq!(i32::from_value(&json!("75")), Some(75));
        assert_eq!(i32::from_value(&json!(75.5)), None);
        assert_eq!(i32::from_value(&json!("high")), None);
        assert_eq!(bool::from_value(&json!("true")), Some(true));
        assert_eq!(String::from_value(&json!(3)), Some("3".to_string()));
        assert_eq!(f64::from_value(&json!("33.3")), Some(33.3));
        assert_eq!(Option::<i32>::from_value(&Value::Null), Some(None));
    }

    #[test]
    fn durations_parse_from_millis_and_units() {
        assert_eq!(
            Duration::from_value(&json!(1500)),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            Duration::from_value(&json!("15m")),
            Some(Duration::from_secs(900))
        );
        assert_eq!(
            Duration::from_value(&json!("1d")),
            Some(Duration::from_secs(86_400))
        );
        assert_eq!(Duration::from_value(&json!("soon")), None);
        assert_eq!(Duration::from_secs(2).to_value(), json!(2000));
    }

    #[test]
    fn timestamps_round_trip() {
        let at: DateTime<Utc> = "2024-03-01T10:00:00Z".parse().unwrap();
        let value = at.to_value();
        assert_eq!(value, json!("2024-03-01T10:00:00Z"));
        assert_eq!(DateTime::<Utc>::from_value(&value), Some(at));
    }

    #[test]
    fn field_tables_have_unique_names() {
        fn names<T: Editable>() -> Vec<&'static str> {
            T::editable_fields()
                .iter()
                .chain(T::identity_fields())
                .map(|f| f.name)
                .collect()
        }
        for list in [
            names::<Feature>(),
            names::<FeatureParams>(),
            names::<Rule>(),
            names::<FlagVariant>(),
            names::<FeatureSchedule>(),
            names::<FeatureTagRelation>(),
        ] {
            let mut sorted = list.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), list.len(), "{list:?}");
        }
    }

    #[test]
    fn patch_sets_only_new_values() {
        let mut variant = FlagVariant {
            id: Uuid::new_v4(),
            name: "A".into(),
            rollout_percent: 10,
            ..Default::default()
        };
        let mut change = EntityChange::new(EntityKind::FlagVariant, variant.id, EntityAction::Update);
        change
            .changes
            .insert("rollout_percent".into(), ChangeValue::update(json!(10), json!(40)));
        patch(&mut variant, &change).unwrap();
        assert_eq!(variant.rollout_percent, 40);
        assert_eq!(variant.name, "A");
    }

    #[test]
    fn patch_rejects_identity_and_unknown_fields() {
        let mut variant = FlagVariant::default();
        let mut change = EntityChange::new(EntityKind::FlagVariant, Uuid::nil(), EntityAction::Update);
        change.changes.insert(
            "feature_id".into(),
            ChangeValue::update(json!(Uuid::nil()), json!(Uuid::new_v4())),
        );
        assert_eq!(
            patch(&mut variant, &change),
            Err(ApplyError::UnknownField {
                kind: EntityKind::FlagVariant,
                field: "feature_id".into()
            })
        );
    }

    #[test]
    fn patch_reports_type_mismatch() {
        let mut rule = Rule::default();
        let mut change = EntityChange::new(EntityKind::Rule, Uuid::nil(), EntityAction::Update);
        change
            .changes
            .insert("priority".into(), ChangeValue::update(json!(1), json!("high")));
        assert_eq!(
            patch(&mut rule, &change),
            Err(ApplyError::TypeMismatch {
                field: "priority".into(),
                expected: "integer",
                found: "\"high\"".into()
            })
        );
    }

    #[test]
    fn insert_requires_every_field() {
        let id = Uuid::new_v4();
        let feature_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();
        let mut change = EntityChange::new(EntityKind::FlagVariant, id, EntityAction::Insert);
        change.changes.insert("name".into(), ChangeValue::insert(json!("V")));
        change
            .changes
            .insert("rollout_percent".into(), ChangeValue::insert(json!(75)));
        change
            .changes
            .insert("feature_id".into(), ChangeValue::insert(json!(feature_id)));

        assert_eq!(
            build_from_insert::<FlagVariant>(&change).unwrap_err(),
            ApplyError::MissingField {
                field: "project_id".into()
            }
        );

        change
            .changes
            .insert("project_id".into(), ChangeValue::insert(json!(project_id)));
        let built: FlagVariant = build_from_insert(&change).unwrap();
        assert_eq!(
            built,
            FlagVariant {
                id,
                feature_id,
                project_id,
                name: "V".into(),
                rollout_percent: 75,
            }
        );
    }
}
