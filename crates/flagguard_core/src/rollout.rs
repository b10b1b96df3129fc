//! Structured boolean rollout expressions attached to rules.
//!
//! Two expressions are equal when they are semantically the same predicate:
//! comparison goes through [`RolloutExpression::normalized`], which flattens
//! nested `and`/`or`, ignores operand order, collapses duplicates and cancels
//! double negation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RolloutExpression {
    Const { value: bool },
    Eq { attribute: String, value: Value },
    In { attribute: String, values: Vec<Value> },
    Percentage { attribute: String, percent: f64 },
    Not { expr: Box<RolloutExpression> },
    And { exprs: Vec<RolloutExpression> },
    Or { exprs: Vec<RolloutExpression> },
}

impl Default for RolloutExpression {
    fn default() -> Self {
        Self::Const { value: true }
    }
}

impl RolloutExpression {
    pub fn equals(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn negate(expr: RolloutExpression) -> Self {
        Self::Not {
            expr: Box::new(expr),
        }
    }

    pub fn and(exprs: Vec<RolloutExpression>) -> Self {
        Self::And { exprs }
    }

    pub fn or(exprs: Vec<RolloutExpression>) -> Self {
        Self::Or { exprs }
    }

    /// Canonical form used for equality.
    pub fn normalized(&self) -> RolloutExpression {
        match self {
            Self::Const { value } => Self::Const { value: *value },
            Self::Eq { attribute, value } => Self::Eq {
                attribute: attribute.clone(),
                value: value.clone(),
            },
            Self::In { attribute, values } => {
                let mut values = values.clone();
                values.sort_by_key(|v| v.to_string());
                values.dedup();
                Self::In {
                    attribute: attribute.clone(),
                    values,
                }
            }
            Self::Percentage { attribute, percent } => Self::Percentage {
                attribute: attribute.clone(),
                percent: *percent,
            },
            Self::Not { expr } => match expr.normalized() {
                Self::Not { expr: inner } => *inner,
                Self::Const { value } => Self::Const { value: !value },
                other => Self::negate(other),
            },
            Self::And { exprs } => Self::normalize_junction(exprs, true),
            Self::Or { exprs } => Self::normalize_junction(exprs, false),
        }
    }

    fn normalize_junction(exprs: &[RolloutExpression], is_and: bool) -> RolloutExpression {
        let mut flat = Vec::with_capacity(exprs.len());
        for expr in exprs {
            match (expr.normalized(), is_and) {
                (Self::And { exprs: inner }, true) | (Self::Or { exprs: inner }, false) => {
                    flat.extend(inner)
                }
                (other, _) => flat.push(other),
            }
        }
        let mut keyed: Vec<(String, RolloutExpression)> = flat
            .into_iter()
            .map(|e| (e.canonical_key(), e))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.dedup_by(|a, b| a.0 == b.0);
        let mut operands: Vec<RolloutExpression> = keyed.into_iter().map(|(_, e)| e).collect();

        match operands.len() {
            0 => Self::Const { value: is_and },
            1 => operands.remove(0),
            _ if is_and => Self::And { exprs: operands },
            _ => Self::Or { exprs: operands },
        }
    }

    /// JSON text of an already-normalized expression. Object keys serialize
    /// in sorted order, so the text is stable.
    fn canonical_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl PartialEq for RolloutExpression {
    fn eq(&self, other: &Self) -> bool {
        self.normalized().canonical_key() == other.normalized().canonical_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn country(c: &str) -> RolloutExpression {
        RolloutExpression::equals("country", c)
    }

    #[test]
    fn operand_order_is_ignored() {
        let a = RolloutExpression::and(vec![country("DE"), country("FR")]);
        let b = RolloutExpression::and(vec![country("FR"), country("DE")]);
        assert_eq!(a, b);
    }

    #[test]
    fn and_is_not_or() {
        let a = RolloutExpression::and(vec![country("DE"), country("FR")]);
        let b = RolloutExpression::or(vec![country("DE"), country("FR")]);
        assert_ne!(a, b);
    }

    #[test]
    fn nested_junctions_flatten() {
        let nested = RolloutExpression::and(vec![
            country("DE"),
            RolloutExpression::and(vec![country("FR"), country("IT")]),
        ]);
        let flat = RolloutExpression::and(vec![country("IT"), country("DE"), country("FR")]);
        assert_eq!(nested, flat);
    }

    #[test]
    fn double_negation_cancels() {
        let twice = RolloutExpression::negate(RolloutExpression::negate(country("DE")));
        assert_eq!(twice, country("DE"));
        assert_ne!(RolloutExpression::negate(country("DE")), country("DE"));
    }

    #[test]
    fn single_operand_junction_collapses() {
        assert_eq!(RolloutExpression::or(vec![country("DE")]), country("DE"));
        assert_eq!(
            RolloutExpression::and(vec![]),
            RolloutExpression::Const { value: true }
        );
        assert_eq!(
            RolloutExpression::or(vec![]),
            RolloutExpression::Const { value: false }
        );
    }

    #[test]
    fn in_values_are_a_set() {
        let a = RolloutExpression::In {
            attribute: "plan".into(),
            values: vec![json!("pro"), json!("free"), json!("pro")],
        };
        let b = RolloutExpression::In {
            attribute: "plan".into(),
            values: vec![json!("free"), json!("pro")],
        };
        assert_eq!(a, b);
    }

    #[test]
    fn serde_uses_op_tag() {
        let expr: RolloutExpression = serde_json::from_value(json!({
            "op": "or",
            "exprs": [
                {"op": "eq", "attribute": "country", "value": "DE"},
                {"op": "percentage", "attribute": "user_id", "percent": 12.5}
            ]
        }))
        .unwrap();
        assert!(matches!(expr, RolloutExpression::Or { ref exprs } if exprs.len() == 2));
    }

    fn arb_leaf() -> impl Strategy<Value = RolloutExpression> {
        prop_oneof![
            any::<bool>().prop_map(|value| RolloutExpression::Const { value }),
            ("[a-c]", 0i64..4).prop_map(|(a, v)| RolloutExpression::equals(a, v)),
            ("[a-c]", prop::collection::vec(0i64..4, 0..4)).prop_map(|(a, vs)| {
                RolloutExpression::In {
                    attribute: a,
                    values: vs.into_iter().map(Value::from).collect(),
                }
            }),
        ]
    }

    fn arb_expr() -> impl Strategy<Value = RolloutExpression> {
        arb_leaf().prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                inner.clone().prop_map(RolloutExpression::negate),
                prop::collection::vec(inner.clone(), 0..4).prop_map(RolloutExpression::and),
                prop::collection::vec(inner, 0..4).prop_map(RolloutExpression::or),
            ]
        })
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(expr in arb_expr()) {
            let once = expr.normalized();
            prop_assert_eq!(once.canonical_key(), once.normalized().canonical_key());
        }

        #[test]
        fn reversing_operands_preserves_equality(exprs in prop::collection::vec(arb_expr(), 0..5)) {
            let mut reversed = exprs.clone();
            reversed.reverse();
            prop_assert_eq!(RolloutExpression::and(exprs.clone()), RolloutExpression::and(reversed.clone()));
            prop_assert_eq!(RolloutExpression::or(exprs), RolloutExpression::or(reversed));
        }
    }
}
