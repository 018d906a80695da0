use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use serde_json::Value;

use super::{JsonPath, canonical_key, compare_scalars, json_eq, kind_name};
use crate::{Error, Result};

/// Operator applied by a [`FieldPredicate`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    In,
    NotIn,
    Equals,
    Gte,
    Lte,
    Range,
}

/// Leaf constraint on a single document field.
///
/// Construction validates the value set: membership operators need at least one
/// value, `Equals`/`Gte`/`Lte` exactly one and `Range` exactly two bounds of the
/// same kind. Membership values are de-duplicated keeping first-seen order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldPredicate {
    field: JsonPath,
    op: Operator,
    values: Vec<Value>,
}

impl FieldPredicate {
    pub fn new<I>(field: impl Into<JsonPath>, op: Operator, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = Value>,
    {
        let field = field.into();
        let mut values: Vec<Value> = values.into_iter().collect();
        if field.parts().is_empty() {
            return Err(Error::invalid_predicate("", "field path is empty"));
        }
        match op {
            Operator::In | Operator::NotIn => {
                values = dedupe(values);
                if values.is_empty() {
                    return Err(Error::invalid_predicate(
                        field.to_string(),
                        "membership needs at least one value",
                    ));
                }
            }
            Operator::Equals => expect_len(&field, &values, 1)?,
            Operator::Gte | Operator::Lte => {
                expect_len(&field, &values, 1)?;
                expect_bound(&field, &values[0])?;
            }
            Operator::Range => {
                expect_len(&field, &values, 2)?;
                expect_bound(&field, &values[0])?;
                expect_bound(&field, &values[1])?;
                if kind_name(&values[0]) != kind_name(&values[1]) {
                    return Err(Error::invalid_predicate(
                        field.to_string(),
                        "range bounds must both be numbers or both be strings",
                    ));
                }
            }
        }
        Ok(Self { field, op, values })
    }

    pub fn field(&self) -> &JsonPath {
        &self.field
    }

    pub fn op(&self) -> Operator {
        self.op
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn matches(&self, doc: &Value) -> bool {
        let found = self.field.lookup(doc);
        match self.op {
            Operator::In | Operator::Equals => found.is_some_and(|v| self.contains(v)),
            Operator::NotIn => !found.is_some_and(|v| self.contains(v)),
            Operator::Gte => found.is_some_and(|v| self.at_least(v, &self.values[0])),
            Operator::Lte => found.is_some_and(|v| self.at_most(v, &self.values[0])),
            Operator::Range => found.is_some_and(|v| {
                self.at_least(v, &self.values[0]) && self.at_most(v, &self.values[1])
            }),
        }
    }

    fn contains(&self, found: &Value) -> bool {
        let listed = |candidate: &Value| self.values.iter().any(|v| json_eq(v, candidate));
        if listed(found) {
            return true;
        }
        match found {
            Value::Array(items) => items.iter().any(listed),
            _ => false,
        }
    }

    fn at_least(&self, found: &Value, bound: &Value) -> bool {
        compare_scalars(found, bound).is_some_and(|ord| ord.is_ge())
    }

    fn at_most(&self, found: &Value, bound: &Value) -> bool {
        compare_scalars(found, bound).is_some_and(|ord| ord.is_le())
    }
}

fn dedupe(values: Vec<Value>) -> Vec<Value> {
    let mut seen = HashSet::with_capacity(values.len());
    values
        .into_iter()
        .filter(|value| seen.insert(canonical_key(value)))
        .collect()
}

fn expect_len(field: &JsonPath, values: &[Value], expected: usize) -> Result<()> {
    if values.len() == expected {
        Ok(())
    } else {
        Err(Error::invalid_predicate(
            field.to_string(),
            format!("expected {expected} value(s), got {}", values.len()),
        ))
    }
}

fn expect_bound(field: &JsonPath, value: &Value) -> Result<()> {
    match value {
        Value::Number(_) | Value::String(_) => Ok(()),
        other => Err(Error::invalid_predicate(
            field.to_string(),
            format!("comparison bound must be a number or string, got {}", kind_name(other)),
        )),
    }
}

/// Boolean constraint tree evaluated against stored documents.
///
/// `And([])` matches everything and `Or([])` matches nothing.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Field(FieldPredicate),
    Exists(JsonPath),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Matches every document.
    pub fn all() -> Self {
        Self::And(Vec::new())
    }

    pub fn eq(path: impl Into<JsonPath>, value: impl Into<Value>) -> Self {
        Self::Field(FieldPredicate {
            field: path.into(),
            op: Operator::Equals,
            values: vec![value.into()],
        })
    }

    pub fn r#in<I, V>(path: impl Into<JsonPath>, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        FieldPredicate::new(path, Operator::In, values.into_iter().map(Into::into)).map(Self::Field)
    }

    pub fn not_in<I, V>(path: impl Into<JsonPath>, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        FieldPredicate::new(path, Operator::NotIn, values.into_iter().map(Into::into))
            .map(Self::Field)
    }

    pub fn gte(path: impl Into<JsonPath>, bound: impl Into<Value>) -> Result<Self> {
        FieldPredicate::new(path, Operator::Gte, [bound.into()]).map(Self::Field)
    }

    pub fn lte(path: impl Into<JsonPath>, bound: impl Into<Value>) -> Result<Self> {
        FieldPredicate::new(path, Operator::Lte, [bound.into()]).map(Self::Field)
    }

    /// Inclusive on both ends.
    pub fn range(
        path: impl Into<JsonPath>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Result<Self> {
        FieldPredicate::new(path, Operator::Range, [low.into(), high.into()]).map(Self::Field)
    }

    pub fn exists(path: impl Into<JsonPath>) -> Self {
        Self::Exists(path.into())
    }

    pub fn negate(predicate: Predicate) -> Self {
        Self::Not(Box::new(predicate))
    }

    pub fn and(predicates: Vec<Predicate>) -> Self {
        Self::And(predicates)
    }

    pub fn or(predicates: Vec<Predicate>) -> Self {
        Self::Or(predicates)
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Predicate::Field(leaf) => leaf.matches(doc),
            Predicate::Exists(path) => path.lookup(doc).is_some_and(|v| !v.is_null()),
            Predicate::And(children) => children.iter().all(|p| p.matches(doc)),
            Predicate::Or(children) => children.iter().any(|p| p.matches(doc)),
            Predicate::Not(inner) => !inner.matches(doc),
        }
    }

    /// Top-level document fields read anywhere in this tree.
    pub fn root_fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_roots(&mut out);
        out
    }

    fn collect_roots(&self, out: &mut BTreeSet<String>) {
        match self {
            Predicate::Field(leaf) => {
                if let Some(root) = leaf.field.root() {
                    out.insert(root.to_string());
                }
            }
            Predicate::Exists(path) => {
                if let Some(root) = path.root() {
                    out.insert(root.to_string());
                }
            }
            Predicate::And(children) | Predicate::Or(children) => {
                children.iter().for_each(|p| p.collect_roots(out));
            }
            Predicate::Not(inner) => inner.collect_roots(out),
        }
    }
}

impl From<FieldPredicate> for Predicate {
    fn from(leaf: FieldPredicate) -> Self {
        Predicate::Field(leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn membership_requires_values() {
        let err = Predicate::r#in("status", Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidPredicate { .. }));
    }

    #[test]
    fn membership_values_are_deduplicated_in_order() {
        let leaf = FieldPredicate::new(
            "status",
            Operator::In,
            [json!("Open"), json!("Done"), json!("Open")],
        )
        .unwrap();
        assert_eq!(leaf.values(), [json!("Open"), json!("Done")]);
    }

    #[test]
    fn membership_compares_numbers_by_value() {
        let leaf = Predicate::r#in("points", [1]).unwrap();
        assert!(leaf.matches(&json!({"points": 1.0})));
        assert!(leaf.matches(&json!({"points": [3, 1.0]})));
        assert!(Predicate::eq("points", 2.0).matches(&json!({"points": 2})));

        let deduped = FieldPredicate::new("points", Operator::In, [json!(1), json!(1.0)]).unwrap();
        assert_eq!(deduped.values(), [json!(1)]);
    }

    #[test]
    fn range_needs_two_bounds_of_one_kind() {
        assert!(FieldPredicate::new("ts", Operator::Range, [json!(1)]).is_err());
        assert!(Predicate::range("ts", 1, "2024-01-01").is_err());
        assert!(Predicate::range("ts", 1, 1).is_ok());
        assert!(Predicate::gte("ts", true).is_err());
    }

    #[test]
    fn membership_checks_array_elements() {
        let doc = json!({"labels": ["backend", "rejected"], "status": "Open"});
        let has_rejected = Predicate::r#in("labels", ["rejected"]).unwrap();
        let not_rejected = Predicate::not_in("labels", ["rejected", "duplicate"]).unwrap();
        assert!(has_rejected.matches(&doc));
        assert!(!not_rejected.matches(&doc));
        assert!(not_rejected.matches(&json!({"status": "Open"})));
    }

    #[test]
    fn comparisons_follow_value_kind() {
        let doc = json!({"ts": 1704103200000_i64, "day": "2024-01-02"});
        assert!(
            Predicate::range("ts", 1704067200000_i64, 1704239999000_i64)
                .unwrap()
                .matches(&doc)
        );
        assert!(Predicate::gte("day", "2024-01-01").unwrap().matches(&doc));
        assert!(!Predicate::lte("day", "2024-01-01").unwrap().matches(&doc));
        assert!(!Predicate::gte("day", 5).unwrap().matches(&doc));
        assert!(!Predicate::gte("missing", 5).unwrap().matches(&doc));
    }

    #[test]
    fn empty_groups_match_all_or_nothing() {
        let doc = json!({});
        assert!(Predicate::all().matches(&doc));
        assert!(!Predicate::or(vec![]).matches(&doc));
    }

    #[test]
    fn root_fields_cover_nested_trees() {
        let p = Predicate::and(vec![
            Predicate::eq("basicProjectConfigId", "p1"),
            Predicate::negate(Predicate::exists("authorDetails.email")),
        ]);
        let roots: Vec<_> = p.root_fields().into_iter().collect();
        assert_eq!(roots, ["authorDetails", "basicProjectConfigId"]);
    }
}
