use std::cmp::Ordering;
use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::Value;

mod predicate;
pub(crate) mod sql;

pub use predicate::{FieldPredicate, Operator, Predicate};

/// Direction for sorting results.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// A JSON path expressed as segments compatible with Postgres' `#>` operator.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct JsonPath(Vec<String>);

impl JsonPath {
    fn parse_segmented(input: &str) -> Vec<String> {
        let mut segments = Vec::new();
        let mut buffer = String::new();
        let mut chars = input.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '.' => {
                    if !buffer.is_empty() {
                        segments.push(std::mem::take(&mut buffer));
                    }
                }
                '[' => {
                    if !buffer.is_empty() {
                        segments.push(std::mem::take(&mut buffer));
                    }
                    let mut index = String::new();
                    for next in chars.by_ref() {
                        if next == ']' {
                            break;
                        }
                        index.push(next);
                    }
                    if !index.is_empty() {
                        segments.push(index);
                    }
                }
                _ => buffer.push(ch),
            }
        }

        if !buffer.is_empty() {
            segments.push(buffer);
        }

        segments
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Top-level document field this path starts at.
    pub fn root(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Resolve the path against a document. Numeric segments index into arrays.
    pub fn lookup<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        let mut current = doc;
        for segment in &self.0 {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Write `value` at this path, creating intermediate objects as needed.
    /// Non-object intermediates are replaced.
    pub(crate) fn set(&self, doc: &mut Value, value: Value) {
        let Some((last, parents)) = self.0.split_last() else {
            *doc = value;
            return;
        };
        let mut current = doc;
        for segment in parents {
            if !current.is_object() {
                *current = Value::Object(Default::default());
            }
            current = match current {
                Value::Object(map) => map
                    .entry(segment.clone())
                    .or_insert_with(|| Value::Object(Default::default())),
                _ => return,
            };
        }
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        if let Value::Object(map) = current {
            map.insert(last.clone(), value);
        }
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl Serialize for JsonPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl From<&str> for JsonPath {
    fn from(value: &str) -> Self {
        Self(Self::parse_segmented(value))
    }
}

impl From<String> for JsonPath {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<&String> for JsonPath {
    fn from(value: &String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<Vec<String>> for JsonPath {
    fn from(value: Vec<String>) -> Self {
        Self(value)
    }
}

impl<'a> From<&'a [&'a str]> for JsonPath {
    fn from(value: &'a [&'a str]) -> Self {
        Self(value.iter().map(|segment| segment.to_string()).collect())
    }
}

/// Compare two scalars of the same kind. Numbers compare numerically, strings
/// lexicographically; anything else is incomparable.
pub(crate) fn compare_scalars(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::String(_) => 1,
        Value::Number(_) => 2,
        Value::Bool(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values following jsonb: kinds first, then element or
/// pair count for arrays and objects. Strings compare bytewise, which agrees with
/// Postgres only under the `C` collation.
pub(crate) fn order_values(left: &Value, right: &Value) -> Ordering {
    let by_kind = kind_rank(left).cmp(&kind_rank(right));
    if by_kind != Ordering::Equal {
        return by_kind;
    }
    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => a.len().cmp(&b.len()).then_with(|| {
            for (x, y) in a.iter().zip(b.iter()) {
                let ord = order_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }),
        (Value::Object(a), Value::Object(b)) => a.len().cmp(&b.len()).then_with(|| {
            for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                let ord = ka.cmp(kb).then_with(|| order_values(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }),
        _ => compare_scalars(left, right).unwrap_or(Ordering::Equal),
    }
}

/// Order optional values for a sort key. Missing values go last in both
/// directions, matching `nulls last` on the rendered SQL.
pub(crate) fn order_for_sort(
    left: Option<&Value>,
    right: Option<&Value>,
    direction: SortDirection,
) -> Ordering {
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match direction {
            SortDirection::Asc => order_values(a, b),
            SortDirection::Desc => order_values(a, b).reverse(),
        },
    }
}

/// Equality as jsonb sees it: numbers compare by value, so `1` equals `1.0`.
pub(crate) fn json_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| json_eq(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| json_eq(x, y)))
        }
        _ => left == right,
    }
}

/// Hashable text for a value under [`json_eq`]. Integral numbers render without
/// a fraction so `1` and `1.0` share a key.
pub(crate) fn canonical_key(value: &Value) -> String {
    normalize_numbers(value).to_string()
}

fn normalize_numbers(value: &Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 => {
                Value::from(f as i64)
            }
            _ => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), normalize_numbers(item)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

pub(crate) fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_dotted_and_bracketed_paths() {
        let path = JsonPath::from("authorDetails[0].email");
        assert_eq!(path.parts(), ["authorDetails", "0", "email"]);
        assert_eq!(path.root(), Some("authorDetails"));
        assert_eq!(path.to_string(), "authorDetails.0.email");
    }

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let doc = json!({"_id": {"date": "2024-01-01"}, "labels": ["a", "b"]});
        assert_eq!(
            JsonPath::from("_id.date").lookup(&doc),
            Some(&json!("2024-01-01"))
        );
        assert_eq!(JsonPath::from("labels[1]").lookup(&doc), Some(&json!("b")));
        assert_eq!(JsonPath::from("labels.x").lookup(&doc), None);
        assert_eq!(JsonPath::from("missing").lookup(&doc), None);
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut doc = json!({"a": 1});
        JsonPath::from("b.c").set(&mut doc, json!(true));
        assert_eq!(doc, json!({"a": 1, "b": {"c": true}}));
    }

    #[test]
    fn missing_sort_values_go_last_in_both_directions() {
        let one = json!(1);
        assert_eq!(
            order_for_sort(None, Some(&one), SortDirection::Asc),
            Ordering::Greater
        );
        assert_eq!(
            order_for_sort(None, Some(&one), SortDirection::Desc),
            Ordering::Greater
        );
        assert_eq!(order_values(&json!("z"), &json!(1)), Ordering::Less);
    }

    #[test]
    fn arrays_order_by_length_before_elements() {
        assert_eq!(order_values(&json!([1, 2, 3]), &json!([9])), Ordering::Greater);
        assert_eq!(order_values(&json!([1, 2]), &json!([1, 3])), Ordering::Less);
    }

    #[test]
    fn numbers_are_equal_by_value() {
        assert!(json_eq(&json!(1), &json!(1.0)));
        assert!(json_eq(&json!({"a": [1, 2.0]}), &json!({"a": [1.0, 2]})));
        assert!(!json_eq(&json!(1), &json!("1")));
        assert_eq!(canonical_key(&json!({"day": 3.0})), canonical_key(&json!({"day": 3})));
        assert_ne!(canonical_key(&json!(1.5)), canonical_key(&json!(1)));
    }
}
