//! Postgres rendering of predicates over a `doc jsonb` column.
//!
//! Every leaf renders to a non-null boolean so `not (...)` behaves like the
//! in-process evaluator instead of SQL's three-valued logic.

use serde_json::Value;
use sqlx::{Postgres, QueryBuilder, types::Json};

use super::{FieldPredicate, JsonPath, Operator, Predicate};
use crate::{Error, Result};

pub(crate) fn push_predicate(builder: &mut QueryBuilder<'_, Postgres>, predicate: &Predicate) {
    match predicate {
        Predicate::Field(leaf) => push_field(builder, leaf),
        Predicate::Exists(path) => {
            builder.push("(coalesce(jsonb_typeof(");
            push_json_expr(builder, path);
            builder.push("), 'null') <> 'null')");
        }
        Predicate::And(predicates) => push_joined(builder, predicates, " and ", "true"),
        Predicate::Or(predicates) => push_joined(builder, predicates, " or ", "false"),
        Predicate::Not(inner) => {
            builder.push("not (");
            push_predicate(builder, inner);
            builder.push(")");
        }
    }
}

fn push_joined(
    builder: &mut QueryBuilder<'_, Postgres>,
    predicates: &[Predicate],
    separator: &str,
    empty: &str,
) {
    if predicates.is_empty() {
        builder.push(empty);
        return;
    }
    builder.push("(");
    let mut iter = predicates.iter();
    if let Some(first) = iter.next() {
        push_predicate(builder, first);
    }
    for predicate in iter {
        builder.push(separator);
        push_predicate(builder, predicate);
    }
    builder.push(")");
}

fn push_field(builder: &mut QueryBuilder<'_, Postgres>, leaf: &FieldPredicate) {
    let path = leaf.field();
    let values = leaf.values();
    match leaf.op() {
        Operator::In | Operator::Equals => push_membership(builder, path, values),
        Operator::NotIn => {
            builder.push("not ");
            push_membership(builder, path, values);
        }
        Operator::Gte => push_comparison(builder, path, &values[0], ">="),
        Operator::Lte => push_comparison(builder, path, &values[0], "<="),
        Operator::Range => {
            builder.push("(");
            push_comparison(builder, path, &values[0], ">=");
            builder.push(" and ");
            push_comparison(builder, path, &values[1], "<=");
            builder.push(")");
        }
    }
}

/// Scalar membership, or any-element membership when the stored field is an array.
fn push_membership(builder: &mut QueryBuilder<'_, Postgres>, path: &JsonPath, values: &[Value]) {
    builder.push("coalesce((");
    push_json_expr(builder, path);
    builder.push(" in (");
    push_json_list(builder, values);
    builder.push(") or (jsonb_typeof(");
    push_json_expr(builder, path);
    builder.push(") = 'array' and exists (select 1 from jsonb_array_elements(");
    push_json_expr(builder, path);
    builder.push(") as elem(v) where elem.v in (");
    push_json_list(builder, values);
    builder.push("))), false)");
}

fn push_json_list(builder: &mut QueryBuilder<'_, Postgres>, values: &[Value]) {
    let mut separated = builder.separated(", ");
    for value in values {
        separated.push_bind(Json(value.clone()));
    }
}

fn push_comparison(
    builder: &mut QueryBuilder<'_, Postgres>,
    path: &JsonPath,
    bound: &Value,
    op: &str,
) {
    match bound {
        Value::Number(n) => {
            builder.push("coalesce(");
            push_number_expr(builder, path);
            builder.push(" ");
            builder.push(op);
            builder.push(" ");
            builder.push_bind(n.as_f64().unwrap_or_default());
            builder.push(", false)");
        }
        Value::String(s) => {
            builder.push("coalesce((case when jsonb_typeof(");
            push_json_expr(builder, path);
            builder.push(") = 'string' then ");
            push_text_expr(builder, path);
            builder.push(" end) collate \"C\" ");
            builder.push(op);
            builder.push(" ");
            builder.push_bind(s.clone());
            builder.push(", false)");
        }
        _ => {
            builder.push("false");
        }
    }
}

pub(crate) fn push_json_expr(builder: &mut QueryBuilder<'_, Postgres>, path: &JsonPath) {
    builder.push("doc #> ");
    builder.push_bind(path.parts().to_vec());
}

pub(crate) fn push_text_expr(builder: &mut QueryBuilder<'_, Postgres>, path: &JsonPath) {
    builder.push("doc #>> ");
    builder.push_bind(path.parts().to_vec());
}

/// `float8` value of a numeric field, null for anything else.
pub(crate) fn push_number_expr(builder: &mut QueryBuilder<'_, Postgres>, path: &JsonPath) {
    builder.push("(case when jsonb_typeof(");
    push_json_expr(builder, path);
    builder.push(") = 'number' then (");
    push_text_expr(builder, path);
    builder.push(")::float8 end)");
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Collections map to tables, so their names must be plain identifiers.
pub(crate) fn check_collection(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidCollection(name.to_string()))
    }
}

/// Translate a strftime-style bucket format into a Postgres `to_char` template.
/// Literal text is double-quoted so letters are never read as template patterns.
pub(crate) fn to_char_template(format: &str) -> Result<String> {
    let mut out = String::new();
    let mut literal = String::new();
    let mut chars = format.chars();

    let flush = |out: &mut String, literal: &mut String| {
        if !literal.is_empty() {
            out.push('"');
            out.push_str(&literal.replace('"', "\\\""));
            out.push('"');
            literal.clear();
        }
    };

    while let Some(ch) = chars.next() {
        if ch != '%' {
            literal.push(ch);
            continue;
        }
        let pattern = match chars.next() {
            Some('Y') => "YYYY",
            Some('m') => "MM",
            Some('d') => "DD",
            Some('H') => "HH24",
            Some('M') => "MI",
            Some('S') => "SS",
            Some('G') => "IYYY",
            Some('V') => "IW",
            Some('%') => {
                literal.push('%');
                continue;
            }
            _ => return Err(Error::UnsupportedDateFormat(format.to_string())),
        };
        flush(&mut out, &mut literal);
        out.push_str(pattern);
    }
    flush(&mut out, &mut literal);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(predicate: &Predicate) -> String {
        let mut builder = QueryBuilder::<Postgres>::new("select doc from commits where ");
        push_predicate(&mut builder, predicate);
        builder.sql().to_string()
    }

    #[test]
    fn empty_groups_render_as_constants() {
        assert_eq!(render(&Predicate::all()), "select doc from commits where true");
        assert_eq!(
            render(&Predicate::or(vec![])),
            "select doc from commits where false"
        );
    }

    #[test]
    fn not_in_negates_null_safe_membership() {
        let sql = render(&Predicate::not_in("labels", ["rejected"]).unwrap());
        assert!(sql.starts_with("select doc from commits where not coalesce((doc #> $1 in ($2)"));
        assert!(sql.contains("jsonb_array_elements(doc #> $4) as elem(v) where elem.v in ($5)"));
    }

    #[test]
    fn numeric_range_binds_both_bounds() {
        let sql = render(&Predicate::range("commitTimestamp", 1, 2).unwrap());
        assert!(sql.contains(">= $3"));
        assert!(sql.contains("<= $6"));
    }

    #[test]
    fn bucket_formats_translate_to_templates() {
        assert_eq!(to_char_template("%Y-%m-%d").unwrap(), "YYYY\"-\"MM\"-\"DD");
        assert_eq!(to_char_template("%G-W%V").unwrap(), "IYYY\"-W\"IW");
        assert!(matches!(
            to_char_template("%Q"),
            Err(Error::UnsupportedDateFormat(_))
        ));
    }

    #[test]
    fn collection_names_must_be_identifiers() {
        assert!(check_collection("commit_details").is_ok());
        assert!(check_collection("users; drop table x").is_err());
        assert!(check_collection("").is_err());
    }
}
