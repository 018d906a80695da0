use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use super::{FindQuery, QueryExecutor};
use crate::Result;
use crate::pipeline::{Accumulator, AccumulatorOp, FieldRef, Pipeline, Stage};
use crate::query::sql::check_collection;
use crate::query::{JsonPath, canonical_key, json_eq, order_for_sort};

/// Evaluates predicates and pipelines in process over seeded collections.
///
/// Semantics follow [`PgExecutor`](super::PgExecutor) so tests and offline
/// tooling see the same results as the Postgres-backed store.
#[derive(Clone, Debug, Default)]
pub struct MemoryExecutor {
    collections: HashMap<String, Vec<Value>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append documents to a collection, creating it if needed.
    pub fn with_collection<I>(mut self, name: impl Into<String>, docs: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.collections.entry(name.into()).or_default().extend(docs);
        self
    }

    pub fn collection(&self, name: &str) -> &[Value] {
        self.collections.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn run_find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Value>> {
        check_collection(collection)?;
        let mut docs: Vec<Value> = self
            .collection(collection)
            .iter()
            .filter(|doc| query.predicate().matches(doc))
            .cloned()
            .collect();
        if !query.sort().is_empty() {
            docs.sort_by(|a, b| {
                query.sort().iter().fold(Ordering::Equal, |ord, key| {
                    ord.then_with(|| {
                        order_for_sort(key.path.lookup(a), key.path.lookup(b), key.direction)
                    })
                })
            });
        }
        if let Some(limit) = query.limit_value() {
            docs.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        Ok(docs)
    }

    pub fn run_pipeline(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Value>> {
        check_collection(collection)?;
        let mut docs = self.collection(collection).to_vec();
        for stage in pipeline.stages() {
            docs = self.apply(stage, docs);
        }
        Ok(docs)
    }

    fn apply(&self, stage: &Stage, mut docs: Vec<Value>) -> Vec<Value> {
        match stage {
            Stage::Match(predicate) => {
                docs.retain(|doc| predicate.matches(doc));
                docs
            }
            Stage::Join {
                from,
                local_key,
                foreign_key,
                alias,
            } => {
                let foreign = self.collection(from);
                let target = JsonPath::from(alias);
                for doc in docs.iter_mut() {
                    let joined: Vec<Value> = match local_key.lookup(doc) {
                        Some(local) => foreign
                            .iter()
                            .filter(|candidate| {
                                foreign_key
                                    .lookup(candidate)
                                    .is_some_and(|key| json_eq(key, local))
                            })
                            .cloned()
                            .collect(),
                        None => Vec::new(),
                    };
                    target.set(doc, Value::Array(joined));
                }
                docs
            }
            Stage::DateBucket {
                source,
                format,
                alias,
            } => {
                let target = JsonPath::from(alias);
                for doc in docs.iter_mut() {
                    let bucket = source
                        .lookup(doc)
                        .and_then(parse_timestamp)
                        .map(|ts| Value::String(ts.format(format).to_string()))
                        .unwrap_or(Value::Null);
                    target.set(doc, bucket);
                }
                docs
            }
            Stage::Group { by, accumulators } => group(&docs, by, accumulators),
            Stage::Project(fields) => docs.iter().map(|doc| project(doc, fields)).collect(),
            Stage::Sort { path, direction } => {
                docs.sort_by(|a, b| order_for_sort(path.lookup(a), path.lookup(b), *direction));
                docs
            }
        }
    }
}

#[async_trait]
impl QueryExecutor for MemoryExecutor {
    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Value>> {
        self.run_find(collection, query)
    }

    async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Value>> {
        self.run_pipeline(collection, pipeline)
    }
}

fn project(doc: &Value, fields: &[FieldRef]) -> Value {
    let mut out = Map::with_capacity(fields.len());
    for field in fields {
        out.insert(
            field.alias.clone(),
            field.path.lookup(doc).cloned().unwrap_or(Value::Null),
        );
    }
    Value::Object(out)
}

fn group(docs: &[Value], by: &[FieldRef], accumulators: &[Accumulator]) -> Vec<Value> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Value, Vec<&Value>)> = Vec::new();

    for doc in docs {
        let key = project(doc, by);
        let slot = *index.entry(canonical_key(&key)).or_insert_with(|| {
            groups.push((key.clone(), Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(doc);
    }

    groups
        .into_iter()
        .map(|(key, members)| {
            let mut out = Map::with_capacity(accumulators.len() + 1);
            out.insert("_id".to_string(), key);
            for acc in accumulators {
                out.insert(acc.alias.clone(), accumulate(&acc.op, &members));
            }
            Value::Object(out)
        })
        .collect()
}

fn accumulate(op: &AccumulatorOp, members: &[&Value]) -> Value {
    let numbers = |path: &JsonPath| -> Vec<f64> {
        members
            .iter()
            .filter_map(|doc| path.lookup(doc).and_then(Value::as_f64))
            .collect()
    };
    match op {
        AccumulatorOp::Count => Value::from(members.len() as u64),
        AccumulatorOp::Sum(path) => Value::from(numbers(path).into_iter().fold(0.0, |a, b| a + b)),
        AccumulatorOp::Avg(path) => {
            let values = numbers(path);
            if values.is_empty() {
                Value::Null
            } else {
                Value::from(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        AccumulatorOp::Min(path) => numbers(path)
            .into_iter()
            .reduce(f64::min)
            .map_or(Value::Null, Value::from),
        AccumulatorOp::Max(path) => numbers(path)
            .into_iter()
            .reduce(f64::max)
            .map_or(Value::Null, Value::from),
        AccumulatorOp::AddToSet(path) => {
            let mut set: Vec<Value> = Vec::new();
            for value in members.iter().filter_map(|doc| path.lookup(doc)) {
                if !set.iter().any(|seen| json_eq(seen, value)) {
                    set.push(value.clone());
                }
            }
            Value::Array(set)
        }
    }
}

/// Epoch milliseconds, RFC 3339 text, or naive ISO date/time text read as UTC.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|ts| ts.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|ts| ts.and_utc())
            })
            .or_else(|| {
                NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .ok()
                    .and_then(|day| day.and_hms_opt(0, 0, 0))
                    .map(|ts| ts.and_utc())
            }),
        _ => None,
    }
}
