//! Execution boundary between composed queries and the document store.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::pipeline::Pipeline;
use crate::query::{JsonPath, Predicate, SortDirection};
use crate::{Error, Result};

mod memory;
mod postgres;

pub use memory::MemoryExecutor;
pub use postgres::{PgExecutor, PgExecutorBuilder};

/// Runs composed predicates and pipelines against a collection.
///
/// Implementations must be safe for concurrent read-only use. Store failures are
/// returned as-is; retry policy belongs to the caller.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Value>>;

    async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Value>>;
}

#[async_trait]
impl<E> QueryExecutor for std::sync::Arc<E>
where
    E: QueryExecutor + ?Sized,
{
    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Value>> {
        (**self).find(collection, query).await
    }

    async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Value>> {
        (**self).aggregate(collection, pipeline).await
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SortKey {
    pub path: JsonPath,
    pub direction: SortDirection,
}

/// A predicate query with optional ordering and limit.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FindQuery {
    predicate: Predicate,
    sort: Vec<SortKey>,
    limit: Option<i64>,
}

impl FindQuery {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            sort: Vec::new(),
            limit: None,
        }
    }

    /// The `n` most recent documents by `field`. `n` must be positive.
    pub fn latest(predicate: Predicate, field: impl Into<JsonPath>, n: i64) -> Result<Self> {
        Self::new(predicate)
            .order_by(field, SortDirection::Desc)
            .limit(n)
    }

    pub fn order_by(mut self, path: impl Into<JsonPath>, direction: SortDirection) -> Self {
        self.sort.push(SortKey {
            path: path.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: i64) -> Result<Self> {
        if limit <= 0 {
            return Err(Error::InvalidLimit(limit));
        }
        self.limit = Some(limit);
        Ok(self)
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn sort(&self) -> &[SortKey] {
        &self.sort
    }

    pub fn limit_value(&self) -> Option<i64> {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_rejects_non_positive_limits() {
        assert!(matches!(
            FindQuery::latest(Predicate::all(), "commitTimestamp", 0),
            Err(Error::InvalidLimit(0))
        ));
        assert!(matches!(
            FindQuery::latest(Predicate::all(), "commitTimestamp", -3),
            Err(Error::InvalidLimit(-3))
        ));
        let query = FindQuery::latest(Predicate::all(), "commitTimestamp", 5).unwrap();
        assert_eq!(query.limit_value(), Some(5));
        assert_eq!(query.sort()[0].direction, SortDirection::Desc);
    }
}
