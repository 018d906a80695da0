//! Dashboard-facing reads: compose, execute, then enrich.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::capacity::{CapacityFoldEngine, CapacityKpiData, KanbanCapacity};
use crate::config::{Collections, Settings};
use crate::error::{Error, Result, WithContext};
use crate::executor::{FindQuery, QueryExecutor};
use crate::filters::{
    CommonFilterMap, CompositionMode, CriteriaMode, PredicateComposer, TenantFilterMap,
};
use crate::pipeline::{self, AggregationFields, DateRange, Pipeline, WipCriteria};
use crate::query::Predicate;
use crate::tracing::{QueryTrace, TraceKind};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyCommitCount {
    pub date: String,
    pub tenant_id: String,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorRollup {
    pub tenant_id: String,
    pub author: Option<String>,
    pub commits: u64,
    #[serde(default)]
    pub repositories: Vec<String>,
}

#[derive(Clone)]
struct TraceTarget {
    sink: QueryTrace,
    trace_id: String,
}

/// Read-only access to the dashboard collections through any [`QueryExecutor`].
#[derive(Clone)]
pub struct AnalyticsRepository<E> {
    executor: E,
    composer: PredicateComposer,
    collections: Collections,
    fields: AggregationFields,
    trace: Option<TraceTarget>,
}

impl<E: QueryExecutor> AnalyticsRepository<E> {
    pub fn new(executor: E) -> Self {
        Self::from_settings(executor, &Settings::default())
    }

    pub fn from_settings(executor: E, settings: &Settings) -> Self {
        Self {
            executor,
            composer: settings.composer(),
            collections: settings.collections.clone(),
            fields: settings.aggregation_fields(),
            trace: None,
        }
    }

    /// Record every step of subsequent calls under `trace_id`.
    pub fn with_trace(mut self, sink: QueryTrace, trace_id: impl Into<String>) -> Self {
        self.trace = Some(TraceTarget {
            sink,
            trace_id: trace_id.into(),
        });
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn composer(&self) -> &PredicateComposer {
        &self.composer
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    /// Documents of `collection` matching the composed tenant filters. `mode`
    /// applies to this call only.
    pub async fn find_filtered<T: DeserializeOwned>(
        &self,
        collection: &str,
        common: &CommonFilterMap,
        per_tenant: &TenantFilterMap,
        mode: CriteriaMode,
    ) -> Result<Vec<T>> {
        self.trace(
            TraceKind::Request,
            collection,
            json!({ "common": common.len(), "tenants": per_tenant.len(), "criteria": mode }),
        );
        let predicate = self.composer_for(mode).compose(
            common,
            per_tenant,
            CompositionMode::IncludeAllTenants,
        )?;
        self.trace(TraceKind::Compose, collection, serde_json::to_value(&predicate)?);
        let docs = self.find(collection, FindQuery::new(predicate)).await?;
        decode(docs).context(format!("decoding {collection}"))
    }

    pub async fn sprint_capacity(
        &self,
        common: &CommonFilterMap,
        per_tenant: &TenantFilterMap,
        mode: CriteriaMode,
        fold: &CapacityFoldEngine,
    ) -> Result<Vec<CapacityKpiData>> {
        let docs = self
            .find_filtered(&self.collections.sprint_capacity, common, per_tenant, mode)
            .await?;
        Ok(self.enrich(&self.collections.sprint_capacity, fold, docs))
    }

    pub async fn kanban_capacity(
        &self,
        common: &CommonFilterMap,
        per_tenant: &TenantFilterMap,
        mode: CriteriaMode,
        fold: &CapacityFoldEngine,
    ) -> Result<Vec<KanbanCapacity>> {
        let docs = self
            .find_filtered(&self.collections.kanban_capacity, common, per_tenant, mode)
            .await?;
        Ok(self.enrich(&self.collections.kanban_capacity, fold, docs))
    }

    pub async fn daily_commit_stats<I, S>(
        &self,
        tenant_ids: I,
        range: &DateRange,
    ) -> Result<Vec<DailyCommitCount>>
    where
        I: IntoIterator<Item = S>,
        S: Into<Value>,
    {
        let tenants = self.tenant_predicate(tenant_ids)?;
        let pipeline = pipeline::daily_commit_stats(tenants, range, &self.fields)?;
        let rows = self.aggregate(&self.collections.commits, &pipeline).await?;
        decode(rows).context("decoding daily commit stats")
    }

    /// Commits with matching user documents under `authorDetails`.
    pub async fn commits_with_authors<I, S>(&self, tenant_ids: I) -> Result<Vec<Value>>
    where
        I: IntoIterator<Item = S>,
        S: Into<Value>,
    {
        let tenants = self.tenant_predicate(tenant_ids)?;
        let pipeline = pipeline::author_join(tenants, &self.collections.users, &self.fields)?;
        self.aggregate(&self.collections.commits, &pipeline).await
    }

    pub async fn author_rollup<I, S>(
        &self,
        tenant_ids: I,
        range: &DateRange,
    ) -> Result<Vec<AuthorRollup>>
    where
        I: IntoIterator<Item = S>,
        S: Into<Value>,
    {
        let tenants = self.tenant_predicate(tenant_ids)?;
        let pipeline = pipeline::author_rollup(tenants, range, &self.fields)?;
        let rows = self.aggregate(&self.collections.commits, &pipeline).await?;
        decode(rows).context("decoding author rollup")
    }

    /// Issues in progress at any point of the criteria window.
    pub async fn wip_issues(
        &self,
        common: &CommonFilterMap,
        per_tenant: &TenantFilterMap,
        mode: CriteriaMode,
        criteria: &WipCriteria,
    ) -> Result<Vec<Value>> {
        self.trace(
            TraceKind::Request,
            &self.collections.jira_issues,
            json!({ "tenants": per_tenant.len(), "criteria": mode }),
        );
        let composer = self.composer_for(mode);
        let pipeline = pipeline::wip_aggregation(&composer, common, per_tenant, criteria)?;
        self.aggregate(&self.collections.jira_issues, &pipeline).await
    }

    /// The `n` newest documents of one tenant, newest first.
    pub async fn latest_for_tenant<T: DeserializeOwned>(
        &self,
        collection: &str,
        tenant_id: &str,
        sort_field: &str,
        n: i64,
    ) -> Result<Vec<T>> {
        let query = FindQuery::latest(
            Predicate::eq(self.composer.tenant_field_name(), tenant_id),
            sort_field,
            n,
        )?;
        let docs = self.find(collection, query).await?;
        decode(docs).context(format!("decoding {collection}"))
    }

    fn composer_for(&self, mode: CriteriaMode) -> PredicateComposer {
        self.composer.clone().criteria(mode)
    }

    fn tenant_predicate<I, S>(&self, tenant_ids: I) -> Result<Predicate>
    where
        I: IntoIterator<Item = S>,
        S: Into<Value>,
    {
        let ids: Vec<Value> = tenant_ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Err(Error::MissingTenants);
        }
        Predicate::r#in(self.composer.tenant_field_name(), ids)
    }

    async fn find(&self, collection: &str, query: FindQuery) -> Result<Vec<Value>> {
        let docs = self.executor.find(collection, &query).await?;
        tracing::debug!(target: "kpistore::query", collection, rows = docs.len(), "find returned");
        self.trace(TraceKind::Query, collection, json!({ "rows": docs.len() }));
        Ok(docs)
    }

    async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Value>> {
        self.trace(
            TraceKind::Compose,
            collection,
            json!({ "stages": pipeline.len() }),
        );
        let rows = self.executor.aggregate(collection, pipeline).await?;
        tracing::debug!(target: "kpistore::query", collection, rows = rows.len(), "aggregate returned");
        self.trace(TraceKind::Query, collection, json!({ "rows": rows.len() }));
        Ok(rows)
    }

    fn enrich<D: crate::capacity::CapacityDocument>(
        &self,
        collection: &str,
        fold: &CapacityFoldEngine,
        docs: Vec<D>,
    ) -> Vec<D> {
        let docs = fold.enrich(docs);
        let total: f64 = docs.iter().map(|doc| doc.capacity()).sum();
        tracing::debug!(target: "kpistore::query", collection, documents = docs.len(), total, "folded capacity");
        self.trace(
            TraceKind::Fold,
            collection,
            json!({ "documents": docs.len(), "total": total }),
        );
        docs
    }

    fn trace(&self, kind: TraceKind, component: &str, data: Value) {
        if let Some(target) = &self.trace {
            target.sink.record(&target.trace_id, kind, component, data);
        }
    }
}

fn decode<T: DeserializeOwned>(docs: Vec<Value>) -> Result<Vec<T>> {
    docs.into_iter()
        .map(|doc| serde_json::from_value(doc).map_err(Error::from))
        .collect()
}

/// Per-tenant batch helpers.
pub trait BatchResultExt<T> {
    /// Swap a store failure for an empty result so the rest of a batch can continue.
    /// Caller contract violations still propagate.
    fn or_empty(self, tenant: &str) -> Result<Vec<T>>;
}

impl<T> BatchResultExt<T> for Result<Vec<T>> {
    fn or_empty(self, tenant: &str) -> Result<Vec<T>> {
        match self {
            Ok(rows) => Ok(rows),
            Err(err) if err.is_caller_contract() => Err(err),
            Err(err) => {
                tracing::warn!(target: "kpistore::batch", tenant, error = %err, "query failed, continuing with no rows");
                crate::metrics::record_tenant_skipped();
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_become_empty() {
        let failed: Result<Vec<Value>> = Err(Error::Db(sqlx::Error::PoolTimedOut));
        assert!(failed.or_empty("p1").unwrap().is_empty());

        let contract: Result<Vec<Value>> = Err(Error::MissingTenants);
        assert!(matches!(contract.or_empty("p1"), Err(Error::MissingTenants)));
    }
}
