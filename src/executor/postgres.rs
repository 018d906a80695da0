use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    PgPool, Postgres, QueryBuilder,
    postgres::{PgConnectOptions, PgPoolOptions},
};

use super::{FindQuery, QueryExecutor};
use crate::pipeline::{AccumulatorOp, FieldRef, Pipeline, Stage};
use crate::query::sql::{
    check_collection, push_json_expr, push_number_expr, push_predicate, push_text_expr,
    quote_ident, to_char_template,
};
use crate::query::{JsonPath, SortDirection};
use crate::{Result, metrics};

const DEFAULT_SLOW_QUERY: Duration = Duration::from_millis(500);

/// Runs queries against Postgres tables shaped `<collection>(doc jsonb)`.
///
/// Pipelines render to one CTE per stage. Only a trailing sort determines the
/// order of the returned rows.
#[derive(Clone, Debug)]
pub struct PgExecutor {
    pool: PgPool,
    slow_query_threshold: Duration,
}

impl PgExecutor {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::builder(url).build().await
    }

    pub fn builder(url: impl Into<String>) -> PgExecutorBuilder {
        PgExecutorBuilder::new(url)
    }

    /// Wrap an existing pool. Callers are responsible for its session time zone.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            slow_query_threshold: DEFAULT_SLOW_QUERY,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// SQL text a find would run, with `$n` placeholders for the bound values.
    pub fn find_sql(collection: &str, query: &FindQuery) -> Result<String> {
        Ok(find_query(collection, query)?.sql().to_string())
    }

    pub fn pipeline_sql(collection: &str, pipeline: &Pipeline) -> Result<String> {
        Ok(pipeline_query(collection, pipeline)?.sql().to_string())
    }

    async fn fetch_docs(
        &self,
        kind: &'static str,
        mut builder: QueryBuilder<'static, Postgres>,
    ) -> Result<Vec<Value>> {
        let sql_captured = builder.sql().to_string();
        tracing::debug!(target: "kpistore::query", kind, sql = %sql_captured, "executing document query");

        let start = Instant::now();
        let rows = builder
            .build_query_as::<(Value,)>()
            .fetch_all(&self.pool)
            .await;
        let elapsed = start.elapsed();
        metrics::record_query(kind, elapsed);

        let rows = rows.inspect_err(|_| metrics::record_store_error())?;
        if elapsed > self.slow_query_threshold {
            tracing::warn!(target: "kpistore::slow_query", kind, elapsed_ms = elapsed.as_millis() as u64, sql = %sql_captured, "slow document query");
        }
        Ok(rows.into_iter().map(|(doc,)| doc).collect())
    }
}

#[async_trait]
impl QueryExecutor for PgExecutor {
    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Value>> {
        let builder = find_query(collection, query)?;
        self.fetch_docs("find", builder).await
    }

    async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Value>> {
        let builder = pipeline_query(collection, pipeline)?;
        self.fetch_docs("aggregate", builder).await
    }
}

pub struct PgExecutorBuilder {
    url: String,
    max_connections: Option<u32>,
    connect_timeout: Option<Duration>,
    slow_query_threshold: Duration,
    statement_cache_capacity: Option<usize>,
}

impl PgExecutorBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: None,
            connect_timeout: None,
            slow_query_threshold: DEFAULT_SLOW_QUERY,
            statement_cache_capacity: None,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max.max(1));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Queries slower than this are logged at `warn`.
    pub fn slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    pub fn statement_cache_capacity(mut self, size: usize) -> Self {
        self.statement_cache_capacity = Some(size.max(1));
        self
    }

    /// Connect. Sessions run in UTC so date buckets over naive timestamps are stable.
    pub async fn build(self) -> Result<PgExecutor> {
        let mut opts = PgPoolOptions::new();
        if let Some(max) = self.max_connections {
            opts = opts.max_connections(max);
        }
        if let Some(t) = self.connect_timeout {
            opts = opts.acquire_timeout(t);
        }

        let mut connect_opts = self
            .url
            .parse::<PgConnectOptions>()?
            .options([("timezone", "UTC")]);
        if let Some(cap) = self.statement_cache_capacity {
            connect_opts = connect_opts.statement_cache_capacity(cap);
        }
        let pool = opts.connect_with(connect_opts).await?;

        Ok(PgExecutor {
            pool,
            slow_query_threshold: self.slow_query_threshold,
        })
    }
}

pub(crate) fn find_query(
    collection: &str,
    query: &FindQuery,
) -> Result<QueryBuilder<'static, Postgres>> {
    check_collection(collection)?;
    let mut builder = QueryBuilder::new("select doc from ");
    builder.push(quote_ident(collection));
    builder.push(" where ");
    push_predicate(&mut builder, query.predicate());

    if !query.sort().is_empty() {
        builder.push(" order by ");
        let mut first = true;
        for key in query.sort() {
            if !first {
                builder.push(", ");
            }
            first = false;
            push_order(&mut builder, &key.path, key.direction);
        }
    }

    if let Some(limit) = query.limit_value() {
        builder.push(" limit ");
        builder.push_bind(limit);
    }
    Ok(builder)
}

pub(crate) fn pipeline_query(
    collection: &str,
    pipeline: &Pipeline,
) -> Result<QueryBuilder<'static, Postgres>> {
    check_collection(collection)?;
    let (body, trailing_sort) = match pipeline.stages().split_last() {
        Some((Stage::Sort { path, direction }, rest)) => (rest, Some((path, *direction))),
        _ => (pipeline.stages(), None),
    };

    let mut builder = QueryBuilder::new("with s0 as (select doc from ");
    builder.push(quote_ident(collection));
    builder.push(")");
    for (i, stage) in body.iter().enumerate() {
        builder.push(format!(", s{} as (", i + 1));
        push_stage(&mut builder, stage, &format!("s{i}"))?;
        builder.push(")");
    }
    builder.push(format!(" select doc from s{}", body.len()));
    if let Some((path, direction)) = trailing_sort {
        builder.push(" order by ");
        push_order(&mut builder, path, direction);
    }
    Ok(builder)
}

fn push_order(builder: &mut QueryBuilder<'_, Postgres>, path: &JsonPath, direction: SortDirection) {
    push_json_expr(builder, path);
    builder.push(" ");
    builder.push(direction.as_str());
    builder.push(" nulls last");
}

fn push_stage(builder: &mut QueryBuilder<'_, Postgres>, stage: &Stage, prev: &str) -> Result<()> {
    match stage {
        Stage::Match(predicate) => {
            builder.push(format!("select doc from {prev} where "));
            push_predicate(builder, predicate);
        }
        Stage::Join {
            from,
            local_key,
            foreign_key,
            alias,
        } => {
            check_collection(from)?;
            builder.push("select jsonb_set(src.doc, ");
            builder.push_bind(JsonPath::from(alias).parts().to_vec());
            builder.push(", coalesce((select jsonb_agg(f.doc) from ");
            builder.push(quote_ident(from));
            builder.push(" f where f.doc #> ");
            builder.push_bind(foreign_key.parts().to_vec());
            builder.push(" = src.doc #> ");
            builder.push_bind(local_key.parts().to_vec());
            builder.push("), '[]'::jsonb), true) as doc from ");
            builder.push(prev);
            builder.push(" src");
        }
        Stage::DateBucket {
            source,
            format,
            alias,
        } => {
            let template = to_char_template(format)?;
            builder.push("select jsonb_set(doc, ");
            builder.push_bind(JsonPath::from(alias).parts().to_vec());
            builder.push(", coalesce(to_jsonb(case jsonb_typeof(");
            push_json_expr(builder, source);
            builder.push(") when 'number' then to_char(to_timestamp(");
            push_number_expr(builder, source);
            builder.push(" / 1000.0) at time zone 'UTC', ");
            builder.push_bind(template.clone());
            builder.push(") when 'string' then case when pg_input_is_valid(");
            push_text_expr(builder, source);
            builder.push(", 'timestamptz') then to_char((");
            push_text_expr(builder, source);
            builder.push(")::timestamptz at time zone 'UTC', ");
            builder.push_bind(template);
            builder.push(") end end), 'null'::jsonb), true) as doc from ");
            builder.push(prev);
        }
        Stage::Group { by, accumulators } => {
            builder.push("select jsonb_build_object('_id', g.k");
            for acc in accumulators {
                builder.push(", ");
                builder.push_bind(acc.alias.clone());
                builder.push(", ");
                push_accumulator(builder, &acc.op);
            }
            builder.push(") as doc from (select ");
            push_object(builder, by);
            builder.push(" as k, doc from ");
            builder.push(prev);
            builder.push(") g group by g.k");
        }
        Stage::Project(fields) => {
            builder.push("select ");
            push_object(builder, fields);
            builder.push(" as doc from ");
            builder.push(prev);
        }
        Stage::Sort { path, direction } => {
            builder.push(format!("select doc from {prev} order by "));
            push_order(builder, path, *direction);
        }
    }
    Ok(())
}

fn push_object(builder: &mut QueryBuilder<'_, Postgres>, fields: &[FieldRef]) {
    builder.push("jsonb_build_object(");
    let mut first = true;
    for field in fields {
        if !first {
            builder.push(", ");
        }
        first = false;
        builder.push_bind(field.alias.clone());
        builder.push(", ");
        push_json_expr(builder, &field.path);
    }
    builder.push(")");
}

fn push_accumulator(builder: &mut QueryBuilder<'_, Postgres>, op: &AccumulatorOp) {
    match op {
        AccumulatorOp::Count => {
            builder.push("count(*)");
        }
        AccumulatorOp::Sum(path) => {
            builder.push("coalesce(sum(");
            push_number_expr(builder, path);
            builder.push("), 0)");
        }
        AccumulatorOp::Avg(path) => push_numeric_aggregate(builder, "avg", path),
        AccumulatorOp::Min(path) => push_numeric_aggregate(builder, "min", path),
        AccumulatorOp::Max(path) => push_numeric_aggregate(builder, "max", path),
        AccumulatorOp::AddToSet(path) => {
            builder.push("coalesce(jsonb_agg(distinct ");
            push_json_expr(builder, path);
            builder.push(") filter (where ");
            push_json_expr(builder, path);
            builder.push(" is not null), '[]'::jsonb)");
        }
    }
}

fn push_numeric_aggregate(builder: &mut QueryBuilder<'_, Postgres>, func: &str, path: &JsonPath) {
    builder.push(func);
    builder.push("(");
    push_number_expr(builder, path);
    builder.push(")");
}
