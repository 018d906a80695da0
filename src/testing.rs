use serde_json::Value;
use sqlx::{Pool, Postgres, QueryBuilder};

use crate::Result;
use crate::query::sql::{check_collection, quote_ident};

/// Create `<name>(id bigserial, doc jsonb)` plus a GIN index on `doc` if missing.
pub async fn ensure_collection(pool: &Pool<Postgres>, name: &str) -> Result<()> {
    check_collection(name)?;
    let table = quote_ident(name);
    sqlx::query(&format!(
        "create table if not exists {table} (id bigserial primary key, doc jsonb not null)"
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "create index if not exists {} on {table} using gin (doc jsonb_path_ops)",
        quote_ident(&format!("{name}_doc_gin"))
    ))
    .execute(pool)
    .await?;
    Ok(())
}

/// Insert documents in one statement. Returns the number of rows written.
pub async fn insert_documents<I>(pool: &Pool<Postgres>, name: &str, docs: I) -> Result<u64>
where
    I: IntoIterator<Item = Value>,
{
    check_collection(name)?;
    let docs: Vec<Value> = docs.into_iter().collect();
    if docs.is_empty() {
        return Ok(0);
    }
    let mut builder = QueryBuilder::<Postgres>::new("insert into ");
    builder.push(quote_ident(name));
    builder.push(" (doc) ");
    builder.push_values(docs, |mut row, doc| {
        row.push_bind(doc);
    });
    let done = builder.build().execute(pool).await?;
    Ok(done.rows_affected())
}

/// Drop every row of a collection.
pub async fn truncate_collection(pool: &Pool<Postgres>, name: &str) -> Result<()> {
    check_collection(name)?;
    sqlx::query(&format!("truncate {}", quote_ident(name)))
        .execute(pool)
        .await?;
    Ok(())
}
