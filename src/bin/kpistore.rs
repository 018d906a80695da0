use std::io::Read;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use kpistore::filters::{
    CommonFilterMap, CompositionMode, CriteriaMode, TenantFilterMap, tenant_filters_from_value,
};
use kpistore::pipeline::{DateBound, DateRange};
use kpistore::{AnalyticsRepository, FindQuery, PgExecutor, Settings};
use serde::Deserialize;
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "kpistore", version, about = "kpistore CLI")]
struct Cli {
    /// Settings file (JSON). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Postgres connection string. Falls back to DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compose a filter request (JSON file or stdin) into a predicate tree
    Compose {
        /// Request file; reads stdin when omitted
        request: Option<PathBuf>,

        /// Also print the SQL a find on this collection would run
        #[arg(long)]
        sql: Option<String>,
    },

    /// Commits per day per tenant
    DailyStats {
        #[arg(long = "tenant", action = ArgAction::Append, required = true)]
        tenants: Vec<String>,

        /// Epoch milliseconds or ISO text, matching the stored format
        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,
    },

    /// Create collection tables if missing
    EnsureCollection {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ComposeRequest {
    #[serde(default)]
    common: CommonFilterMap,
    #[serde(default = "no_tenants")]
    tenants: Value,
    #[serde(default)]
    criteria: String,
}

fn no_tenants() -> Value {
    Value::Object(Default::default())
}

impl ComposeRequest {
    fn tenant_filters(&self) -> kpistore::Result<TenantFilterMap> {
        tenant_filters_from_value(self.tenants.clone())
    }
}

#[tokio::main]
async fn main() -> kpistore::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::from_json_file(path)?,
        None => Settings {
            database_url: std::env::var("DATABASE_URL").ok(),
            ..Settings::default()
        },
    };
    if cli.database_url.is_some() {
        settings.database_url = cli.database_url;
    }

    match cli.command {
        Commands::Compose { request, sql } => {
            let raw = match request {
                Some(path) => std::fs::read_to_string(path)?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let request: ComposeRequest = serde_json::from_str(&raw)?;
            let composer = settings.composer().criteria(request.criteria.parse::<CriteriaMode>()?);
            let predicate = composer.compose(
                &request.common,
                &request.tenant_filters()?,
                CompositionMode::IncludeAllTenants,
            )?;
            println!("{}", serde_json::to_string_pretty(&predicate)?);
            if let Some(collection) = sql {
                println!("{}", PgExecutor::find_sql(&collection, &FindQuery::new(predicate))?);
            }
        }
        Commands::DailyStats {
            tenants,
            start,
            end,
        } => {
            let executor = connect(&settings).await?;
            let repo = AnalyticsRepository::from_settings(executor, &settings);
            let range = DateRange::new(date_bound(&start), date_bound(&end));
            let rows = repo.daily_commit_stats(tenants, &range).await?;
            if rows.is_empty() {
                println!("No commits in range.");
            }
            for row in rows {
                println!("{}\t{}\t{}", row.date, row.tenant_id, row.count);
            }
        }
        Commands::EnsureCollection { names } => {
            let executor = connect(&settings).await?;
            for name in names {
                kpistore::testing::ensure_collection(executor.pool(), &name).await?;
                println!("ensured {name}");
            }
        }
    }

    Ok(())
}

async fn connect(settings: &Settings) -> kpistore::Result<PgExecutor> {
    if settings.database_url.is_none() {
        eprintln!("error: --database-url or env DATABASE_URL is required");
        std::process::exit(2);
    }
    settings.executor_builder()?.build().await
}

fn date_bound(raw: &str) -> DateBound {
    raw.parse::<i64>()
        .map(DateBound::from)
        .unwrap_or_else(|_| DateBound::from(raw))
}
