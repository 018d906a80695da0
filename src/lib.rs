//! kpistore: per-tenant filter composition and staged aggregation over a JSONB document store.

pub mod capacity;
pub mod config;
mod error;
pub mod executor;
pub mod filters;
pub mod metrics;
pub mod pipeline;
pub mod query;
pub mod repository;
pub mod testing;
pub mod tracing;

pub use capacity::{CapacityFoldEngine, CapacityKpiData, KanbanCapacity};
pub use config::Settings;
pub use error::{Error, Result, WithContext};
pub use executor::{FindQuery, MemoryExecutor, PgExecutor, QueryExecutor};
pub use filters::{CriteriaMode, OperatorTable, PredicateComposer};
pub use pipeline::{Pipeline, StagedAggregationBuilder};
pub use query::{FieldPredicate, Predicate};
pub use repository::{AnalyticsRepository, BatchResultExt};

pub mod prelude {
    pub use crate::filters::{CommonFilterMap, CompositionMode, TenantFilterMap};
    pub use crate::pipeline::{DateRange, WipCriteria, WipStatuses};
    pub use crate::{
        AnalyticsRepository, BatchResultExt, CapacityFoldEngine, FindQuery, Predicate,
        PredicateComposer, QueryExecutor, Result,
    };
}
