//! Staged aggregation pipelines.
//!
//! A [`Pipeline`] is an ordered list of stages executed left to right by a
//! [`QueryExecutor`](crate::executor::QueryExecutor), each stage consuming the
//! previous stage's output shape.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::filters::{CommonFilterMap, CompositionMode, PredicateComposer, TenantFilterMap};
use crate::query::sql::{check_collection, to_char_template};
use crate::query::{JsonPath, Predicate, SortDirection};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulatorOp {
    Count,
    Sum(JsonPath),
    Avg(JsonPath),
    Min(JsonPath),
    Max(JsonPath),
    AddToSet(JsonPath),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Accumulator {
    pub alias: String,
    pub op: AccumulatorOp,
}

impl Accumulator {
    pub fn count(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            op: AccumulatorOp::Count,
        }
    }

    pub fn sum(alias: impl Into<String>, path: impl Into<JsonPath>) -> Self {
        Self {
            alias: alias.into(),
            op: AccumulatorOp::Sum(path.into()),
        }
    }

    pub fn avg(alias: impl Into<String>, path: impl Into<JsonPath>) -> Self {
        Self {
            alias: alias.into(),
            op: AccumulatorOp::Avg(path.into()),
        }
    }

    pub fn min(alias: impl Into<String>, path: impl Into<JsonPath>) -> Self {
        Self {
            alias: alias.into(),
            op: AccumulatorOp::Min(path.into()),
        }
    }

    pub fn max(alias: impl Into<String>, path: impl Into<JsonPath>) -> Self {
        Self {
            alias: alias.into(),
            op: AccumulatorOp::Max(path.into()),
        }
    }

    pub fn add_to_set(alias: impl Into<String>, path: impl Into<JsonPath>) -> Self {
        Self {
            alias: alias.into(),
            op: AccumulatorOp::AddToSet(path.into()),
        }
    }
}

/// Named value copied from an input document, used by group keys and projections.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldRef {
    pub alias: String,
    pub path: JsonPath,
}

impl FieldRef {
    pub fn new(alias: impl Into<String>, path: impl Into<JsonPath>) -> Self {
        Self {
            alias: alias.into(),
            path: path.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Match(Predicate),
    /// Attach every document of `from` whose `foreign_key` equals the input's
    /// `local_key`, as an array under `alias`.
    Join {
        from: String,
        local_key: JsonPath,
        foreign_key: JsonPath,
        alias: String,
    },
    /// Format the timestamp at `source` (epoch millis or ISO-8601 text) into `alias`.
    DateBucket {
        source: JsonPath,
        format: String,
        alias: String,
    },
    /// Output documents are shaped `{_id: {<key aliases>}, <accumulator aliases>}`.
    Group {
        by: Vec<FieldRef>,
        accumulators: Vec<Accumulator>,
    },
    Project(Vec<FieldRef>),
    Sort {
        path: JsonPath,
        direction: SortDirection,
    },
}

impl Stage {
    /// Whether a match reading only `roots` returns the same documents when run
    /// before this stage instead of after it.
    fn commutes_with_match(&self, roots: &BTreeSet<String>) -> bool {
        match self {
            Stage::Sort { .. } => true,
            Stage::Join { alias, .. } | Stage::DateBucket { alias, .. } => JsonPath::from(alias)
                .root()
                .is_none_or(|root| !roots.contains(root)),
            Stage::Match(_) | Stage::Group { .. } | Stage::Project(_) => false,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Stage::Join { from, alias, .. } => {
                check_collection(from)?;
                top_level_alias(alias)
            }
            Stage::DateBucket { format, alias, .. } => {
                to_char_template(format)?;
                top_level_alias(alias)
            }
            Stage::Group { by, accumulators } => {
                if accumulators.is_empty() {
                    return Err(Error::EmptyAccumulators);
                }
                by.iter()
                    .map(|key| key.alias.as_str())
                    .chain(accumulators.iter().map(|acc| acc.alias.as_str()))
                    .try_for_each(non_empty_alias)
            }
            Stage::Project(fields) => fields
                .iter()
                .try_for_each(|field| non_empty_alias(&field.alias)),
            Stage::Match(_) | Stage::Sort { .. } => Ok(()),
        }
    }
}

fn non_empty_alias(alias: &str) -> Result<()> {
    if alias.trim().is_empty() {
        Err(Error::invalid_predicate(alias, "output alias is empty"))
    } else {
        Ok(())
    }
}

/// Stages that write into the input document only add top-level fields.
fn top_level_alias(alias: &str) -> Result<()> {
    non_empty_alias(alias)?;
    if JsonPath::from(alias).parts().len() == 1 {
        Ok(())
    } else {
        Err(Error::invalid_predicate(alias, "must name a top-level field"))
    }
}

/// Validated, ordered stage list.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct StagedAggregationBuilder {
    stages: Vec<Stage>,
}

impl StagedAggregationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_stages(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn match_on(mut self, predicate: Predicate) -> Self {
        self.stages.push(Stage::Match(predicate));
        self
    }

    pub fn join(
        mut self,
        from: impl Into<String>,
        local_key: impl Into<JsonPath>,
        foreign_key: impl Into<JsonPath>,
        alias: impl Into<String>,
    ) -> Self {
        self.stages.push(Stage::Join {
            from: from.into(),
            local_key: local_key.into(),
            foreign_key: foreign_key.into(),
            alias: alias.into(),
        });
        self
    }

    pub fn date_bucket(
        mut self,
        source: impl Into<JsonPath>,
        format: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        self.stages.push(Stage::DateBucket {
            source: source.into(),
            format: format.into(),
            alias: alias.into(),
        });
        self
    }

    pub fn group(mut self, by: Vec<FieldRef>, accumulators: Vec<Accumulator>) -> Self {
        self.stages.push(Stage::Group { by, accumulators });
        self
    }

    pub fn project(mut self, fields: Vec<FieldRef>) -> Self {
        self.stages.push(Stage::Project(fields));
        self
    }

    pub fn sort(mut self, path: impl Into<JsonPath>, direction: SortDirection) -> Self {
        self.stages.push(Stage::Sort {
            path: path.into(),
            direction,
        });
        self
    }

    /// Validate every stage and move each match ahead of earlier stages it does
    /// not depend on. `Group` and `Project` are never crossed and matches keep
    /// their relative order.
    pub fn build(self) -> Result<Pipeline> {
        self.stages.iter().try_for_each(Stage::validate)?;

        let mut ordered: Vec<Stage> = Vec::with_capacity(self.stages.len());
        for stage in self.stages {
            let position = match &stage {
                Stage::Match(predicate) => {
                    let roots = predicate.root_fields();
                    let mut position = ordered.len();
                    while position > 0 && ordered[position - 1].commutes_with_match(&roots) {
                        position -= 1;
                    }
                    position
                }
                _ => ordered.len(),
            };
            ordered.insert(position, stage);
        }
        Ok(Pipeline { stages: ordered })
    }
}

/// Build a pipeline from an explicit stage list.
pub fn build(stages: Vec<Stage>) -> Result<Pipeline> {
    StagedAggregationBuilder::from_stages(stages).build()
}

/// A date bound in whichever representation the target collection stores.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DateBound {
    EpochMillis(i64),
    Iso(String),
}

impl From<i64> for DateBound {
    fn from(value: i64) -> Self {
        DateBound::EpochMillis(value)
    }
}

impl From<&str> for DateBound {
    fn from(value: &str) -> Self {
        DateBound::Iso(value.to_string())
    }
}

impl From<String> for DateBound {
    fn from(value: String) -> Self {
        DateBound::Iso(value)
    }
}

impl From<DateBound> for Value {
    fn from(value: DateBound) -> Self {
        match value {
            DateBound::EpochMillis(ms) => Value::from(ms),
            DateBound::Iso(text) => Value::from(text),
        }
    }
}

/// Inclusive time window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateBound,
    pub end: DateBound,
}

impl DateRange {
    pub fn new(start: impl Into<DateBound>, end: impl Into<DateBound>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn predicate(&self, field: impl Into<JsonPath>) -> Result<Predicate> {
        Predicate::range(field, self.start.clone(), self.end.clone())
    }
}

/// Stored field names read by the convenience pipelines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregationFields {
    pub tenant: String,
    pub timestamp: String,
    pub author: String,
    pub repository: String,
}

impl Default for AggregationFields {
    fn default() -> Self {
        Self {
            tenant: crate::filters::DEFAULT_TENANT_FIELD.to_string(),
            timestamp: "commitTimestamp".to_string(),
            author: "authorId".to_string(),
            repository: "repositoryName".to_string(),
        }
    }
}

/// Commits per day per tenant, ascending by day.
pub fn daily_commit_stats(
    tenant_predicate: Predicate,
    range: &DateRange,
    fields: &AggregationFields,
) -> Result<Pipeline> {
    StagedAggregationBuilder::new()
        .match_on(Predicate::and(vec![
            tenant_predicate,
            range.predicate(fields.timestamp.as_str())?,
        ]))
        .date_bucket(fields.timestamp.as_str(), "%Y-%m-%d", "date")
        .group(
            vec![
                FieldRef::new("date", "date"),
                FieldRef::new("tenantId", fields.tenant.as_str()),
            ],
            vec![Accumulator::count("count")],
        )
        .project(vec![
            FieldRef::new("date", "_id.date"),
            FieldRef::new("tenantId", "_id.tenantId"),
            FieldRef::new("count", "count"),
        ])
        .sort("date", SortDirection::Asc)
        .build()
}

/// Commits with their author documents attached under `authorDetails`.
pub fn author_join(
    tenant_predicate: Predicate,
    users_collection: &str,
    fields: &AggregationFields,
) -> Result<Pipeline> {
    StagedAggregationBuilder::new()
        .match_on(tenant_predicate)
        .join(users_collection, fields.author.as_str(), "id", "authorDetails")
        .build()
}

/// Commit count and repositories touched per tenant and author, busiest first.
pub fn author_rollup(
    tenant_predicate: Predicate,
    range: &DateRange,
    fields: &AggregationFields,
) -> Result<Pipeline> {
    StagedAggregationBuilder::new()
        .match_on(Predicate::and(vec![
            tenant_predicate,
            range.predicate(fields.timestamp.as_str())?,
        ]))
        .group(
            vec![
                FieldRef::new("tenantId", fields.tenant.as_str()),
                FieldRef::new("author", fields.author.as_str()),
            ],
            vec![
                Accumulator::count("commits"),
                Accumulator::add_to_set("repositories", fields.repository.as_str()),
            ],
        )
        .project(vec![
            FieldRef::new("tenantId", "_id.tenantId"),
            FieldRef::new("author", "_id.author"),
            FieldRef::new("commits", "commits"),
            FieldRef::new("repositories", "repositories"),
        ])
        .sort("commits", SortDirection::Desc)
        .build()
}

/// Status lists for one tenant's WIP calculation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WipStatuses {
    pub wip: Vec<String>,
    pub closed: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WipCriteria {
    pub window: DateRange,
    #[serde(default = "default_status_field")]
    pub status_field: String,
    #[serde(default = "default_activity_field")]
    pub activity_field: String,
    pub statuses: BTreeMap<String, WipStatuses>,
}

fn default_status_field() -> String {
    "status".to_string()
}

fn default_activity_field() -> String {
    "updateDate".to_string()
}

impl WipCriteria {
    pub fn new(window: DateRange) -> Self {
        Self {
            window,
            status_field: default_status_field(),
            activity_field: default_activity_field(),
            statuses: BTreeMap::new(),
        }
    }

    pub fn tenant(mut self, tenant: impl Into<String>, statuses: WipStatuses) -> Self {
        self.statuses.insert(tenant.into(), statuses);
        self
    }

    /// `(in WIP, not closed, active by window end) OR (closed inside the window)`.
    ///
    /// An issue satisfying both branches is still counted once: it was touched
    /// during the window either way.
    fn tenant_branches(&self, tenant: &str) -> Result<Predicate> {
        let statuses = self
            .statuses
            .get(tenant)
            .ok_or_else(|| Error::MissingTenantCriteria(tenant.to_string()))?;
        let status = self.status_field.as_str();
        let activity = self.activity_field.as_str();
        let mut branches = Vec::with_capacity(2);

        if !statuses.wip.is_empty() {
            let mut open = vec![
                Predicate::r#in(status, statuses.wip.iter().cloned())?,
                Predicate::lte(activity, self.window.end.clone())?,
            ];
            if !statuses.closed.is_empty() {
                open.insert(1, Predicate::not_in(status, statuses.closed.iter().cloned())?);
            }
            branches.push(Predicate::and(open));
        }
        if !statuses.closed.is_empty() {
            branches.push(Predicate::and(vec![
                Predicate::r#in(status, statuses.closed.iter().cloned())?,
                self.window.predicate(activity)?,
            ]));
        }
        Ok(Predicate::or(branches))
    }
}

/// Issues that were work in progress at some point during the window, per tenant.
pub fn wip_aggregation(
    composer: &PredicateComposer,
    common: &CommonFilterMap,
    per_tenant: &TenantFilterMap,
    criteria: &WipCriteria,
) -> Result<Pipeline> {
    if per_tenant.is_empty() {
        return Err(Error::MissingTenants);
    }
    let predicate = composer.compose_with(
        common,
        per_tenant,
        CompositionMode::IncludeAllTenants,
        |tenant, group| {
            group.push(criteria.tenant_branches(tenant)?);
            Ok(())
        },
    )?;
    StagedAggregationBuilder::new().match_on(predicate).build()
}
