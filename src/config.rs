use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, WithContext};
use crate::executor::{PgExecutor, PgExecutorBuilder};
use crate::filters::{DEFAULT_TENANT_FIELD, Membership, OperatorTable, PredicateComposer};
use crate::pipeline::AggregationFields;

/// Collection names for the dashboard documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Collections {
    pub commits: String,
    pub users: String,
    pub jira_issues: String,
    pub sprint_capacity: String,
    pub kanban_capacity: String,
}

impl Default for Collections {
    fn default() -> Self {
        Self {
            commits: "commit_details".to_string(),
            users: "user_info".to_string(),
            jira_issues: "jira_issue".to_string(),
            sprint_capacity: "capacity_kpi_data".to_string(),
            kanban_capacity: "kanban_capacity".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub database_url: Option<String>,
    pub tenant_field: String,
    pub collections: Collections,
    pub fields: AggregationFields,
    /// Merged over the default operator table.
    pub operator_overrides: BTreeMap<String, Membership>,
    pub slow_query_ms: u64,
    pub max_connections: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            tenant_field: DEFAULT_TENANT_FIELD.to_string(),
            collections: Collections::default(),
            fields: AggregationFields::default(),
            operator_overrides: BTreeMap::new(),
            slow_query_ms: 500,
            max_connections: None,
        }
    }
}

impl Settings {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings from a JSON file. `DATABASE_URL` wins over the file's URL.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(Error::from)
            .context(format!("reading settings from {}", path.display()))?;
        let mut settings =
            Self::from_json_str(&raw).context(format!("parsing settings from {}", path.display()))?;
        if let Ok(url) = std::env::var("DATABASE_URL") {
            settings.database_url = Some(url);
        }
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.tenant_field.trim().is_empty() {
            return Err(Error::Config("tenantField must not be empty".into()));
        }
        for name in [
            &self.collections.commits,
            &self.collections.users,
            &self.collections.jira_issues,
            &self.collections.sprint_capacity,
            &self.collections.kanban_capacity,
        ] {
            crate::query::sql::check_collection(name).context("collections")?;
        }
        Ok(())
    }

    pub fn operator_table(&self) -> OperatorTable {
        let mut table = OperatorTable::default();
        table.extend(self.operator_overrides.clone());
        table
    }

    pub fn composer(&self) -> PredicateComposer {
        PredicateComposer::new(self.operator_table()).tenant_field(self.tenant_field.as_str())
    }

    /// The tenant field also drives the aggregation pipelines.
    pub fn aggregation_fields(&self) -> AggregationFields {
        AggregationFields {
            tenant: self.tenant_field.clone(),
            ..self.fields.clone()
        }
    }

    pub fn executor_builder(&self) -> Result<PgExecutorBuilder> {
        let url = self
            .database_url
            .clone()
            .ok_or_else(|| Error::Config("databaseUrl or DATABASE_URL is required".into()))?;
        let mut builder =
            PgExecutor::builder(url).slow_query_threshold(Duration::from_millis(self.slow_query_ms));
        if let Some(max) = self.max_connections {
            builder = builder.max_connections(max);
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::CriteriaMode;

    #[test]
    fn overrides_merge_over_default_table() {
        let settings = Settings::from_json_str(
            r#"{"tenantField": "projectId", "operatorOverrides": {"priority": "not_in", "rejectionStatus": "in"}}"#,
        )
        .unwrap();
        let table = settings.operator_table();
        assert_eq!(table.resolve_operator("priority", CriteriaMode::In), Membership::NotIn);
        assert_eq!(table.resolve_operator("rejectionStatus", CriteriaMode::In), Membership::In);
        assert_eq!(table.resolve_operator("rejectionLabel", CriteriaMode::In), Membership::NotIn);
        assert_eq!(settings.composer().tenant_field_name(), "projectId");
        assert_eq!(settings.aggregation_fields().tenant, "projectId");
        assert_eq!(settings.collections, Collections::default());
    }

    #[test]
    fn bad_collection_names_are_rejected() {
        let err = Settings::from_json_str(r#"{"collections": {"commits": "commits; drop"}}"#)
            .unwrap_err();
        assert!(err.is_caller_contract());
        assert!(err.to_string().starts_with("collections:"));
    }

    #[test]
    fn executor_needs_a_url() {
        let err = Settings::default().executor_builder().err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
