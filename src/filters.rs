//! Per-tenant filter composition.
//!
//! A batch of tenants shares one set of common filters while every tenant may
//! carry its own field constraints. The composer folds both into
//! `common AND (tenant1 OR tenant2 OR ...)`.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::{FieldPredicate, Operator, Predicate, kind_name};
use crate::{Error, Result};

/// Filters applied identically to every tenant. Empty lists add no constraint.
pub type CommonFilterMap = BTreeMap<String, Vec<Value>>;

/// Tenant id to raw per-field filter values. Each value must be a JSON array.
pub type TenantFilterMap = BTreeMap<String, BTreeMap<String, Value>>;

/// Stored field carrying the tenant (project configuration) id.
pub const DEFAULT_TENANT_FIELD: &str = "basicProjectConfigId";

/// Caller-selected membership mode. `Nin` inverts every tenant field.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriteriaMode {
    #[default]
    In,
    Nin,
}

impl FromStr for CriteriaMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "in" => Ok(CriteriaMode::In),
            "nin" => Ok(CriteriaMode::Nin),
            _ => Err(Error::UnknownCriteriaMode(s.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    In,
    NotIn,
}

impl From<Membership> for Operator {
    fn from(value: Membership) -> Self {
        match value {
            Membership::In => Operator::In,
            Membership::NotIn => Operator::NotIn,
        }
    }
}

/// Field name to default membership. Fields not listed resolve to `In`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorTable {
    fields: BTreeMap<String, Membership>,
}

impl Default for OperatorTable {
    fn default() -> Self {
        let fields = ["rejectionLabel", "rejectionResolution", "rejectionStatus"]
            .into_iter()
            .map(|field| (field.to_string(), Membership::NotIn))
            .collect();
        Self { fields }
    }
}

impl OperatorTable {
    /// A table with no field overrides.
    pub fn empty() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, membership: Membership) -> Self {
        self.fields.insert(field.into(), membership);
        self
    }

    pub fn extend(&mut self, overrides: impl IntoIterator<Item = (String, Membership)>) {
        self.fields.extend(overrides);
    }

    pub fn resolve_operator(&self, field: &str, mode: CriteriaMode) -> Membership {
        match mode {
            CriteriaMode::Nin => Membership::NotIn,
            CriteriaMode::In => self.fields.get(field).copied().unwrap_or(Membership::In),
        }
    }
}

/// How tenants in a batch are combined. Every tenant in the map gets a branch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CompositionMode {
    #[default]
    IncludeAllTenants,
}

#[derive(Clone, Debug)]
pub struct PredicateComposer {
    table: OperatorTable,
    tenant_field: String,
    criteria: CriteriaMode,
}

impl Default for PredicateComposer {
    fn default() -> Self {
        Self::new(OperatorTable::default())
    }
}

impl PredicateComposer {
    pub fn new(table: OperatorTable) -> Self {
        Self {
            table,
            tenant_field: DEFAULT_TENANT_FIELD.to_string(),
            criteria: CriteriaMode::In,
        }
    }

    pub fn tenant_field(mut self, field: impl Into<String>) -> Self {
        self.tenant_field = field.into();
        self
    }

    pub fn criteria(mut self, mode: CriteriaMode) -> Self {
        self.criteria = mode;
        self
    }

    pub fn tenant_field_name(&self) -> &str {
        &self.tenant_field
    }

    pub fn table(&self) -> &OperatorTable {
        &self.table
    }

    /// Compose `common AND (tenant groups OR-ed)`. The `Or` node is only present
    /// when at least one tenant is given.
    pub fn compose(
        &self,
        common: &CommonFilterMap,
        per_tenant: &TenantFilterMap,
        mode: CompositionMode,
    ) -> Result<Predicate> {
        self.compose_with(common, per_tenant, mode, |_, _| Ok(()))
    }

    /// Like [`compose`](Self::compose), but `extend` may append constraints to each
    /// tenant's AND-group before the groups are OR-ed.
    pub fn compose_with<F>(
        &self,
        common: &CommonFilterMap,
        per_tenant: &TenantFilterMap,
        mode: CompositionMode,
        mut extend: F,
    ) -> Result<Predicate>
    where
        F: FnMut(&str, &mut Vec<Predicate>) -> Result<()>,
    {
        let CompositionMode::IncludeAllTenants = mode;

        let mut root = common_leaves(common)?;
        let mut groups = self.tenant_groups(per_tenant)?;
        for (tenant, group) in per_tenant.keys().zip(groups.iter_mut()) {
            extend(tenant, group)?;
        }
        let tenants = groups.len();
        if !groups.is_empty() {
            root.push(Predicate::Or(
                groups.into_iter().map(Predicate::And).collect(),
            ));
        }

        tracing::debug!(
            target: "kpistore::query",
            common = root.len() - usize::from(tenants > 0),
            tenants,
            criteria = ?self.criteria,
            "composed tenant predicate"
        );
        Ok(Predicate::And(root))
    }

    /// One AND-group per tenant: the tenant id equality leaf followed by one leaf
    /// per non-empty field. Callers may extend a group before OR-ing them.
    pub fn tenant_groups(&self, per_tenant: &TenantFilterMap) -> Result<Vec<Vec<Predicate>>> {
        per_tenant
            .iter()
            .map(|(tenant, fields)| self.tenant_group(tenant, fields))
            .collect()
    }

    fn tenant_group(&self, tenant: &str, fields: &BTreeMap<String, Value>) -> Result<Vec<Predicate>> {
        let mut group = Vec::with_capacity(fields.len() + 1);
        group.push(Predicate::eq(self.tenant_field.as_str(), tenant));

        for (field, raw) in fields {
            let values = match raw {
                Value::Array(values) => values,
                other => {
                    return Err(Error::InvalidFilterValue {
                        tenant: tenant.to_string(),
                        field: field.clone(),
                        found: kind_name(other),
                    });
                }
            };
            if values.is_empty() {
                continue;
            }
            let op = self.table.resolve_operator(field, self.criteria).into();
            let leaf = FieldPredicate::new(field.as_str(), op, values.iter().cloned())?;
            group.push(leaf.into());
        }
        Ok(group)
    }
}

fn common_leaves(common: &CommonFilterMap) -> Result<Vec<Predicate>> {
    common
        .iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(field, values)| {
            FieldPredicate::new(field.as_str(), Operator::In, values.iter().cloned()).map(Into::into)
        })
        .collect()
}

/// Parse a tenant filter map from loosely typed JSON input, rejecting `null`.
pub fn tenant_filters_from_value(value: Value) -> Result<TenantFilterMap> {
    match value {
        Value::Null => Err(Error::MissingTenants),
        other => Ok(serde_json::from_value(other)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tenants(value: Value) -> TenantFilterMap {
        serde_json::from_value(value).unwrap()
    }

    fn common(value: Value) -> CommonFilterMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn without_tenants_only_common_leaves_remain() {
        let composer = PredicateComposer::default();
        let common = common(json!({"sprintId": ["s1", "s2"], "issueType": []}));
        let composed = composer
            .compose(&common, &TenantFilterMap::new(), CompositionMode::IncludeAllTenants)
            .unwrap();
        let expected = Predicate::and(vec![Predicate::r#in("sprintId", ["s1", "s2"]).unwrap()]);
        assert_eq!(composed, expected);
    }

    #[test]
    fn every_tenant_gets_a_branch() {
        let composer = PredicateComposer::default();
        let per_tenant = tenants(json!({
            "p1": {"status": ["Open", "In Progress"], "rejectionLabel": ["dup"]},
            "p2": {"status": ["Done"], "priority": []},
            "p3": {}
        }));
        let composed = composer
            .compose(&CommonFilterMap::new(), &per_tenant, CompositionMode::IncludeAllTenants)
            .unwrap();

        let Predicate::And(root) = composed else {
            panic!("root must be And");
        };
        let [Predicate::Or(branches)] = root.as_slice() else {
            panic!("expected a single Or node, got {root:?}");
        };
        assert_eq!(branches.len(), 3);

        let Predicate::And(p1) = &branches[0] else {
            panic!("branch must be And");
        };
        assert_eq!(p1[0], Predicate::eq(DEFAULT_TENANT_FIELD, "p1"));
        assert_eq!(p1[1], Predicate::not_in("rejectionLabel", ["dup"]).unwrap());
        assert_eq!(p1[2], Predicate::r#in("status", ["Open", "In Progress"]).unwrap());

        let Predicate::And(p2) = &branches[1] else {
            panic!("branch must be And");
        };
        assert_eq!(p2.len(), 2);
        assert_eq!(branches[2], Predicate::And(vec![Predicate::eq(DEFAULT_TENANT_FIELD, "p3")]));
    }

    #[test]
    fn nin_mode_inverts_every_tenant_field() {
        let composer = PredicateComposer::default().criteria(CriteriaMode::Nin);
        let per_tenant = tenants(json!({"p1": {"status": ["Closed"]}}));
        let composed = composer
            .compose(&CommonFilterMap::new(), &per_tenant, CompositionMode::IncludeAllTenants)
            .unwrap();
        assert!(composed.matches(&json!({DEFAULT_TENANT_FIELD: "p1", "status": "Open"})));
        assert!(!composed.matches(&json!({DEFAULT_TENANT_FIELD: "p1", "status": "Closed"})));
        assert!(!composed.matches(&json!({DEFAULT_TENANT_FIELD: "p2", "status": "Open"})));
    }

    #[test]
    fn scalar_tenant_value_is_a_caller_error() {
        let composer = PredicateComposer::default();
        let per_tenant = tenants(json!({"p1": {"status": "Open"}}));
        let err = composer
            .compose(&CommonFilterMap::new(), &per_tenant, CompositionMode::IncludeAllTenants)
            .unwrap_err();
        assert!(err.is_caller_contract());
        assert!(matches!(
            err,
            Error::InvalidFilterValue { ref field, found: "string", .. } if field == "status"
        ));
    }

    #[test]
    fn resolver_is_table_driven() {
        let table = OperatorTable::default();
        assert_eq!(table.resolve_operator("status", CriteriaMode::Nin), Membership::NotIn);
        assert_eq!(table.resolve_operator("rejectionLabel", CriteriaMode::In), Membership::NotIn);
        assert_eq!(table.resolve_operator("status", CriteriaMode::In), Membership::In);

        let table = table.with_field("excludedSprint", Membership::NotIn);
        assert_eq!(table.resolve_operator("excludedSprint", CriteriaMode::In), Membership::NotIn);
    }

    #[test]
    fn criteria_mode_parses_case_insensitively() {
        assert_eq!("NIN".parse::<CriteriaMode>().unwrap(), CriteriaMode::Nin);
        assert_eq!("in".parse::<CriteriaMode>().unwrap(), CriteriaMode::In);
        assert!("exclude".parse::<CriteriaMode>().is_err());
    }

    #[test]
    fn null_tenant_map_is_rejected() {
        assert!(matches!(
            tenant_filters_from_value(Value::Null),
            Err(Error::MissingTenants)
        ));
        let parsed = tenant_filters_from_value(json!({"p1": {}})).unwrap();
        assert_eq!(parsed.len(), 1);
    }
}
