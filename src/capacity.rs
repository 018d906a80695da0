//! Post-query capacity enrichment.
//!
//! Capacity documents store a nested list of per-filter node capacities. The
//! dashboard needs one scalar per document, restricted to the filters and nodes
//! the current report selects. The matching is case-insensitive on filter ids,
//! so it runs in process after the store query returns.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCapacity {
    #[serde(alias = "additionalFilterId")]
    pub node_id: String,
    #[serde(alias = "additionalFilterCapacity", default)]
    pub capacity: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityEntry {
    pub filter_id: String,
    #[serde(alias = "nodeCapacityList", default)]
    pub node_entries: Vec<NodeCapacity>,
}

/// A stored document carrying a nested capacity list and a scalar rollup.
pub trait CapacityDocument {
    fn capacity_entries(&self) -> &[CapacityEntry];

    fn capacity(&self) -> f64;

    fn set_capacity(&mut self, value: f64);
}

/// Sprint capacity snapshot for a scrum project.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityKpiData {
    pub basic_project_config_id: String,
    #[serde(default)]
    pub sprint_id: Option<String>,
    #[serde(default)]
    pub capacity_per_sprint: f64,
    #[serde(default)]
    pub additional_filter_capacity_list: Option<Vec<CapacityEntry>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CapacityDocument for CapacityKpiData {
    fn capacity_entries(&self) -> &[CapacityEntry] {
        self.additional_filter_capacity_list.as_deref().unwrap_or_default()
    }

    fn capacity(&self) -> f64 {
        self.capacity_per_sprint
    }

    fn set_capacity(&mut self, value: f64) {
        self.capacity_per_sprint = value;
    }
}

/// Capacity window for a kanban project.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KanbanCapacity {
    pub basic_project_config_id: String,
    #[serde(default)]
    pub capacity: f64,
    #[serde(default)]
    pub additional_filter_capacity_list: Option<Vec<CapacityEntry>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CapacityDocument for KanbanCapacity {
    fn capacity_entries(&self) -> &[CapacityEntry] {
        self.additional_filter_capacity_list.as_deref().unwrap_or_default()
    }

    fn capacity(&self) -> f64 {
        self.capacity
    }

    fn set_capacity(&mut self, value: f64) {
        self.capacity = value;
    }
}

/// Folds nested capacity lists into the document's scalar capacity.
///
/// Folding overwrites the scalar field in place; run it once per query result
/// and before any step that reads the scalar.
#[derive(Clone, Debug, Default)]
pub struct CapacityFoldEngine {
    filter_ids: HashSet<String>,
    node_ids: HashSet<String>,
}

impl CapacityFoldEngine {
    pub fn new<F, N>(filter_ids: F, node_ids: N) -> Self
    where
        F: IntoIterator,
        F::Item: AsRef<str>,
        N: IntoIterator,
        N::Item: Into<String>,
    {
        Self {
            filter_ids: filter_ids
                .into_iter()
                .map(|id| id.as_ref().to_uppercase())
                .collect(),
            node_ids: node_ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Sum of the selected node capacities, without touching the document.
    pub fn total<D: CapacityDocument + ?Sized>(&self, doc: &D) -> f64 {
        doc.capacity_entries()
            .iter()
            .filter(|entry| self.filter_ids.contains(&entry.filter_id.to_uppercase()))
            .flat_map(|entry| entry.node_entries.iter())
            .filter(|node| self.node_ids.contains(&node.node_id))
            .fold(0.0, |acc, node| acc + node.capacity)
    }

    /// Compute the rollup and write it onto the document's scalar field.
    pub fn fold<D: CapacityDocument + ?Sized>(&self, doc: &mut D) -> f64 {
        let total = self.total(doc);
        doc.set_capacity(total);
        total
    }

    /// Fold every document of a result set.
    pub fn enrich<D: CapacityDocument>(&self, mut docs: Vec<D>) -> Vec<D> {
        for doc in docs.iter_mut() {
            self.fold(doc);
        }
        crate::metrics::record_folded(docs.len());
        docs
    }
}
