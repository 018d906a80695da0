use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Step of a traced query: composition, store round trip, or enrichment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceKind {
    Request,
    Compose,
    Query,
    Fold,
}

impl TraceKind {
    fn as_str(self) -> &'static str {
        match self {
            TraceKind::Request => "REQUEST",
            TraceKind::Compose => "COMPOSE",
            TraceKind::Query => "QUERY",
            TraceKind::Fold => "FOLD",
        }
    }
}

type Entry = (TraceKind, String, Value);

/// Bounded per-trace record of the steps a repository call went through.
#[derive(Clone, Default)]
pub struct QueryTrace {
    inner: Arc<Mutex<HashMap<String, VecDeque<Entry>>>>,
    cap: usize,
}

impl QueryTrace {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Arc::default(),
            cap,
        }
    }

    pub fn record(&self, trace_id: &str, kind: TraceKind, component: &str, data: Value) {
        if self.cap == 0 {
            return;
        }
        if let Ok(mut map) = self.inner.lock() {
            let queue = map.entry(trace_id.to_string()).or_default();
            if queue.len() >= self.cap {
                queue.pop_front();
            }
            queue.push_back((kind, component.to_string(), data));
        }
    }

    pub fn len(&self, trace_id: &str) -> usize {
        self.inner
            .lock()
            .map(|map| map.get(trace_id).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    pub fn mermaid(&self, trace_id: &str) -> String {
        let mut diagram = String::from("sequenceDiagram\n");
        for lane in ["CALLER", "COMPOSER", "STORE", "FOLD"] {
            diagram.push_str(&format!("  participant {lane} as {lane}\n"));
        }

        if let Ok(map) = self.inner.lock() {
            if let Some(queue) = map.get(trace_id) {
                for (kind, component, data) in queue {
                    let payload =
                        json!({ "kind": kind.as_str(), "component": component, "data": data })
                            .to_string();
                    let line = match kind {
                        TraceKind::Request => format!("  CALLER->>COMPOSER: {payload}\n"),
                        TraceKind::Compose => format!("  COMPOSER->>STORE: {payload}\n"),
                        TraceKind::Query => format!("  STORE-->>CALLER: {payload}\n"),
                        TraceKind::Fold => format!("  STORE->>FOLD: {payload}\n"),
                    };
                    diagram.push_str(&line);
                }
            }
        }

        diagram
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_newest_entries() {
        let trace = QueryTrace::new(2);
        trace.record("t1", TraceKind::Request, "wip", json!({"tenants": 2}));
        trace.record("t1", TraceKind::Compose, "wip", json!({}));
        trace.record("t1", TraceKind::Query, "jira_issues", json!({"rows": 4}));
        assert_eq!(trace.len("t1"), 2);

        let diagram = trace.mermaid("t1");
        assert!(diagram.starts_with("sequenceDiagram\n"));
        assert!(!diagram.contains("REQUEST"));
        assert!(diagram.contains("COMPOSER->>STORE"));
        assert!(diagram.contains("STORE-->>CALLER"));
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let trace = QueryTrace::new(0);
        trace.record("t1", TraceKind::Fold, "capacity", json!({}));
        assert_eq!(trace.len("t1"), 0);
    }
}
