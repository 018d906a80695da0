use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct Metrics {
    // Store round trips
    pub find_queries_total: AtomicU64,
    pub aggregate_queries_total: AtomicU64,
    pub query_time_ms_total: AtomicU64,
    pub store_errors_total: AtomicU64,

    // Post-query enrichment
    pub documents_folded_total: AtomicU64,

    // Batch callers that continued past a failing tenant
    pub tenants_skipped_total: AtomicU64,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub(crate) fn record_query(kind: &str, elapsed: Duration) {
    let m = metrics();
    match kind {
        "aggregate" => m.aggregate_queries_total.fetch_add(1, Ordering::Relaxed),
        _ => m.find_queries_total.fetch_add(1, Ordering::Relaxed),
    };
    m.query_time_ms_total
        .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
}

pub(crate) fn record_store_error() {
    metrics().store_errors_total.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_folded(documents: usize) {
    metrics()
        .documents_folded_total
        .fetch_add(documents as u64, Ordering::Relaxed);
}

pub(crate) fn record_tenant_skipped() {
    metrics().tenants_skipped_total.fetch_add(1, Ordering::Relaxed);
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    let counters = [
        ("kpistore_find_queries_total", &m.find_queries_total),
        ("kpistore_aggregate_queries_total", &m.aggregate_queries_total),
        ("kpistore_query_time_ms_total", &m.query_time_ms_total),
        ("kpistore_store_errors_total", &m.store_errors_total),
        ("kpistore_documents_folded_total", &m.documents_folded_total),
        ("kpistore_tenants_skipped_total", &m.tenants_skipped_total),
    ];
    for (name, counter) in counters {
        let _ = writeln!(
            s,
            "# TYPE {name} counter\n{name} {}",
            counter.load(Ordering::Relaxed)
        );
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_output_lists_every_counter() {
        record_folded(3);
        let out = render_prometheus();
        assert!(out.contains("# TYPE kpistore_documents_folded_total counter"));
        assert!(out.contains("kpistore_find_queries_total "));
        assert_eq!(out.lines().count(), 12);
    }
}
