//! Prometheus exposition of the engine counters.
//!
//! The engine keeps plain atomic counters. On each scrape the current
//! [`MetricsSnapshot`] is published into a private Prometheus recorder and
//! rendered through its handle. The recorder is never installed globally.
//!
//! - `lifter_table_upserts_total` / `lifter_table_deletes_total`
//! - `lifter_table_apply_failures_total{kind}`
//! - `lifter_events_total{outcome}`
//! - `lifter_keys_reclaimed_total`
//! - `lifter_converge_incomplete_total`
//! - `lifter_shadow_entries`

use lifter_reconcile::{MetricsSnapshot, TableErrorKind};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

/// Renders engine counters in the Prometheus text format.
pub struct MetricsExporter {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl MetricsExporter {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, describe);
        Self { recorder, handle }
    }

    /// Publish a snapshot and render the exposition text.
    pub fn render(&self, snapshot: &MetricsSnapshot) -> String {
        metrics::with_local_recorder(&self.recorder, || publish(snapshot));
        self.handle.render()
    }
}

impl Default for MetricsExporter {
    fn default() -> Self {
        Self::new()
    }
}

fn describe() {
    describe_counter!("lifter_table_upserts_total", "Confirmed table upserts");
    describe_counter!("lifter_table_deletes_total", "Confirmed table deletes");
    describe_counter!(
        "lifter_table_apply_failures_total",
        "Failed table attempts by kind"
    );
    describe_counter!("lifter_events_total", "Membership deliveries by outcome");
    describe_counter!(
        "lifter_keys_reclaimed_total",
        "Service keys garbage collected"
    );
    describe_counter!(
        "lifter_converge_incomplete_total",
        "Convergence passes that left work pending"
    );
    describe_gauge!("lifter_shadow_entries", "Service keys in the shadow store");
}

fn publish(s: &MetricsSnapshot) {
    counter!("lifter_table_upserts_total").absolute(s.upserts);
    counter!("lifter_table_deletes_total").absolute(s.deletes);

    for (kind, value) in [
        (TableErrorKind::Transient, s.failures_transient),
        (TableErrorKind::CapacityExceeded, s.failures_capacity),
        (TableErrorKind::Unavailable, s.failures_unavailable),
    ] {
        counter!("lifter_table_apply_failures_total", "kind" => kind.as_str()).absolute(value);
    }

    for (outcome, value) in [
        ("forwarded", s.events_forwarded),
        ("duplicate", s.events_duplicate),
        ("malformed", s.events_malformed),
        ("stale", s.events_stale),
    ] {
        counter!("lifter_events_total", "outcome" => outcome).absolute(value);
    }

    counter!("lifter_keys_reclaimed_total").absolute(s.keys_reclaimed);
    counter!("lifter_converge_incomplete_total").absolute(s.passes_incomplete);
    gauge!("lifter_shadow_entries").set(s.shadow_entries as f64);
}

#[cfg(test)]
mod tests {
    use lifter_reconcile::Metrics;

    use super::*;

    #[test]
    fn test_renders_counters_and_labels() {
        let metrics = Metrics::new();
        metrics.record_upsert();
        metrics.record_failure(TableErrorKind::CapacityExceeded);
        metrics.set_shadow_entries(4);

        let text = MetricsExporter::new().render(&metrics.snapshot());
        assert!(text.contains("# TYPE lifter_table_upserts_total counter"), "{text}");
        assert!(text.contains("lifter_table_upserts_total 1"), "{text}");
        assert!(
            text.contains(r#"lifter_table_apply_failures_total{kind="capacity_exceeded"} 1"#),
            "{text}"
        );
        assert!(text.contains("# TYPE lifter_shadow_entries gauge"), "{text}");
        assert!(text.contains("lifter_shadow_entries 4"), "{text}");
    }

    #[test]
    fn test_values_track_later_snapshots() {
        let metrics = Metrics::new();
        let exporter = MetricsExporter::new();
        metrics.record_delete();
        exporter.render(&metrics.snapshot());

        metrics.record_delete();
        metrics.record_stale();
        let text = exporter.render(&metrics.snapshot());
        assert!(text.contains("lifter_table_deletes_total 2"), "{text}");
        assert!(text.contains(r#"lifter_events_total{outcome="stale"} 1"#), "{text}");
    }

    #[test]
    fn test_exporters_are_independent() {
        let busy = Metrics::new();
        busy.record_upsert();
        MetricsExporter::new().render(&busy.snapshot());

        let text = MetricsExporter::new().render(&Metrics::new().snapshot());
        assert!(text.contains("lifter_table_upserts_total 0"), "{text}");
    }
}
