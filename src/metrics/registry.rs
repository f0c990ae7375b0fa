use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds). Endpoint
/// calls stream whole waveform windows, so the tail reaches minutes.
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "federator_requests_total",
            Unit::Count,
            "Client requests processed, by service and status"
        );
        describe_histogram!(
            "federator_request_duration_seconds",
            Unit::Seconds,
            "Client request duration"
        );
        describe_gauge!(
            "federator_requests_in_flight",
            Unit::Count,
            "Client requests currently being processed"
        );

        describe_counter!(
            "federator_routing_requests_total",
            Unit::Count,
            "Calls to the routing resolver, by status"
        );

        describe_counter!(
            "federator_endpoint_requests_total",
            Unit::Count,
            "Terminal endpoint call outcomes, by URL and status"
        );
        describe_histogram!(
            "federator_endpoint_request_duration_seconds",
            Unit::Seconds,
            "Endpoint call duration per attempt"
        );
        describe_counter!(
            "federator_endpoint_retries_total",
            Unit::Count,
            "Endpoint retry attempts"
        );

        describe_counter!(
            "federator_capacity_refused_total",
            Unit::Count,
            "Routes abandoned because no request slot freed in time"
        );
        describe_counter!(
            "federator_retry_budget_dropped_total",
            Unit::Count,
            "Routes dropped by the client retry-budget gate"
        );

        describe_counter!(
            "federator_cache_total",
            Unit::Count,
            "Response cache lookups, by result"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
