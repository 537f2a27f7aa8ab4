use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
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
    /// descriptions. Must be called **once** at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_wait_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // request path
        describe_counter!(
            "bridge_mcp_tool_calls_total",
            Unit::Count,
            "Total MCP tool calls processed"
        );
        describe_counter!(
            "bridge_mcp_auth_failures_total",
            Unit::Count,
            "Total requests rejected at authentication"
        );
        describe_gauge!(
            "bridge_mcp_sessions_active",
            Unit::Count,
            "Live MCP sessions"
        );

        // rate gate
        describe_counter!(
            "bridge_rate_gate_granted_total",
            Unit::Count,
            "Total rate-gate slots granted"
        );
        describe_counter!(
            "bridge_rate_gate_timeout_total",
            Unit::Count,
            "Total waiters rejected for exceeding their wait budget"
        );
        describe_histogram!(
            "bridge_rate_gate_wait_seconds",
            Unit::Seconds,
            "Time spent queued at the rate gate"
        );

        // key pool
        describe_counter!(
            "bridge_pool_key_selected_total",
            Unit::Count,
            "Total successful key selections"
        );
        describe_counter!(
            "bridge_pool_no_eligible_key_total",
            Unit::Count,
            "Selection passes that found no usable key"
        );
        describe_counter!(
            "bridge_pool_credits_refresh_total",
            Unit::Count,
            "Credit refresh attempts by outcome"
        );

        // upstream
        describe_counter!(
            "bridge_upstream_requests_total",
            Unit::Count,
            "Total upstream search calls"
        );
        describe_histogram!(
            "bridge_upstream_request_duration_seconds",
            Unit::Seconds,
            "Upstream search call duration"
        );

        // routing
        describe_counter!(
            "bridge_routed_search_total",
            Unit::Count,
            "Routed searches by resolved mode"
        );
        describe_counter!(
            "bridge_fallback_to_tavily_total",
            Unit::Count,
            "Brave-path failures that fell back to Provider-T"
        );

        // connections
        describe_gauge!(
            "bridge_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "bridge_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
