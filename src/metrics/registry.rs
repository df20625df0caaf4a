use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Histogram bucket boundaries for response body size (bytes).
const SIZE_BUCKETS: &[f64] = &[
    100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0, 100000.0, 500000.0, 1000000.0,
];

/// Install the global Prometheus recorder and register metric descriptions.
/// Must be called **once** at startup before any `counter!` / `gauge!` /
/// `histogram!` calls. The recorder is scraped by the external metrics
/// exporter; the data plane only records.
pub fn install() {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .expect("valid matcher")
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "stargate_http_response_size_bytes".to_string(),
            ),
            SIZE_BUCKETS,
        )
        .expect("valid matcher")
        .install_recorder()
        .expect("failed to install metrics recorder");

    // --- Describe all metrics (adds HELP / TYPE lines) ---

    // request path
    describe_counter!(
        "stargate_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed"
    );
    describe_histogram!(
        "stargate_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );
    describe_histogram!(
        "stargate_upstream_request_duration_seconds",
        Unit::Seconds,
        "Upstream request duration (time spent waiting for upstream)"
    );
    describe_gauge!(
        "stargate_http_requests_in_flight",
        Unit::Count,
        "Number of requests currently being processed"
    );
    describe_histogram!(
        "stargate_http_response_size_bytes",
        Unit::Bytes,
        "Response body size in bytes"
    );

    // policy rejections
    describe_counter!(
        "stargate_rate_limit_allowed_total",
        Unit::Count,
        "Total requests allowed by rate limiter"
    );
    describe_counter!(
        "stargate_rate_limit_rejected_total",
        Unit::Count,
        "Total requests rejected by rate limiter"
    );
    describe_counter!(
        "stargate_ip_acl_blocked_total",
        Unit::Count,
        "Total requests blocked by the IP ACL"
    );
    describe_counter!(
        "stargate_auth_rejected_total",
        Unit::Count,
        "Total requests rejected by authentication"
    );
    describe_counter!(
        "stargate_cors_rejected_total",
        Unit::Count,
        "Total requests rejected by CORS validation"
    );
    describe_counter!(
        "stargate_mock_responses_total",
        Unit::Count,
        "Total responses served from mock rules"
    );

    // circuit breaker
    describe_counter!(
        "stargate_circuit_breaker_rejected_total",
        Unit::Count,
        "Total requests rejected while a breaker was open"
    );
    describe_counter!(
        "stargate_circuit_breaker_transitions_total",
        Unit::Count,
        "Circuit breaker state transitions"
    );

    // upstream health
    describe_gauge!(
        "stargate_upstream_health_status",
        Unit::Count,
        "Upstream target health: 1=healthy 0=unhealthy"
    );
    describe_counter!(
        "stargate_health_check_total",
        Unit::Count,
        "Total active health check probes"
    );
    describe_counter!(
        "stargate_passive_isolations_total",
        Unit::Count,
        "Targets isolated by passive health signals"
    );

    // upstream traffic
    describe_counter!(
        "stargate_upstream_retries_total",
        Unit::Count,
        "Total upstream retry attempts"
    );

    // connections
    describe_gauge!(
        "stargate_connections_active",
        Unit::Count,
        "Number of active downstream connections"
    );
    describe_counter!(
        "stargate_connections_total",
        Unit::Count,
        "Total connections accepted"
    );

    // config
    describe_gauge!(
        "stargate_config_routes_total",
        Unit::Count,
        "Number of routes currently loaded"
    );
    describe_counter!(
        "stargate_config_reloads_total",
        Unit::Count,
        "Config reload events"
    );
}
