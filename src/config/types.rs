use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default` — treats JSON/YAML `null` the
/// same as a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration. One document describes the whole data
/// plane: listener, policy defaults, routes, and upstreams. The same document
/// can come from a local file or from the controller via etcd.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Controller connection settings. The controller's admin surface is an
    /// external collaborator — the data plane only records where it lives.
    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    /// Global rate limit defaults, overridable per route.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Global circuit breaker defaults, overridable per route.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub tracing: TracingConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub config_source: ConfigSourceConfig,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub upstreams: Vec<UpstreamConfig>,

    /// Global header transforms applied to every proxied request/response.
    #[serde(default)]
    pub header_transform: Option<HeaderTransformConfig>,

    #[serde(default)]
    pub mock_response: Option<MockResponseConfig>,

    #[serde(default)]
    pub cors: Option<CorsConfig>,

    #[serde(default)]
    pub ip_acl: Option<IpAclConfig>,

    /// Parsed and carried in the snapshot; the grpc-web bridge runtime is an
    /// external collaborator.
    #[serde(default)]
    pub grpc_web: Option<GrpcWebConfig>,

    /// Opaque plugin host configuration (WASM/serverless runtimes live
    /// outside the data plane).
    #[serde(default)]
    pub plugins: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_address")]
    pub address: String,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Bounded wait for in-flight requests during shutdown.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            max_header_bytes: default_max_header_bytes(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

fn default_server_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_read_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_max_header_bytes() -> usize {
    16 * 1024
}

fn default_drain_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_timeout")]
    pub connect_timeout_secs: f64,

    #[serde(default = "default_proxy_timeout")]
    pub send_timeout_secs: f64,

    #[serde(default = "default_proxy_timeout")]
    pub read_timeout_secs: f64,

    #[serde(default)]
    pub keepalive_pool: KeepalivePoolConfig,

    /// Default `false` — typical for internal services with self-signed certs.
    #[serde(default)]
    pub tls_verify: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_proxy_timeout(),
            send_timeout_secs: default_proxy_timeout(),
            read_timeout_secs: default_proxy_timeout(),
            keepalive_pool: KeepalivePoolConfig::default(),
            tls_verify: false,
        }
    }
}

fn default_proxy_timeout() -> f64 {
    6.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepalivePoolConfig {
    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout: u64,

    #[serde(default = "default_pool_size")]
    pub size: usize,
}

impl Default for KeepalivePoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_pool_idle_timeout(),
            size: default_pool_size(),
        }
    }
}

fn default_pool_idle_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    320
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    /// Default algorithm for upstreams that do not set one:
    /// "round_robin", "weighted", "ip_hash".
    #[serde(default = "default_lb_algorithm")]
    pub algorithm: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub canary_groups: Vec<CanaryGroupConfig>,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: default_lb_algorithm(),
            canary_groups: Vec::new(),
        }
    }
}

fn default_lb_algorithm() -> String {
    "round_robin".to_string()
}

/// A canary group bundles versioned upstreams under one selectable name.
/// Routes reference the group id in place of an upstream id; selection picks
/// a version first, then a target inside that version's upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryGroupConfig {
    pub id: String,

    /// "weighted" (default), "percentage", "header_based", "single".
    /// `header_based` falls back to weighted selection until explicit rules
    /// are supplied.
    #[serde(default = "default_canary_strategy")]
    pub strategy: String,

    /// Explicit routing rules evaluated before weighted selection.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rules: Vec<CanaryRuleConfig>,
}

fn default_canary_strategy() -> String {
    "weighted".to_string()
}

/// Match a request attribute to pin a canary version.
/// `kind` is "header", "cookie", or "query".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryRuleConfig {
    pub kind: String,
    pub name: String,
    pub value: String,
    pub version: String,
}

/// Rate limit policy. `algorithm` selects "fixed_window" or "token_bucket".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_rl_algorithm")]
    pub algorithm: String,

    /// Fixed window: maximum requests per window.
    #[serde(default = "default_rl_max_requests")]
    pub max_requests: u64,

    #[serde(default = "default_rl_window")]
    pub window_secs: u64,

    /// Token bucket: sustained refill rate (tokens per second).
    #[serde(default = "default_rl_rate")]
    pub rate: f64,

    /// Token bucket: burst capacity.
    #[serde(default = "default_rl_burst")]
    pub burst: u64,

    /// "ip", "user", "api_key", "combined".
    #[serde(default = "default_rl_identifier")]
    pub identifier: String,

    /// Header carrying the user id for the "user" strategy.
    #[serde(default = "default_rl_user_header")]
    pub user_header: String,

    /// Header carrying the API key for the "api_key" strategy.
    #[serde(default = "default_rl_api_key_header")]
    pub api_key_header: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: default_rl_algorithm(),
            max_requests: default_rl_max_requests(),
            window_secs: default_rl_window(),
            rate: default_rl_rate(),
            burst: default_rl_burst(),
            identifier: default_rl_identifier(),
            user_header: default_rl_user_header(),
            api_key_header: default_rl_api_key_header(),
        }
    }
}

fn default_rl_algorithm() -> String {
    "fixed_window".to_string()
}

fn default_rl_max_requests() -> u64 {
    100
}

fn default_rl_window() -> u64 {
    1
}

fn default_rl_rate() -> f64 {
    100.0
}

fn default_rl_burst() -> u64 {
    100
}

fn default_rl_identifier() -> String {
    "ip".to_string()
}

fn default_rl_user_header() -> String {
    "x-user-id".to_string()
}

fn default_rl_api_key_header() -> String {
    "x-api-key".to_string()
}

/// State machine: Closed → Open → HalfOpen → Closed/Open.
/// Both trip conditions require `request_volume_threshold` samples in the
/// current window before they are evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cb_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_cb_volume_threshold")]
    pub request_volume_threshold: u64,

    /// Percentage in [0, 100].
    #[serde(default = "default_cb_error_percentage")]
    pub error_percentage_threshold: f64,

    #[serde(default = "default_cb_recovery_timeout")]
    pub recovery_timeout_ms: u64,

    #[serde(default = "default_cb_max_half_open")]
    pub max_half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: default_cb_failure_threshold(),
            success_threshold: default_cb_success_threshold(),
            request_volume_threshold: default_cb_volume_threshold(),
            error_percentage_threshold: default_cb_error_percentage(),
            recovery_timeout_ms: default_cb_recovery_timeout(),
            max_half_open_requests: default_cb_max_half_open(),
        }
    }
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    3
}

fn default_cb_volume_threshold() -> u64 {
    10
}

fn default_cb_error_percentage() -> f64 {
    50.0
}

fn default_cb_recovery_timeout() -> u64 {
    30_000
}

fn default_cb_max_half_open() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub jwt_secret: String,

    /// Paths excluded from authentication (prefix match).
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub skip_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "json" or "text".
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "stargate".to_string()
}

/// Which configuration backend is authoritative: "file" or "etcd".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(rename = "type", default = "default_store_type")]
    pub store_type: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: default_store_type(),
        }
    }
}

fn default_store_type() -> String {
    "file".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSourceConfig {
    #[serde(default)]
    pub file: FileSourceConfig,

    #[serde(default)]
    pub etcd: EtcdConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSourceConfig {
    /// Watched file. Defaults to the bootstrap config path when empty.
    #[serde(default)]
    pub path: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for FileSourceConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    #[serde(default = "default_etcd_endpoints")]
    pub endpoints: Vec<String>,

    /// The single key holding the full gateway configuration document.
    #[serde(default = "default_etcd_key")]
    pub key: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_etcd_endpoints(),
            key: default_etcd_key(),
            username: None,
            password: None,
        }
    }
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_etcd_key() -> String {
    "/stargate/config".to_string()
}

/// A route binds a match predicate to an upstream (or canary group) plus
/// optional per-route policy overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,

    /// Host patterns. Empty means any host. Supports exact
    /// (`api.example.com`) and wildcard suffix (`*.example.com`).
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub hosts: Vec<String>,

    pub path: String,

    /// "exact", "prefix" (default), "regex".
    #[serde(default = "default_path_match")]
    pub path_match: String,

    /// Allowed HTTP methods. Empty means all methods.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub methods: Vec<String>,

    /// Header equality predicates (AND semantics), evaluated after the path.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Query equality predicates (AND semantics).
    #[serde(default)]
    pub query: HashMap<String, String>,

    /// Higher value = higher priority; id is the lexicographic tiebreak.
    #[serde(default)]
    pub priority: i32,

    /// Upstream id or canary group id.
    pub upstream: String,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub retries: Option<u32>,

    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    #[serde(default)]
    pub header_transform: Option<HeaderTransformConfig>,

    #[serde(default)]
    pub mock_response: Option<MockResponseConfig>,

    #[serde(default)]
    pub cors: Option<CorsConfig>,
}

fn default_path_match() -> String {
    "prefix".to_string()
}

/// An upstream is a logical service resolved to a set of targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub id: String,

    /// Load-balancing algorithm; falls back to the global default when unset.
    #[serde(default)]
    pub algorithm: Option<String>,

    /// "http" or "https". Port 443 defaults to https when unset.
    #[serde(default)]
    pub scheme: Option<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub targets: Vec<TargetConfig>,

    #[serde(default)]
    pub canary: Option<CanaryMembership>,

    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,

    #[serde(default = "default_target_weight")]
    pub weight: u32,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_target_weight() -> u32 {
    100
}

/// Membership of an upstream in a canary group. Versions across upstreams
/// sharing a `group` id form the group's ordered version list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryMembership {
    pub group: String,
    pub version: String,

    #[serde(default = "default_target_weight")]
    pub weight: u32,

    /// Used by the "percentage" strategy; 0..=100.
    #[serde(default)]
    pub percentage: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub active: Option<ActiveHealthCheck>,

    #[serde(default)]
    pub passive: Option<PassiveHealthCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHealthCheck {
    #[serde(default = "default_hc_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_hc_path")]
    pub path: String,

    #[serde(default = "default_hc_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_hc_threshold")]
    pub healthy_threshold: u32,

    #[serde(default = "default_hc_threshold")]
    pub unhealthy_threshold: u32,

    /// Prevents probe storms when an upstream has many targets.
    #[serde(default = "default_hc_concurrency")]
    pub concurrency: usize,
}

impl Default for ActiveHealthCheck {
    fn default() -> Self {
        Self {
            interval_secs: default_hc_interval(),
            path: default_hc_path(),
            timeout_secs: default_hc_timeout(),
            healthy_threshold: default_hc_threshold(),
            unhealthy_threshold: default_hc_threshold(),
            concurrency: default_hc_concurrency(),
        }
    }
}

fn default_hc_interval() -> u64 {
    10
}

fn default_hc_path() -> String {
    "/health".to_string()
}

fn default_hc_timeout() -> u64 {
    3
}

fn default_hc_threshold() -> u32 {
    3
}

fn default_hc_concurrency() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassiveHealthCheck {
    /// Consecutive request failures that isolate the target.
    #[serde(default = "default_passive_failures")]
    pub consecutive_failures: u32,

    #[serde(default = "default_isolation_secs")]
    pub isolation_duration_secs: u64,
}

impl Default for PassiveHealthCheck {
    fn default() -> Self {
        Self {
            consecutive_failures: default_passive_failures(),
            isolation_duration_secs: default_isolation_secs(),
        }
    }
}

fn default_passive_failures() -> u32 {
    5
}

fn default_isolation_secs() -> u64 {
    30
}

/// Header transform rules, applied in Add → Remove → Rename → Replace order
/// on both directions. Values support `${...}` placeholders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderTransformConfig {
    #[serde(default)]
    pub request: HeaderRules,

    #[serde(default)]
    pub response: HeaderRules,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderRules {
    #[serde(default)]
    pub add: HashMap<String, String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub remove: Vec<String>,

    /// old name → new name.
    #[serde(default)]
    pub rename: HashMap<String, String>,

    #[serde(default)]
    pub replace: HashMap<String, String>,
}

impl HeaderRules {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty()
            && self.remove.is_empty()
            && self.rename.is_empty()
            && self.replace.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockResponseConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rules: Vec<MockRule>,
}

/// First matching rule wins; rules are sorted by descending priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockRule {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub priority: i32,

    pub path: String,

    /// "exact" (default), "prefix", "regex".
    #[serde(default = "default_mock_match")]
    pub path_match: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub methods: Vec<String>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub query: HashMap<String, String>,

    #[serde(default = "default_mock_status")]
    pub status: u16,

    /// Body supports the shared `${...}` placeholder vocabulary.
    #[serde(default)]
    pub body: String,

    #[serde(default)]
    pub response_headers: HashMap<String, String>,
}

fn default_mock_match() -> String {
    "exact".to_string()
}

fn default_mock_status() -> u16 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// "*", exact origins, or wildcard subdomains (`*.example.com`).
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub allow_origins: Vec<String>,

    #[serde(default = "default_cors_methods")]
    pub allow_methods: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub allow_headers: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub expose_headers: Vec<String>,

    #[serde(default)]
    pub allow_credentials: bool,

    #[serde(default = "default_cors_max_age")]
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_origins: Vec::new(),
            allow_methods: default_cors_methods(),
            allow_headers: Vec::new(),
            expose_headers: Vec::new(),
            allow_credentials: false,
            max_age_secs: default_cors_max_age(),
        }
    }
}

fn default_cors_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_cors_max_age() -> u64 {
    600
}

/// CIDR-based access control. Bare IPs are treated as /32 (v4) or /128 (v6).
/// Whitelist wins over blacklist; a non-empty whitelist makes deny the
/// default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpAclConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub whitelist: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub blacklist: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrpcWebConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_route_defaults() {
        let yaml = r#"
id: r1
path: /api
upstream: backend
"#;
        let route: RouteConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(route.id, "r1");
        assert_eq!(route.path, "/api");
        assert_eq!(route.path_match, "prefix");
        assert!(route.hosts.is_empty());
        assert!(route.methods.is_empty());
        assert!(route.headers.is_empty());
        assert!(route.query.is_empty());
        assert_eq!(route.priority, 0);
        assert!(route.timeout_ms.is_none());
        assert!(route.retries.is_none());
        assert!(route.rate_limit.is_none());
        assert!(route.circuit_breaker.is_none());
        assert!(route.header_transform.is_none());
        assert!(route.mock_response.is_none());
        assert!(route.cors.is_none());
    }

    #[test]
    fn test_route_full() {
        let yaml = r#"
id: users-api
hosts: ["api.example.com", "*.staging.example.com"]
path: "/v1/users"
path_match: exact
methods: [GET, POST]
headers:
  x-api-version: v2
query:
  debug: "1"
priority: 10
upstream: user-service
timeout_ms: 2500
retries: 2
rate_limit:
  enabled: true
  algorithm: fixed_window
  max_requests: 3
  window_secs: 1
  identifier: ip
"#;
        let route: RouteConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(route.hosts.len(), 2);
        assert_eq!(route.path_match, "exact");
        assert_eq!(route.methods, vec!["GET", "POST"]);
        assert_eq!(route.headers["x-api-version"], "v2");
        assert_eq!(route.query["debug"], "1");
        assert_eq!(route.priority, 10);
        assert_eq!(route.timeout_ms, Some(2500));
        assert_eq!(route.retries, Some(2));
        let rl = route.rate_limit.unwrap();
        assert!(rl.enabled);
        assert_eq!(rl.max_requests, 3);
        assert_eq!(rl.window_secs, 1);
        assert_eq!(rl.identifier, "ip");
    }

    #[test]
    fn test_null_routes_defaults_to_empty() {
        let yaml = "routes: null\nupstreams: null\n";
        let cfg: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.routes.is_empty());
        assert!(cfg.upstreams.is_empty());
    }

    #[test]
    fn test_upstream_defaults() {
        let yaml = r#"
id: backend
targets:
  - host: 127.0.0.1
    port: 9000
"#;
        let up: UpstreamConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(up.id, "backend");
        assert!(up.algorithm.is_none());
        assert!(up.scheme.is_none());
        assert_eq!(up.targets.len(), 1);
        assert_eq!(up.targets[0].weight, 100);
        assert!(up.targets[0].metadata.is_empty());
        assert!(up.canary.is_none());
        assert!(up.health_check.is_none());
    }

    #[test]
    fn test_upstream_with_canary_membership() {
        let yaml = r#"
id: backend-v2
canary:
  group: backend
  version: v2
  weight: 10
  percentage: 10
targets:
  - host: 10.0.0.2
    port: 8080
    weight: 50
"#;
        let up: UpstreamConfig = serde_yaml::from_str(yaml).unwrap();
        let canary = up.canary.unwrap();
        assert_eq!(canary.group, "backend");
        assert_eq!(canary.version, "v2");
        assert_eq!(canary.weight, 10);
        assert_eq!(canary.percentage, 10);
        assert_eq!(up.targets[0].weight, 50);
    }

    #[test]
    fn test_health_check_defaults() {
        let yaml = r#"
id: hc
health_check:
  active: {}
  passive: {}
"#;
        let up: UpstreamConfig = serde_yaml::from_str(yaml).unwrap();
        let hc = up.health_check.unwrap();
        let active = hc.active.unwrap();
        assert_eq!(active.interval_secs, 10);
        assert_eq!(active.path, "/health");
        assert_eq!(active.timeout_secs, 3);
        assert_eq!(active.healthy_threshold, 3);
        assert_eq!(active.unhealthy_threshold, 3);
        assert_eq!(active.concurrency, 64);
        let passive = hc.passive.unwrap();
        assert_eq!(passive.consecutive_failures, 5);
        assert_eq!(passive.isolation_duration_secs, 30);
    }

    #[test]
    fn test_circuit_breaker_defaults() {
        let cb: CircuitBreakerConfig = serde_yaml::from_str("{}").unwrap();
        assert!(!cb.enabled);
        assert_eq!(cb.failure_threshold, 5);
        assert_eq!(cb.success_threshold, 3);
        assert_eq!(cb.request_volume_threshold, 10);
        assert_eq!(cb.error_percentage_threshold, 50.0);
        assert_eq!(cb.recovery_timeout_ms, 30_000);
        assert_eq!(cb.max_half_open_requests, 1);
    }

    #[test]
    fn test_rate_limit_defaults() {
        let rl = RateLimitConfig::default();
        assert!(!rl.enabled);
        assert_eq!(rl.algorithm, "fixed_window");
        assert_eq!(rl.max_requests, 100);
        assert_eq!(rl.window_secs, 1);
        assert_eq!(rl.rate, 100.0);
        assert_eq!(rl.burst, 100);
        assert_eq!(rl.identifier, "ip");
        assert_eq!(rl.user_header, "x-user-id");
        assert_eq!(rl.api_key_header, "x-api-key");
    }

    #[test]
    fn test_header_transform_rules() {
        let yaml = r#"
request:
  add:
    x-request-id: "${request_id}"
  remove: [x-internal-token]
  rename:
    user-agent: x-original-user-agent
  replace:
    accept: application/json
response:
  add:
    x-served-by: stargate
"#;
        let ht: HeaderTransformConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(ht.request.add["x-request-id"], "${request_id}");
        assert_eq!(ht.request.remove, vec!["x-internal-token"]);
        assert_eq!(ht.request.rename["user-agent"], "x-original-user-agent");
        assert_eq!(ht.request.replace["accept"], "application/json");
        assert!(!ht.response.is_empty());
        assert!(HeaderRules::default().is_empty());
    }

    #[test]
    fn test_mock_rule_defaults() {
        let yaml = r#"
path: /api/test
body: '{"message":"mocked response"}'
"#;
        let rule: MockRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.path_match, "exact");
        assert_eq!(rule.status, 200);
        assert_eq!(rule.priority, 0);
        assert!(rule.methods.is_empty());
        assert!(rule.response_headers.is_empty());
    }

    #[test]
    fn test_cors_defaults() {
        let cors = CorsConfig::default();
        assert!(!cors.enabled);
        assert_eq!(cors.allow_methods.len(), 6);
        assert_eq!(cors.max_age_secs, 600);
        assert!(!cors.allow_credentials);
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
server:
  address: "0.0.0.0:8080"
store:
  type: file
config_source:
  file:
    path: /etc/stargate/config.yaml
    poll_interval_ms: 100
  etcd:
    endpoints: ["http://etcd-1:2379", "http://etcd-2:2379"]
    key: /stargate/config
    username: root
routes:
  - id: ping
    path: /api/ping
    path_match: exact
    methods: [GET]
    upstream: backend
upstreams:
  - id: backend
    targets:
      - host: 127.0.0.1
        port: 9000
ip_acl:
  enabled: true
  whitelist: ["192.168.1.0/24"]
  blacklist: ["10.0.0.0/8"]
cors:
  enabled: true
  allow_origins: ["*.example.com"]
"#;
        let cfg: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.server.address, "0.0.0.0:8080");
        assert_eq!(cfg.store.store_type, "file");
        assert_eq!(cfg.config_source.file.poll_interval_ms, 100);
        assert_eq!(cfg.config_source.etcd.endpoints.len(), 2);
        assert_eq!(cfg.config_source.etcd.username, Some("root".to_string()));
        assert_eq!(cfg.routes.len(), 1);
        assert_eq!(cfg.upstreams.len(), 1);
        let acl = cfg.ip_acl.unwrap();
        assert!(acl.enabled);
        assert_eq!(acl.whitelist, vec!["192.168.1.0/24"]);
        let cors = cfg.cors.unwrap();
        assert_eq!(cors.allow_origins, vec!["*.example.com"]);
    }

    #[test]
    fn test_json_document_also_parses() {
        let json = r#"{
            "server": {"address": "127.0.0.1:9090"},
            "routes": [{"id": "r", "path": "/", "upstream": "u"}],
            "upstreams": [{"id": "u", "targets": [{"host": "h", "port": 80}]}]
        }"#;
        let cfg: GatewayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.server.address, "127.0.0.1:9090");
        assert_eq!(cfg.routes[0].upstream, "u");
    }

    #[test]
    fn test_canary_group_defaults() {
        let group: CanaryGroupConfig = serde_yaml::from_str("id: backend\n").unwrap();
        assert_eq!(group.strategy, "weighted");
        assert!(group.rules.is_empty());
    }

    #[test]
    fn test_canary_rule() {
        let yaml = r#"
id: backend
strategy: header_based
rules:
  - kind: header
    name: x-canary
    value: "true"
    version: v2
"#;
        let group: CanaryGroupConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(group.rules.len(), 1);
        assert_eq!(group.rules[0].kind, "header");
        assert_eq!(group.rules[0].version, "v2");
    }

    #[test]
    fn test_config_roundtrip() {
        let cfg = GatewayConfig {
            routes: vec![RouteConfig {
                id: "r".into(),
                hosts: vec!["api.example.com".into()],
                path: "/v1".into(),
                path_match: "prefix".into(),
                methods: vec!["GET".into()],
                headers: HashMap::new(),
                query: HashMap::new(),
                priority: 5,
                upstream: "u".into(),
                timeout_ms: Some(1000),
                retries: Some(1),
                rate_limit: None,
                circuit_breaker: None,
                header_transform: None,
                mock_response: None,
                cors: None,
            }],
            ..GatewayConfig::default()
        };
        let text = serde_yaml::to_string(&cfg).unwrap();
        let parsed: GatewayConfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(parsed.routes[0].id, "r");
        assert_eq!(parsed.routes[0].priority, 5);
        assert_eq!(parsed.routes[0].timeout_ms, Some(1000));
    }
}
