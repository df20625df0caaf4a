use crate::config::{CircuitBreakerConfig, GatewayConfig, RouteConfig};
use crate::middleware::{build_route_chain, build_unmatched_chain, ChainContext, Middleware};
use crate::routing::trie::{PathTrie, TrieMatch};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A compiled route — the runtime domain object.
///
/// Contains only what request handling needs. The `RouteConfig` DTO is
/// consumed during compilation and not retained.
#[derive(Debug)]
pub struct CompiledRoute {
    pub id: String,
    pub path: String,
    pub priority: i32,
    /// Uppercased; empty means all methods.
    pub methods: Vec<String>,
    /// Lowercased header names; evaluated after the path match.
    pub header_predicates: Vec<(String, String)>,
    pub query_predicates: Vec<(String, String)>,
    /// Upstream id or canary group id.
    pub upstream_id: String,
    pub timeout: Option<Duration>,
    pub retries: u32,
    /// The effective middleware chain: per-route overrides substituted into
    /// the global configuration, in fixed outer-to-inner order.
    pub chain: Vec<Middleware>,
    /// Effective breaker config when enabled for this route.
    pub breaker: Option<Arc<CircuitBreakerConfig>>,
}

impl CompiledRoute {
    /// Method/header/query predicates, evaluated post-path-match.
    fn predicates_match(
        &self,
        method_upper: &str,
        headers: &http::HeaderMap,
        query: &[(String, String)],
    ) -> bool {
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m == method_upper) {
            return false;
        }
        for (name, expected) in &self.header_predicates {
            match headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
                Some(v) if v == expected => {}
                _ => return false,
            }
        }
        for (name, expected) in &self.query_predicates {
            if !query.iter().any(|(k, v)| k == name && v == expected) {
                return false;
            }
        }
        true
    }
}

/// Routes for one host partition: a trie for exact/prefix rules plus a
/// linear, priority-ordered list of regex rules consulted when the trie has
/// no match.
struct HostEntry {
    trie: PathTrie,
    regex_routes: Vec<(regex::Regex, Arc<CompiledRoute>)>,
}

impl HostEntry {
    fn new() -> Self {
        Self {
            trie: PathTrie::new(),
            regex_routes: Vec::new(),
        }
    }

    fn insert(&mut self, route_cfg: &RouteConfig, compiled: Arc<CompiledRoute>) {
        match route_cfg.path_match.as_str() {
            "regex" => {
                // Validated at config load; a compile failure here drops the
                // rule rather than poisoning the table.
                match regex::Regex::new(&route_cfg.path) {
                    Ok(re) => self.regex_routes.push((re, compiled)),
                    Err(e) => {
                        tracing::error!(route = %route_cfg.id, "invalid route regex, dropped: {e}")
                    }
                }
            }
            "exact" => self.trie.insert(&route_cfg.path, false, compiled),
            _ => self.trie.insert(&route_cfg.path, true, compiled),
        }
    }

    fn finish(&mut self) {
        self.regex_routes.sort_by(|(_, a), (_, b)| {
            b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id))
        });
    }

    fn match_route(
        &self,
        path: &str,
        method_upper: &str,
        headers: &http::HeaderMap,
        query: &[(String, String)],
    ) -> Option<Arc<CompiledRoute>> {
        let from_trie = match self.trie.match_path(path) {
            TrieMatch::Exact {
                exact,
                prefix_fallbacks,
            } => best_route(exact, method_upper, headers, query).or_else(|| {
                prefix_fallbacks
                    .iter()
                    .find_map(|c| best_route(c, method_upper, headers, query))
            }),
            TrieMatch::Prefix(candidates) => candidates
                .iter()
                .find_map(|c| best_route(c, method_upper, headers, query)),
            TrieMatch::None => None,
        };
        if from_trie.is_some() {
            return from_trie;
        }

        let bare_path = path.split('?').next().unwrap_or(path);
        self.regex_routes
            .iter()
            .find(|(re, route)| {
                re.is_match(bare_path) && route.predicates_match(method_upper, headers, query)
            })
            .map(|(_, route)| route.clone())
    }
}

/// Pick the highest-priority matching route; route id is the lexicographic
/// tiebreak so matching stays deterministic when priorities collide.
fn best_route(
    routes: &[Arc<CompiledRoute>],
    method_upper: &str,
    headers: &http::HeaderMap,
    query: &[(String, String)],
) -> Option<Arc<CompiledRoute>> {
    let mut best: Option<&Arc<CompiledRoute>> = None;

    for route in routes {
        if !route.predicates_match(method_upper, headers, query) {
            continue;
        }
        match best {
            Some(current)
                if route.priority < current.priority
                    || (route.priority == current.priority && route.id >= current.id) => {}
            _ => best = Some(route),
        }
    }

    best.cloned()
}

/// The route table — host-partitioned immutable lookup structure.
///
/// Built whole from a config snapshot and swapped in via a single `ArcSwap`
/// publish, so in-flight requests never see a half-updated table.
///
/// Matching order:
/// 1. Exact host match (O(1) HashMap lookup)
/// 2. Wildcard host patterns (linear scan over a small set)
/// 3. Host-agnostic routes (routes with an empty host list)
pub struct RouteTable {
    exact_hosts: HashMap<String, HostEntry>,
    wildcard_hosts: Vec<(String, HostEntry)>,
    any_host: HostEntry,
    /// Chain applied to requests that match no route (global policies only).
    unmatched_chain: Vec<Middleware>,
    route_count: usize,
}

impl RouteTable {
    pub fn new(config: &GatewayConfig, ctx: &ChainContext) -> Self {
        let mut exact_hosts: HashMap<String, HostEntry> = HashMap::new();
        let mut wildcard_hosts: HashMap<String, HostEntry> = HashMap::new();
        let mut any_host = HostEntry::new();
        let mut count = 0;

        for route_cfg in &config.routes {
            let compiled = Arc::new(compile_route(route_cfg, ctx));
            count += 1;
            tracing::debug!(
                "routing: compiled route, id={}, path={}, match={}, priority={}",
                route_cfg.id,
                route_cfg.path,
                route_cfg.path_match,
                route_cfg.priority,
            );

            if route_cfg.hosts.is_empty() {
                any_host.insert(route_cfg, compiled.clone());
                continue;
            }
            for host in &route_cfg.hosts {
                if host.contains('*') {
                    wildcard_hosts
                        .entry(host.clone())
                        .or_insert_with(HostEntry::new)
                        .insert(route_cfg, compiled.clone());
                } else {
                    exact_hosts
                        .entry(host.to_ascii_lowercase())
                        .or_insert_with(HostEntry::new)
                        .insert(route_cfg, compiled.clone());
                }
            }
        }

        for entry in exact_hosts.values_mut() {
            entry.finish();
        }
        let mut wildcard_hosts: Vec<(String, HostEntry)> = wildcard_hosts.into_iter().collect();
        for (_, entry) in wildcard_hosts.iter_mut() {
            entry.finish();
        }
        any_host.finish();

        tracing::info!("routing: compiled route table, count={}", count);

        Self {
            exact_hosts,
            wildcard_hosts,
            any_host,
            unmatched_chain: build_unmatched_chain(ctx),
            route_count: count,
        }
    }

    /// Match a request. Lookup order: exact host → wildcard host → any-host.
    pub fn match_route(
        &self,
        host: &str,
        path: &str,
        method: &str,
        headers: &http::HeaderMap,
        query: &[(String, String)],
    ) -> Option<Arc<CompiledRoute>> {
        let method_upper = method.to_uppercase();
        let req_host = host.split(':').next().unwrap_or(host);
        let req_host_lower = req_host.to_ascii_lowercase();

        if let Some(entry) = self.exact_hosts.get(&req_host_lower) {
            if let Some(route) = entry.match_route(path, &method_upper, headers, query) {
                return Some(route);
            }
        }

        for (pattern, entry) in &self.wildcard_hosts {
            if host_matches(req_host, pattern) {
                if let Some(route) = entry.match_route(path, &method_upper, headers, query) {
                    return Some(route);
                }
            }
        }

        self.any_host
            .match_route(path, &method_upper, headers, query)
    }

    pub fn unmatched_chain(&self) -> &[Middleware] {
        &self.unmatched_chain
    }

    pub fn route_count(&self) -> usize {
        self.route_count
    }
}

fn compile_route(cfg: &RouteConfig, ctx: &ChainContext) -> CompiledRoute {
    let methods: Vec<String> = cfg.methods.iter().map(|m| m.to_uppercase()).collect();
    let header_predicates: Vec<(String, String)> = cfg
        .headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect();
    let query_predicates: Vec<(String, String)> = cfg
        .query
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let breaker_cfg = cfg
        .circuit_breaker
        .as_ref()
        .unwrap_or(&ctx.config.circuit_breaker);
    let breaker = breaker_cfg.enabled.then(|| Arc::new(breaker_cfg.clone()));

    CompiledRoute {
        id: cfg.id.clone(),
        path: cfg.path.clone(),
        priority: cfg.priority,
        methods,
        header_predicates,
        query_predicates,
        upstream_id: cfg.upstream.clone(),
        timeout: cfg.timeout_ms.map(Duration::from_millis),
        retries: cfg.retries.unwrap_or(0),
        chain: build_route_chain(cfg, ctx),
        breaker,
    }
}

/// Match a request host against a route host pattern.
/// `*.example.com` is a suffix wildcard; anything else is case-insensitive
/// exact.
fn host_matches(req_host: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        req_host.len() >= suffix.len()
            && req_host[req_host.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
    } else {
        req_host.eq_ignore_ascii_case(pattern)
    }
}

/// Parse a raw query string into key/value pairs. Duplicate keys are kept in
/// order; values are not percent-decoded (predicates compare raw text).
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| {
            let mut it = pair.splitn(2, '=');
            (
                it.next().unwrap_or("").to_string(),
                it.next().unwrap_or("").to_string(),
            )
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::test_chain_context;

    fn table_from_yaml(yaml: &str) -> RouteTable {
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        let ctx = test_chain_context(&config);
        RouteTable::new(&config, &ctx)
    }

    fn empty_headers() -> http::HeaderMap {
        http::HeaderMap::new()
    }

    #[test]
    fn test_exact_path_over_prefix() {
        let table = table_from_yaml(
            r#"
routes:
  - id: catchall
    path: /
    upstream: u
  - id: specific
    path: /v1/users/profile
    path_match: exact
    upstream: u
upstreams:
  - id: u
    targets: [{host: h, port: 80}]
"#,
        );
        let m = table
            .match_route("any.com", "/v1/users/profile", "POST", &empty_headers(), &[])
            .unwrap();
        assert_eq!(m.id, "specific");

        let m = table
            .match_route("any.com", "/v1/other", "GET", &empty_headers(), &[])
            .unwrap();
        assert_eq!(m.id, "catchall");
    }

    #[test]
    fn test_host_partitioning() {
        let table = table_from_yaml(
            r#"
routes:
  - id: host-a
    hosts: [a.example.com]
    path: /
    upstream: u
  - id: host-b
    hosts: [b.example.com]
    path: /
    upstream: u
upstreams:
  - id: u
    targets: [{host: h, port: 80}]
"#,
        );
        assert_eq!(
            table
                .match_route("a.example.com", "/foo", "GET", &empty_headers(), &[])
                .unwrap()
                .id,
            "host-a"
        );
        assert_eq!(
            table
                .match_route("b.example.com:8080", "/foo", "GET", &empty_headers(), &[])
                .unwrap()
                .id,
            "host-b"
        );
        assert!(table
            .match_route("c.example.com", "/foo", "GET", &empty_headers(), &[])
            .is_none());
    }

    #[test]
    fn test_wildcard_host() {
        let table = table_from_yaml(
            r#"
routes:
  - id: wild
    hosts: ["*.example.com"]
    path: /
    upstream: u
upstreams:
  - id: u
    targets: [{host: h, port: 80}]
"#,
        );
        assert!(table
            .match_route("api.example.com", "/x", "GET", &empty_headers(), &[])
            .is_some());
        assert!(table
            .match_route("cdn.Example.COM", "/x", "GET", &empty_headers(), &[])
            .is_some());
        assert!(table
            .match_route("other.test.com", "/x", "GET", &empty_headers(), &[])
            .is_none());
    }

    #[test]
    fn test_priority_then_id_tiebreak() {
        let table = table_from_yaml(
            r#"
routes:
  - id: low
    path: /api
    priority: 0
    upstream: u
  - id: zz-high
    path: /api
    priority: 10
    upstream: u
  - id: aa-high
    path: /api
    priority: 10
    upstream: u
upstreams:
  - id: u
    targets: [{host: h, port: 80}]
"#,
        );
        let m = table
            .match_route("any.com", "/api/x", "GET", &empty_headers(), &[])
            .unwrap();
        // Highest priority wins; the lexicographically smaller id breaks the tie.
        assert_eq!(m.id, "aa-high");
    }

    #[test]
    fn test_method_filter() {
        let table = table_from_yaml(
            r#"
routes:
  - id: post-only
    path: /api/submit
    path_match: exact
    methods: [POST]
    upstream: u
  - id: catchall
    path: /
    upstream: u
upstreams:
  - id: u
    targets: [{host: h, port: 80}]
"#,
        );
        assert_eq!(
            table
                .match_route("h", "/api/submit", "post", &empty_headers(), &[])
                .unwrap()
                .id,
            "post-only"
        );
        assert_eq!(
            table
                .match_route("h", "/api/submit", "GET", &empty_headers(), &[])
                .unwrap()
                .id,
            "catchall"
        );
    }

    #[test]
    fn test_header_predicate() {
        let table = table_from_yaml(
            r#"
routes:
  - id: v2
    path: /api
    priority: 10
    headers:
      X-Api-Version: "2"
    upstream: u
  - id: default
    path: /api
    upstream: u
upstreams:
  - id: u
    targets: [{host: h, port: 80}]
"#,
        );
        let mut headers = http::HeaderMap::new();
        headers.insert("x-api-version", "2".parse().unwrap());
        assert_eq!(
            table
                .match_route("h", "/api/x", "GET", &headers, &[])
                .unwrap()
                .id,
            "v2"
        );
        assert_eq!(
            table
                .match_route("h", "/api/x", "GET", &empty_headers(), &[])
                .unwrap()
                .id,
            "default"
        );
    }

    #[test]
    fn test_query_predicate() {
        let table = table_from_yaml(
            r#"
routes:
  - id: debug
    path: /api
    priority: 5
    query:
      debug: "1"
    upstream: u
  - id: normal
    path: /api
    upstream: u
upstreams:
  - id: u
    targets: [{host: h, port: 80}]
"#,
        );
        let query = parse_query("debug=1&x=2");
        assert_eq!(
            table
                .match_route("h", "/api", "GET", &empty_headers(), &query)
                .unwrap()
                .id,
            "debug"
        );
        assert_eq!(
            table
                .match_route("h", "/api", "GET", &empty_headers(), &[])
                .unwrap()
                .id,
            "normal"
        );
    }

    #[test]
    fn test_regex_route() {
        let table = table_from_yaml(
            r#"
routes:
  - id: rx
    path: "^/users/\\d+$"
    path_match: regex
    upstream: u
upstreams:
  - id: u
    targets: [{host: h, port: 80}]
"#,
        );
        assert!(table
            .match_route("h", "/users/123", "GET", &empty_headers(), &[])
            .is_some());
        assert!(table
            .match_route("h", "/users/abc", "GET", &empty_headers(), &[])
            .is_none());
    }

    #[test]
    fn test_trie_beats_regex() {
        let table = table_from_yaml(
            r#"
routes:
  - id: rx
    path: "^/users/.*"
    path_match: regex
    priority: 100
    upstream: u
  - id: prefix
    path: /users
    upstream: u
upstreams:
  - id: u
    targets: [{host: h, port: 80}]
"#,
        );
        // Trie rules resolve first; regex is the fallback list.
        assert_eq!(
            table
                .match_route("h", "/users/123", "GET", &empty_headers(), &[])
                .unwrap()
                .id,
            "prefix"
        );
    }

    #[test]
    fn test_no_route_returns_none() {
        let table = table_from_yaml(
            r#"
routes:
  - id: only
    path: /api
    path_match: exact
    upstream: u
upstreams:
  - id: u
    targets: [{host: h, port: 80}]
"#,
        );
        assert!(table
            .match_route("h", "/other", "GET", &empty_headers(), &[])
            .is_none());
        assert_eq!(table.route_count(), 1);
    }

    #[test]
    fn test_exact_host_checked_before_wildcard() {
        let table = table_from_yaml(
            r#"
routes:
  - id: wild
    hosts: ["*.example.com"]
    path: /
    upstream: u
  - id: exact
    hosts: [api.example.com]
    path: /
    upstream: u
upstreams:
  - id: u
    targets: [{host: h, port: 80}]
"#,
        );
        assert_eq!(
            table
                .match_route("api.example.com", "/x", "GET", &empty_headers(), &[])
                .unwrap()
                .id,
            "exact"
        );
        assert_eq!(
            table
                .match_route("cdn.example.com", "/x", "GET", &empty_headers(), &[])
                .unwrap()
                .id,
            "wild"
        );
    }

    #[test]
    fn test_parse_query() {
        let q = parse_query("a=1&b=&c&a=2");
        assert_eq!(
            q,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "".to_string()),
                ("c".to_string(), "".to_string()),
                ("a".to_string(), "2".to_string()),
            ]
        );
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn test_route_timeout_and_retries_compiled() {
        let table = table_from_yaml(
            r#"
routes:
  - id: r
    path: /api
    upstream: u
    timeout_ms: 1500
    retries: 2
upstreams:
  - id: u
    targets: [{host: h, port: 80}]
"#,
        );
        let m = table
            .match_route("h", "/api", "GET", &empty_headers(), &[])
            .unwrap();
        assert_eq!(m.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(m.retries, 2);
    }
}
