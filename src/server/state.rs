use crate::config::GatewayConfig;
use crate::middleware::{ChainContext, RateLimiter};
use crate::routing::RouteTable;
use crate::upstream::{BreakerRegistry, CanaryGroups, Upstream, UpstreamStore};
use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Shared gateway state, cheaply cloneable.
///
/// Readers (`RouteTable`, `CanaryGroups`, the config itself) are published
/// via `ArcSwap` so every request observes exactly one snapshot. The rate
/// limiter and breaker registry are long-lived: their counters survive
/// snapshot swaps. All snapshot applications are serialized through
/// `apply_mu` so concurrent reloads cannot interleave their writes.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub route_table: Arc<ArcSwap<RouteTable>>,
    pub upstreams: UpstreamStore,
    pub canary: Arc<ArcSwap<CanaryGroups>>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<BreakerRegistry>,
    apply_mu: Arc<Mutex<()>>,
}

impl GatewayState {
    pub fn new(initial: Arc<GatewayConfig>) -> Self {
        let limiter = Arc::new(RateLimiter::new());
        let breakers = Arc::new(BreakerRegistry::new());
        let upstreams = UpstreamStore::new();

        let state = Self {
            config: Arc::new(ArcSwap::new(initial.clone())),
            route_table: Arc::new(ArcSwap::from_pointee(RouteTable::new(
                &GatewayConfig::default(),
                &ChainContext {
                    config: Arc::new(GatewayConfig::default()),
                    limiter: limiter.clone(),
                    breakers: breakers.clone(),
                },
            ))),
            upstreams,
            canary: Arc::new(ArcSwap::from_pointee(CanaryGroups::build(
                &GatewayConfig::default(),
            ))),
            limiter,
            breakers,
            apply_mu: Arc::new(Mutex::new(())),
        };
        state.rebuild(&initial);
        state
    }

    /// Swap in a validated snapshot. Upstream runtime state (target health,
    /// breaker state, rate-limit counters) is preserved where the new
    /// snapshot still references it.
    pub async fn apply_snapshot(&self, snapshot: Arc<GatewayConfig>) {
        let _guard = self.apply_mu.lock().await;
        self.rebuild(&snapshot);
        info!(
            "config: snapshot applied, routes={}, upstreams={}, canary_groups={}",
            snapshot.routes.len(),
            snapshot.upstreams.len(),
            self.canary.load().len(),
        );
    }

    fn rebuild(&self, snapshot: &Arc<GatewayConfig>) {
        // Upstreams first so a request racing the swap never sees a route
        // pointing at an upstream that has not been registered yet.
        self.upstreams.sync(
            &snapshot.upstreams,
            &snapshot.proxy,
            &snapshot.load_balancer.algorithm,
        );
        self.canary
            .store(Arc::new(CanaryGroups::build(snapshot)));

        let chain_ctx = ChainContext {
            config: snapshot.clone(),
            limiter: self.limiter.clone(),
            breakers: self.breakers.clone(),
        };
        let table = RouteTable::new(snapshot, &chain_ctx);
        metrics::gauge!("stargate_config_routes_total").set(table.route_count() as f64);
        self.route_table.store(Arc::new(table));

        let active_routes: std::collections::HashSet<String> =
            snapshot.routes.iter().map(|r| r.id.clone()).collect();
        self.breakers.retain_routes(&active_routes);

        self.config.store(snapshot.clone());
    }

    /// Resolve a route's upstream reference: a canary group id selects a
    /// version first (healthy versions only), a plain id goes straight to
    /// the store.
    pub fn resolve_upstream(
        &self,
        upstream_id: &str,
        headers: &http::HeaderMap,
        query: &[(String, String)],
    ) -> Option<Upstream> {
        let canary = self.canary.load();
        if let Some(group) = canary.get(upstream_id) {
            let version = group.select_version(headers, query, |id| {
                self.upstreams
                    .get(id)
                    .map(|u| u.has_selectable_target())
                    .unwrap_or(false)
            })?;
            return self.upstreams.get(&version.upstream_id);
        }
        self.upstreams.get(upstream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(yaml: &str) -> Arc<GatewayConfig> {
        Arc::new(serde_yaml::from_str(yaml).unwrap())
    }

    fn base() -> Arc<GatewayConfig> {
        snapshot(
            r#"
routes:
  - id: r1
    path: /api
    upstream: backend
upstreams:
  - id: backend
    targets: [{host: 127.0.0.1, port: 9000}]
"#,
        )
    }

    #[tokio::test]
    async fn test_initial_build() {
        let state = GatewayState::new(base());
        assert_eq!(state.route_table.load().route_count(), 1);
        assert_eq!(state.upstreams.len(), 1);
        assert!(state
            .resolve_upstream("backend", &http::HeaderMap::new(), &[])
            .is_some());
    }

    #[tokio::test]
    async fn test_snapshot_swap_is_atomic_per_reader() {
        let state = GatewayState::new(base());
        let old_table = state.route_table.load_full();

        state
            .apply_snapshot(snapshot(
                r#"
routes:
  - id: r2
    path: /new
    upstream: backend2
upstreams:
  - id: backend2
    targets: [{host: 127.0.0.1, port: 9001}]
"#,
            ))
            .await;

        // A reader holding the old table still sees the complete old world;
        // new loads see the complete new one.
        assert!(old_table
            .match_route("h", "/api/x", "GET", &http::HeaderMap::new(), &[])
            .is_some());
        let new_table = state.route_table.load();
        assert!(new_table
            .match_route("h", "/api/x", "GET", &http::HeaderMap::new(), &[])
            .is_none());
        assert!(new_table
            .match_route("h", "/new", "GET", &http::HeaderMap::new(), &[])
            .is_some());
        assert!(state.upstreams.get("backend").is_none());
    }

    #[tokio::test]
    async fn test_reload_preserves_target_health() {
        let state = GatewayState::new(base());
        let up = state.upstreams.get("backend").unwrap();
        up.targets()[0].set_healthy(false);

        state.apply_snapshot(base()).await;

        let up = state.upstreams.get("backend").unwrap();
        assert!(!up.targets()[0].is_healthy());
    }

    #[tokio::test]
    async fn test_breakers_pruned_for_dropped_routes() {
        let state = GatewayState::new(base());
        let cb = crate::config::CircuitBreakerConfig {
            enabled: true,
            ..Default::default()
        };
        state.breakers.check("r1", &cb);
        state.breakers.check("gone", &cb);

        state.apply_snapshot(base()).await;
        assert!(state.breakers.snapshot("r1").is_some());
        assert!(state.breakers.snapshot("gone").is_none());
    }

    #[tokio::test]
    async fn test_resolve_canary_group() {
        let state = GatewayState::new(snapshot(
            r#"
routes:
  - id: r
    path: /
    upstream: group
upstreams:
  - id: v1
    canary: {group: group, version: v1, weight: 100}
    targets: [{host: a, port: 80}]
  - id: v2
    canary: {group: group, version: v2, weight: 0}
    targets: [{host: b, port: 80}]
"#,
        ));
        let up = state
            .resolve_upstream("group", &http::HeaderMap::new(), &[])
            .unwrap();
        assert_eq!(up.id(), "v1");
    }

    #[tokio::test]
    async fn test_resolve_canary_all_unhealthy_fails() {
        let state = GatewayState::new(snapshot(
            r#"
routes:
  - id: r
    path: /
    upstream: group
upstreams:
  - id: v1
    canary: {group: group, version: v1, weight: 100}
    targets: [{host: a, port: 80}]
"#,
        ));
        let up = state.upstreams.get("v1").unwrap();
        up.targets()[0].set_healthy(false);
        assert!(state
            .resolve_upstream("group", &http::HeaderMap::new(), &[])
            .is_none());
    }

    #[tokio::test]
    async fn test_resolve_unknown_upstream() {
        let state = GatewayState::new(base());
        assert!(state
            .resolve_upstream("nope", &http::HeaderMap::new(), &[])
            .is_none());
    }
}
