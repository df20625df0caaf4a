pub mod auth;
pub mod cors;
pub mod header_transform;
pub mod ip_acl;
pub mod mock;
pub mod placeholder;
pub mod rate_limit;

pub use rate_limit::RateLimiter;

use crate::config::{CircuitBreakerConfig, GatewayConfig, RateLimitConfig, RouteConfig};
use crate::proxy::context::{BoxBody, RequestContext};
use crate::upstream::circuit_breaker::{BreakerDecision, BreakerRegistry, BreakerSnapshot};
use auth::AuthPolicy;
use cors::{CorsOutcome, CorsPolicy};
use header_transform::HeaderTransformPolicy;
use http::{HeaderValue, Response, StatusCode};
use ip_acl::{AclDecision, IpAclPolicy};
use mock::MockPolicy;
use std::sync::Arc;

/// Everything chain compilation needs besides the route itself. The limiter
/// and breaker registry outlive config reloads so counters and breaker
/// state survive snapshot swaps.
pub struct ChainContext {
    pub config: Arc<GatewayConfig>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<BreakerRegistry>,
}

/// Result of a middleware's request pass.
pub enum MiddlewareResult {
    Continue,
    /// Short-circuit with a final response (mock, rate-limit reject,
    /// circuit-open, IP block, auth fail, CORS preflight).
    Respond(Response<BoxBody>),
}

/// Enum-based middleware — static dispatch, exhaustive match.
///
/// Chains are pre-built when routes are compiled (at config load /
/// hot-reload time), NOT per request. Fixed outer-to-inner order:
/// IP-ACL → CORS → Auth → Rate-Limit → Circuit-Breaker →
/// Header-Transform → Mock → (terminal: proxy). The response pass runs in
/// reverse order of entry.
pub enum Middleware {
    IpAcl(IpAclPolicy),
    Cors(CorsPolicy),
    Auth(AuthPolicy),
    RateLimit {
        config: RateLimitConfig,
        /// Bucket scope: the route id for per-route overrides, `_global`
        /// for the shared global policy.
        scope: String,
        limiter: Arc<RateLimiter>,
    },
    CircuitBreaker {
        config: Arc<CircuitBreakerConfig>,
        registry: Arc<BreakerRegistry>,
    },
    HeaderTransform(HeaderTransformPolicy),
    Mock(MockPolicy),
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Middleware::IpAcl(_) => "IpAcl",
            Middleware::Cors(_) => "Cors",
            Middleware::Auth(_) => "Auth",
            Middleware::RateLimit { .. } => "RateLimit",
            Middleware::CircuitBreaker { .. } => "CircuitBreaker",
            Middleware::HeaderTransform(_) => "HeaderTransform",
            Middleware::Mock(_) => "Mock",
        };
        f.write_str(name)
    }
}

impl Middleware {
    /// Request pass. May mutate the outbound header map and the context.
    pub async fn on_request(
        &self,
        ctx: &mut RequestContext,
        headers: &mut http::HeaderMap,
    ) -> MiddlewareResult {
        match self {
            Middleware::IpAcl(policy) => match policy.evaluate(ctx.client_ip) {
                AclDecision::Allow => MiddlewareResult::Continue,
                AclDecision::Deny(reason) => {
                    metrics::counter!(
                        "stargate_ip_acl_blocked_total",
                        "reason" => reason,
                    )
                    .increment(1);
                    tracing::debug!(
                        "ip_acl: blocked, client={}, reason={}",
                        ctx.client_ip,
                        reason
                    );
                    let mut resp = ctx.error_response(StatusCode::FORBIDDEN, "forbidden");
                    resp.headers_mut()
                        .insert("x-blocked-by", HeaderValue::from_static("IP-ACL"));
                    if let Ok(v) = HeaderValue::from_str(reason) {
                        resp.headers_mut().insert("x-blocked-reason", v);
                    }
                    MiddlewareResult::Respond(resp)
                }
            },
            Middleware::Cors(policy) => match policy.apply(ctx, headers) {
                CorsOutcome::NotCors => MiddlewareResult::Continue,
                CorsOutcome::Allowed { origin } => {
                    ctx.cors_origin = Some(origin);
                    MiddlewareResult::Continue
                }
                CorsOutcome::Preflight(resp) => MiddlewareResult::Respond(resp),
                CorsOutcome::Rejected(resp) => MiddlewareResult::Respond(resp),
            },
            Middleware::Auth(policy) => match policy.apply(ctx, headers) {
                Some(resp) => MiddlewareResult::Respond(resp),
                None => MiddlewareResult::Continue,
            },
            Middleware::RateLimit {
                config,
                scope,
                limiter,
            } => {
                let identifier = RateLimiter::extract_identifier(config, ctx, headers);
                let key = format!("{scope}:{identifier}");
                let (allowed, quota) = limiter.allow(config, &key).await;
                ctx.quota = Some(quota.clone());

                if allowed {
                    metrics::counter!(
                        "stargate_rate_limit_allowed_total",
                        "route" => ctx.route_id.clone(),
                    )
                    .increment(1);
                    return MiddlewareResult::Continue;
                }
                metrics::counter!(
                    "stargate_rate_limit_rejected_total",
                    "route" => ctx.route_id.clone(),
                )
                .increment(1);
                tracing::debug!(
                    "rate_limit: rejected, route={}, identifier={}",
                    ctx.route_id,
                    identifier
                );
                let mut resp =
                    ctx.error_response(StatusCode::TOO_MANY_REQUESTS, "too many requests");
                set_quota_headers(resp.headers_mut(), &quota);
                MiddlewareResult::Respond(resp)
            }
            Middleware::CircuitBreaker { config, registry } => {
                match registry.check(&ctx.route_id, config) {
                    BreakerDecision::Allow => MiddlewareResult::Continue,
                    BreakerDecision::Probe => {
                        ctx.breaker_probe = true;
                        MiddlewareResult::Continue
                    }
                    BreakerDecision::Reject(snapshot) => {
                        metrics::counter!(
                            "stargate_circuit_breaker_rejected_total",
                            "route" => ctx.route_id.clone(),
                        )
                        .increment(1);
                        let mut resp = ctx
                            .error_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable");
                        set_breaker_headers(resp.headers_mut(), &ctx.route_id, &snapshot);
                        MiddlewareResult::Respond(resp)
                    }
                }
            }
            Middleware::HeaderTransform(policy) => {
                policy.request.apply(ctx, headers);
                MiddlewareResult::Continue
            }
            Middleware::Mock(policy) => match policy.apply(ctx, headers) {
                Some(resp) => MiddlewareResult::Respond(resp),
                None => MiddlewareResult::Continue,
            },
        }
    }

    /// Response pass, run in reverse order of entry over the final response
    /// (served or short-circuited).
    pub fn on_response(&self, ctx: &RequestContext, resp: &mut Response<BoxBody>) {
        match self {
            Middleware::Cors(policy) => {
                if let Some(ref origin) = ctx.cors_origin {
                    policy.decorate_response(origin, resp);
                }
            }
            Middleware::RateLimit { .. } => {
                if let Some(ref quota) = ctx.quota {
                    set_quota_headers(resp.headers_mut(), quota);
                }
            }
            Middleware::CircuitBreaker { registry, .. } => {
                if let Some(snapshot) = registry.snapshot(&ctx.route_id) {
                    set_breaker_headers(resp.headers_mut(), &ctx.route_id, &snapshot);
                }
            }
            Middleware::HeaderTransform(policy) => {
                let mut headers = std::mem::take(resp.headers_mut());
                policy.response.apply(ctx, &mut headers);
                *resp.headers_mut() = headers;
            }
            Middleware::IpAcl(_) | Middleware::Auth(_) | Middleware::Mock(_) => {}
        }
    }
}

fn set_quota_headers(headers: &mut http::HeaderMap, quota: &rate_limit::QuotaInfo) {
    let set = |headers: &mut http::HeaderMap, name: &'static str, value: u64| {
        let mut buf = itoa::Buffer::new();
        if let Ok(v) = HeaderValue::from_str(buf.format(value)) {
            headers.insert(name, v);
        }
    };
    set(headers, "x-ratelimit-limit", quota.limit);
    set(headers, "x-ratelimit-remaining", quota.remaining);
    set(headers, "x-ratelimit-reset", quota.reset_secs);
    set(headers, "x-ratelimit-window", quota.window_secs);
}

fn set_breaker_headers(headers: &mut http::HeaderMap, route_id: &str, snap: &BreakerSnapshot) {
    headers.insert(
        "x-circuit-breaker-state",
        HeaderValue::from_static(snap.state.as_str()),
    );
    if let Ok(v) = HeaderValue::from_str(route_id) {
        headers.insert("x-circuit-breaker-name", v);
    }
    if let Ok(v) = HeaderValue::from_str(&format!("{:.2}", snap.error_rate)) {
        headers.insert("x-circuit-breaker-error-rate", v);
    }
    let mut buf = itoa::Buffer::new();
    if let Ok(v) = HeaderValue::from_str(buf.format(snap.failed)) {
        headers.insert("x-circuit-breaker-failed-requests", v);
    }
    if let Ok(v) = HeaderValue::from_str(buf.format(snap.total)) {
        headers.insert("x-circuit-breaker-total-requests", v);
    }
}

/// Build the effective chain for a route: per-route middleware config
/// supersedes the global one, middleware by middleware.
pub fn build_route_chain(route: &RouteConfig, ctx: &ChainContext) -> Vec<Middleware> {
    build_chain(Some(route), ctx)
}

/// Chain for requests that match no route: global policies still apply
/// before the 404 is emitted.
pub fn build_unmatched_chain(ctx: &ChainContext) -> Vec<Middleware> {
    build_chain(None, ctx)
}

fn build_chain(route: Option<&RouteConfig>, ctx: &ChainContext) -> Vec<Middleware> {
    let global = &ctx.config;
    let mut chain = Vec::new();

    if let Some(acl) = global.ip_acl.as_ref().filter(|a| a.enabled) {
        chain.push(Middleware::IpAcl(IpAclPolicy::new(acl)));
    }

    let cors = route
        .and_then(|r| r.cors.as_ref())
        .or(global.cors.as_ref());
    if let Some(cors) = cors.filter(|c| c.enabled) {
        chain.push(Middleware::Cors(CorsPolicy::new(cors)));
    }

    if global.auth.enabled {
        chain.push(Middleware::Auth(AuthPolicy::new(&global.auth)));
    }

    let (rl, scope) = match route.and_then(|r| r.rate_limit.as_ref()) {
        Some(rl) => (Some(rl), route.map(|r| r.id.as_str()).unwrap_or("_global")),
        None => (Some(&global.rate_limit), "_global"),
    };
    if let Some(rl) = rl.filter(|rl| rl.enabled) {
        chain.push(Middleware::RateLimit {
            config: rl.clone(),
            scope: scope.to_string(),
            limiter: ctx.limiter.clone(),
        });
    }

    if let Some(route) = route {
        let breaker = route
            .circuit_breaker
            .as_ref()
            .unwrap_or(&global.circuit_breaker);
        if breaker.enabled {
            chain.push(Middleware::CircuitBreaker {
                config: Arc::new(breaker.clone()),
                registry: ctx.breakers.clone(),
            });
        }
    }

    let transform = route
        .and_then(|r| r.header_transform.as_ref())
        .or(global.header_transform.as_ref());
    if let Some(transform) = transform {
        let policy = HeaderTransformPolicy::new(transform);
        if !policy.request.is_empty() || !policy.response.is_empty() {
            chain.push(Middleware::HeaderTransform(policy));
        }
    }

    let mock = route
        .and_then(|r| r.mock_response.as_ref())
        .or(global.mock_response.as_ref());
    if let Some(mock) = mock.filter(|m| m.enabled) {
        chain.push(Middleware::Mock(MockPolicy::new(mock)));
    }

    chain
}

#[cfg(test)]
pub fn test_chain_context(config: &GatewayConfig) -> ChainContext {
    ChainContext {
        config: Arc::new(config.clone()),
        limiter: Arc::new(RateLimiter::new()),
        breakers: Arc::new(BreakerRegistry::new()),
    }
}
