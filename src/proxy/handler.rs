use crate::error::GatewayError;
use crate::middleware::{ip_acl, Middleware, MiddlewareResult};
use crate::proxy::context::{empty_body, full_body, BoxBody, RequestContext};
use crate::routing::{parse_query, CompiledRoute};
use crate::server::GatewayState;
use crate::upstream::{Target, Upstream};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Statuses that trigger a retry against a different target when the route
/// has retries configured.
const RETRYABLE_STATUSES: &[u16] = &[502, 503, 504];

/// Handle an incoming HTTP request through a phased lifecycle:
///
/// 1. ROUTE_MATCH — resolve the route (and its effective middleware chain)
/// 2. ON_REQUEST  — chain in fixed order; any middleware may short-circuit
/// 3. UPSTREAM    — canary/upstream resolution, target selection, proxying
/// 4. ON_RESPONSE — chain in reverse order of entry
/// 5. LOG         — access log + metrics
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let uri_path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();
    let query = parse_query(req.uri().query().unwrap_or(""));
    let mut req_headers = req.headers().clone();

    let client_ip = ip_acl::client_ip(&req_headers, peer_addr.ip());
    let mut ctx = RequestContext::new(host, uri_path, method, query, client_ip);

    // `load_full` so no swap guard is held across the awaits below.
    let table = state.route_table.load_full();
    let route = table.match_route(
        &ctx.host,
        &ctx.uri_path,
        &ctx.method,
        &req_headers,
        &ctx.query,
    );

    let chain: &[Middleware] = match &route {
        Some(r) => {
            ctx.route_id = r.id.clone();
            ctx.route = Some(r.clone());
            &r.chain
        }
        None => table.unmatched_chain(),
    };

    metrics::gauge!(
        "stargate_http_requests_in_flight",
        "route" => ctx.route_id.clone(),
    )
    .increment(1.0);

    // Request pass — stop at the first middleware that answers directly.
    let mut entered = 0;
    for middleware in chain {
        match middleware.on_request(&mut ctx, &mut req_headers).await {
            MiddlewareResult::Continue => entered += 1,
            MiddlewareResult::Respond(resp) => {
                // A probe slot taken by the breaker must not leak when a
                // later middleware short-circuits.
                if ctx.breaker_probe && !ctx.upstream_attempted {
                    state.breakers.release_probe(&ctx.route_id);
                }
                return Ok(finish(&ctx, chain, entered, resp));
            }
        }
    }

    let Some(route) = route.as_ref() else {
        debug!(
            "proxy: no route matched, host={}, path={}",
            ctx.host, ctx.uri_path
        );
        let resp = ctx.error_response(
            StatusCode::NOT_FOUND,
            GatewayError::NoRouteMatch.public_message(),
        );
        return Ok(finish(&ctx, chain, entered, resp));
    };

    // Terminal stage: resolve the upstream (canary groups select a version
    // first) and proxy.
    let Some(upstream) = state.resolve_upstream(&route.upstream_id, &req_headers, &ctx.query)
    else {
        warn!(
            "proxy: no upstream available, route={}, upstream={}",
            ctx.route_id, route.upstream_id
        );
        if ctx.breaker_probe {
            state.breakers.release_probe(&ctx.route_id);
        }
        let err = GatewayError::NoHealthyTarget;
        let resp = ctx.error_response(err.status(), err.public_message());
        return Ok(finish(&ctx, chain, entered, resp));
    };

    let result = proxy_upstream(req, &mut ctx, route, &upstream, &req_headers, &state).await;

    // Feed the breaker from the upstream outcome; 2xx is success, everything
    // else (4xx/5xx and transport errors) is failure.
    if let Some(ref breaker_cfg) = route.breaker {
        if ctx.upstream_attempted {
            let success = match &result {
                Ok((resp, _)) => resp.status().is_success(),
                Err(_) => false,
            };
            state.breakers.record(&ctx.route_id, breaker_cfg, success);
        } else if ctx.breaker_probe {
            state.breakers.release_probe(&ctx.route_id);
        }
    }

    let resp = match result {
        Ok((upstream_resp, upstream_elapsed)) => {
            let resp = build_downstream_response(upstream_resp);
            debug!(
                "proxy: upstream responded, route={}, upstream={}, status={}, elapsed_ms={}",
                ctx.route_id,
                ctx.upstream_addr,
                resp.status(),
                upstream_elapsed.as_millis(),
            );
            resp
        }
        Err(resp) => resp,
    };

    Ok(finish(&ctx, chain, entered, resp))
}

/// Response pass + single exit point: reverse the entered middlewares,
/// stamp identity headers, record the access log and final metrics. Metrics
/// are recorded here and only here, so short-circuit and error paths count
/// exactly once.
fn finish(
    ctx: &RequestContext,
    chain: &[Middleware],
    entered: usize,
    mut resp: Response<BoxBody>,
) -> Response<BoxBody> {
    for middleware in chain[..entered].iter().rev() {
        middleware.on_response(ctx, &mut resp);
    }

    resp.headers_mut().insert(
        http::header::SERVER,
        HeaderValue::from_static(concat!("Stargate/", env!("CARGO_PKG_VERSION"))),
    );
    if !resp.headers().contains_key("x-request-id") {
        if let Ok(v) = HeaderValue::from_str(&ctx.request_id) {
            resp.headers_mut().insert("x-request-id", v);
        }
    }

    let status = resp.status().as_u16();
    if let Some(size) = resp
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
    {
        metrics::histogram!(
            "stargate_http_response_size_bytes",
            "route" => ctx.route_id.clone(),
        )
        .record(size);
    }

    ctx.finalize_metrics(status);
    metrics::gauge!(
        "stargate_http_requests_in_flight",
        "route" => ctx.route_id.clone(),
    )
    .decrement(1.0);

    // Structured access log — one line per request at info level.
    tracing::info!(
        request_id = %ctx.request_id,
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        host = %ctx.host,
        path = %ctx.uri_path,
        status = status,
        route = %ctx.route_id,
        upstream = %ctx.upstream_addr,
        latency_ms = %ctx.start.elapsed().as_millis(),
        "access"
    );

    resp
}

/// Upstream leg: target selection and forwarding with bounded retries.
/// All attempts share one wall-clock budget so retries cannot multiply the
/// configured timeout.
async fn proxy_upstream(
    req: Request<Incoming>,
    ctx: &mut RequestContext,
    route: &Arc<CompiledRoute>,
    upstream: &Upstream,
    transformed_headers: &http::HeaderMap,
    state: &GatewayState,
) -> Result<(Response<Incoming>, std::time::Duration), Response<BoxBody>> {
    let config = state.config.load_full();
    let max_retries = route.retries;

    let req_method = req.method().clone();
    let req_uri_pq: String = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let (_, body) = req.into_parts();

    // With retries the body must be replayable, so buffer it; without,
    // stream it through untouched.
    let (body_bytes, mut streaming_body): (Option<Bytes>, Option<BoxBody>) = if max_retries > 0 {
        match body.collect().await {
            Ok(collected) => (Some(collected.to_bytes()), None),
            Err(e) => {
                warn!(
                    "proxy: failed to read request body, route={}, error={}",
                    ctx.route_id, e
                );
                return Err(ctx.error_response(StatusCode::BAD_REQUEST, "bad request"));
            }
        }
    } else {
        (None, Some(body.boxed()))
    };

    // Route timeout overrides the global send+read budget.
    let total_budget = route.timeout.unwrap_or_else(|| {
        std::time::Duration::from_secs_f64(
            config.proxy.send_timeout_secs + config.proxy.read_timeout_secs,
        )
    });
    let deadline = Instant::now() + total_budget;

    let mut upstream_uri = String::with_capacity(40 + req_uri_pq.len());
    let mut tried: Vec<String> = Vec::new();
    let mut last_error: Option<Response<BoxBody>> = None;
    let target_count = upstream.targets().len();

    for attempt in 0..=max_retries {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                "proxy: deadline exhausted before attempt {}, route={}",
                attempt, ctx.route_id
            );
            let err = GatewayError::UpstreamTimeout;
            return Err(last_error
                .unwrap_or_else(|| ctx.error_response(err.status(), err.public_message())));
        }

        let Some(target) = select_untried(upstream, ctx, &tried, target_count) else {
            let err = GatewayError::NoHealthyTarget;
            return Err(last_error
                .unwrap_or_else(|| ctx.error_response(err.status(), err.public_message())));
        };
        let upstream_addr = target.endpoint().to_owned();
        ctx.upstream_addr.clear();
        ctx.upstream_addr.push_str(&upstream_addr);

        upstream_uri.clear();
        upstream_uri.push_str(upstream.scheme_for(&target));
        upstream_uri.push_str("://");
        upstream_uri.push_str(&upstream_addr);
        upstream_uri.push_str(&req_uri_pq);

        let mut headers = transformed_headers.clone();
        inject_forwarded_headers(&mut headers, ctx);
        remove_hop_headers(&mut headers);
        if let Ok(v) = HeaderValue::from_str(&upstream_addr) {
            headers.insert(HOST, v);
        }
        if config.tracing.enabled {
            inject_trace_context(&mut headers, ctx);
        }

        let mut builder = Request::builder()
            .method(req_method.clone())
            .uri(upstream_uri.as_str());
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }

        let req_body: BoxBody = if let Some(ref bytes) = body_bytes {
            full_body(bytes.clone())
        } else {
            streaming_body.take().unwrap_or_else(empty_body)
        };

        let upstream_req = match builder.body(req_body) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    "proxy: failed to build upstream request, route={}, error={}",
                    ctx.route_id, e
                );
                return Err(ctx.error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error",
                ));
            }
        };

        let upstream_start = Instant::now();
        if attempt == 0 {
            ctx.upstream_start = Some(upstream_start);
        }
        ctx.upstream_attempted = true;

        let result =
            tokio::time::timeout(remaining, upstream.http_client().request(upstream_req)).await;

        match result {
            Ok(Ok(resp)) => {
                let elapsed = upstream_start.elapsed();
                let status = resp.status().as_u16();

                // Passive health: 5xx and transport errors count; 4xx is the
                // application's business.
                upstream.record_passive(&target, status < 500, false);

                if attempt < max_retries && RETRYABLE_STATUSES.contains(&status) {
                    debug!(
                        "proxy: retryable status {}, route={}, upstream={}, attempt={}/{}",
                        status,
                        ctx.route_id,
                        upstream_addr,
                        attempt + 1,
                        max_retries
                    );
                    metrics::counter!(
                        "stargate_upstream_retries_total",
                        "route" => ctx.route_id.clone(),
                        "reason" => "status",
                    )
                    .increment(1);
                    tried.push(upstream_addr);
                    last_error = Some(ctx.error_response(
                        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                        "bad gateway",
                    ));
                    continue;
                }

                return Ok((resp, elapsed));
            }
            Ok(Err(e)) => {
                upstream.record_passive(&target, false, false);
                let err = GatewayError::from_client_error(&e);

                let can_retry =
                    attempt < max_retries && matches!(err, GatewayError::UpstreamConnect(_));
                if can_retry {
                    debug!(
                        "proxy: connect error (retrying), route={}, upstream={}, attempt={}/{}, error={}",
                        ctx.route_id, upstream_addr, attempt + 1, max_retries, e
                    );
                    metrics::counter!(
                        "stargate_upstream_retries_total",
                        "route" => ctx.route_id.clone(),
                        "reason" => "connect_error",
                    )
                    .increment(1);
                    tried.push(upstream_addr);
                    last_error = Some(ctx.error_response(err.status(), err.public_message()));
                    continue;
                }

                warn!(
                    "proxy: upstream error, route={}, upstream={}, error={}",
                    ctx.route_id, upstream_uri, e
                );
                return Err(ctx.error_response(err.status(), err.public_message()));
            }
            Err(_) => {
                // Deadline: cancel the upstream leg (dropping the future
                // aborts the exchange) and flag the timeout for health.
                upstream.record_passive(&target, false, true);
                let err = GatewayError::UpstreamTimeout;

                if attempt < max_retries
                    && !deadline.saturating_duration_since(Instant::now()).is_zero()
                {
                    debug!(
                        "proxy: timeout (retrying), route={}, upstream={}, attempt={}/{}",
                        ctx.route_id,
                        upstream_addr,
                        attempt + 1,
                        max_retries
                    );
                    metrics::counter!(
                        "stargate_upstream_retries_total",
                        "route" => ctx.route_id.clone(),
                        "reason" => "timeout",
                    )
                    .increment(1);
                    tried.push(upstream_addr);
                    last_error = Some(ctx.error_response(err.status(), err.public_message()));
                    continue;
                }

                warn!(
                    "proxy: upstream timeout, route={}, upstream={}",
                    ctx.route_id, upstream_uri
                );
                return Err(ctx.error_response(err.status(), err.public_message()));
            }
        }
    }

    let err = GatewayError::Upstream("retries exhausted".into());
    Err(last_error.unwrap_or_else(|| ctx.error_response(err.status(), err.public_message())))
}

/// Pick a healthy target the retry loop has not tried yet. The balancer
/// already filters health; bounded re-draws skip already-tried addresses.
fn select_untried(
    upstream: &Upstream,
    ctx: &RequestContext,
    tried: &[String],
    max_draws: usize,
) -> Option<Arc<Target>> {
    for _ in 0..=max_draws {
        let target = upstream.select(ctx.client_ip)?;
        if tried.iter().any(|t| t == target.endpoint()) {
            continue;
        }
        return Some(target);
    }
    None
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (parts, body) = upstream_resp.into_parts();
    let mut builder = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    let mut resp = builder.body(body.boxed()).unwrap();
    remove_hop_headers(resp.headers_mut());
    resp
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Inject standard `X-Forwarded-*` and `X-Real-IP` headers so upstream
/// services can identify the original client and protocol.
///
/// - `X-Forwarded-For`: append the client IP to any existing value.
/// - `X-Forwarded-Proto`: trust an incoming value (a TLS-terminating hop in
///   front sets it), default "http" when absent.
/// - `X-Forwarded-Host`: the original `Host` the client sent.
/// - `X-Real-IP`: the resolved client IP.
fn inject_forwarded_headers(headers: &mut http::HeaderMap, ctx: &RequestContext) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let client_ip = ctx.client_ip.to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + client_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&client_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&client_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !ctx.host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(&ctx.host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&client_ip) {
        headers.insert(XRI.clone(), v);
    }
}

/// W3C trace context derived from the request id: the 128-bit trace id is
/// the request id itself, the parent span id is fresh per hop.
fn inject_trace_context(headers: &mut http::HeaderMap, ctx: &RequestContext) {
    if headers.contains_key("traceparent") {
        return;
    }
    let span_source = uuid::Uuid::new_v4().simple().to_string();
    let traceparent = format!("00-{}-{}-01", ctx.request_id, &span_source[..16]);
    if let Ok(v) = HeaderValue::from_str(&traceparent) {
        headers.insert("traceparent", v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::test_context;

    #[test]
    fn test_remove_hop_headers() {
        let mut headers = http::HeaderMap::new();
        headers.insert(CONNECTION, "keep-alive".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert("upgrade", "h2c".parse().unwrap());
        headers.insert("x-kept", "yes".parse().unwrap());

        remove_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-kept"));
    }

    #[test]
    fn test_forwarded_headers_fresh() {
        let ctx = test_context("GET", "/");
        let mut headers = http::HeaderMap::new();
        inject_forwarded_headers(&mut headers, &ctx);

        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.9");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "example.com");
        assert_eq!(headers.get("x-real-ip").unwrap(), "203.0.113.9");
    }

    #[test]
    fn test_forwarded_for_appends() {
        let ctx = test_context("GET", "/");
        let mut headers = http::HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1".parse().unwrap());
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        inject_forwarded_headers(&mut headers, &ctx);

        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "10.0.0.1, 203.0.113.9"
        );
        // Existing proto from a TLS-terminating hop is trusted.
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
    }

    #[test]
    fn test_trace_context_format() {
        let ctx = test_context("GET", "/");
        let mut headers = http::HeaderMap::new();
        inject_trace_context(&mut headers, &ctx);

        let tp = headers.get("traceparent").unwrap().to_str().unwrap();
        let parts: Vec<&str> = tp.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "00");
        assert_eq!(parts[1], ctx.request_id);
        assert_eq!(parts[2].len(), 16);
        assert_eq!(parts[3], "01");
    }

    #[test]
    fn test_trace_context_not_overwritten() {
        let ctx = test_context("GET", "/");
        let mut headers = http::HeaderMap::new();
        headers.insert(
            "traceparent",
            "00-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-bbbbbbbbbbbbbbbb-01"
                .parse()
                .unwrap(),
        );
        inject_trace_context(&mut headers, &ctx);
        assert!(headers
            .get("traceparent")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("00-aaaa"));
    }
}
