use crate::middleware::rate_limit::QuotaInfo;
use crate::routing::CompiledRoute;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Strongly typed request-scoped record threaded through every stage.
///
/// Carries request identity, the matched route, and the bits the response
/// phase needs (captured status/size live on the response itself; quota and
/// breaker outcomes are captured here so the reverse pass can emit headers
/// without re-deriving them).
pub struct RequestContext {
    pub host: String,
    pub uri_path: String,
    pub method: String,
    pub query: Vec<(String, String)>,
    /// The downstream client IP (header chain first, then the TCP peer).
    pub client_ip: IpAddr,
    pub request_id: String,
    pub route_id: String,
    pub upstream_addr: String,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
    pub route: Option<Arc<CompiledRoute>>,
    /// Rate-limit quota captured on the request pass, emitted as headers on
    /// the response pass.
    pub quota: Option<QuotaInfo>,
    /// This request holds one of the breaker's half-open probe slots.
    pub breaker_probe: bool,
    /// An upstream exchange was actually attempted (mock/reject paths skip
    /// breaker and passive-health recording).
    pub upstream_attempted: bool,
    /// Validated CORS origin to echo on the response pass.
    pub cors_origin: Option<String>,
}

impl RequestContext {
    pub fn new(
        host: String,
        uri_path: String,
        method: String,
        query: Vec<(String, String)>,
        client_ip: IpAddr,
    ) -> Self {
        Self {
            host,
            uri_path,
            method,
            query,
            client_ip,
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            route_id: String::new(),
            upstream_addr: String::new(),
            start: Instant::now(),
            upstream_start: None,
            route: None,
            quota: None,
            breaker_probe: false,
            upstream_attempted: false,
            cors_origin: None,
        }
    }

    /// Look up a request header value (from the captured header map the
    /// caller passes around).
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Build a JSON error response with a safe body. Metrics are recorded by
    /// the pipeline's single exit point, not here, so error paths count once.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .header("x-request-id", &self.request_id)
            .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
            .unwrap()
    }

    /// Record final metrics for a served response.
    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "stargate_http_requests_total",
            "route" => self.route_id.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "upstream_addr" => self.upstream_addr.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "stargate_http_request_duration_seconds",
            "route" => self.route_id.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "stargate_upstream_request_duration_seconds",
                "route" => self.route_id.clone(),
                "upstream_addr" => self.upstream_addr.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }
    }
}

#[cfg(test)]
pub(crate) fn test_context(method: &str, path: &str) -> RequestContext {
    RequestContext::new(
        "example.com".to_string(),
        path.to_string(),
        method.to_string(),
        Vec::new(),
        "203.0.113.9".parse().unwrap(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_assigned() {
        let a = test_context("GET", "/x");
        let b = test_context("GET", "/x");
        assert_eq!(a.request_id.len(), 32);
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_error_response_shape() {
        let ctx = test_context("GET", "/x");
        let resp = ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert!(resp.headers().contains_key("x-request-id"));
    }

    #[test]
    fn test_query_value() {
        let mut ctx = test_context("GET", "/x");
        ctx.query = vec![("a".into(), "1".into()), ("b".into(), "2".into())];
        assert_eq!(ctx.query_value("a"), Some("1"));
        assert_eq!(ctx.query_value("b"), Some("2"));
        assert_eq!(ctx.query_value("c"), None);
    }
}
