use crate::config::CorsConfig;
use crate::proxy::context::{empty_body, BoxBody, RequestContext};
use http::{HeaderValue, Response, StatusCode};

/// CORS policy compiled from config.
///
/// Preflight requests (OPTIONS + `Access-Control-Request-Method`) are
/// answered directly with 204 or rejected with 403. Actual cross-origin
/// requests have their origin validated on the request pass and the allow /
/// expose / credentials headers stamped on the response pass.
#[derive(Debug)]
pub struct CorsPolicy {
    allow_origins: Vec<OriginPattern>,
    allow_methods: Vec<String>,
    allow_headers: Vec<String>,
    expose_headers: String,
    allow_credentials: bool,
    max_age_secs: u64,
}

#[derive(Debug)]
enum OriginPattern {
    Any,
    Exact(String),
    /// `*.example.com` — matches any subdomain, compared after stripping the
    /// scheme from the request origin.
    WildcardSuffix(String),
}

pub enum CorsOutcome {
    /// Not a CORS request (no Origin header); nothing to do.
    NotCors,
    /// Origin validated; echo it back on the response pass.
    Allowed { origin: String },
    /// Preflight answered in full.
    Preflight(Response<BoxBody>),
    /// Origin or method rejected.
    Rejected(Response<BoxBody>),
}

impl CorsPolicy {
    pub fn new(cfg: &CorsConfig) -> Self {
        let allow_origins = cfg
            .allow_origins
            .iter()
            .map(|o| {
                if o == "*" {
                    OriginPattern::Any
                } else if let Some(suffix) = o.strip_prefix("*.") {
                    OriginPattern::WildcardSuffix(format!(".{}", suffix.to_ascii_lowercase()))
                } else {
                    OriginPattern::Exact(o.to_ascii_lowercase())
                }
            })
            .collect();
        Self {
            allow_origins,
            allow_methods: cfg.allow_methods.iter().map(|m| m.to_uppercase()).collect(),
            allow_headers: cfg
                .allow_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            expose_headers: cfg.expose_headers.join(", "),
            allow_credentials: cfg.allow_credentials,
            max_age_secs: cfg.max_age_secs,
        }
    }

    pub fn apply(
        &self,
        ctx: &RequestContext,
        headers: &http::HeaderMap,
    ) -> CorsOutcome {
        let Some(origin) = headers
            .get(http::header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
        else {
            return CorsOutcome::NotCors;
        };

        let is_preflight = ctx.method.eq_ignore_ascii_case("OPTIONS")
            && headers.contains_key("access-control-request-method");

        if !self.origin_allowed(&origin) {
            metrics::counter!("stargate_cors_rejected_total", "reason" => "origin").increment(1);
            return CorsOutcome::Rejected(reject(ctx, "origin not allowed"));
        }

        if is_preflight {
            return self.preflight(ctx, headers, &origin);
        }

        if !self.method_allowed(&ctx.method) {
            metrics::counter!("stargate_cors_rejected_total", "reason" => "method").increment(1);
            return CorsOutcome::Rejected(reject(ctx, "method not allowed"));
        }

        CorsOutcome::Allowed { origin }
    }

    /// Stamp response headers for a validated actual request.
    pub fn decorate_response(&self, origin: &str, resp: &mut Response<BoxBody>) {
        let headers = resp.headers_mut();
        if let Ok(v) = HeaderValue::from_str(origin) {
            headers.insert("access-control-allow-origin", v);
        }
        if self.allow_credentials {
            headers.insert(
                "access-control-allow-credentials",
                HeaderValue::from_static("true"),
            );
        }
        if !self.expose_headers.is_empty() {
            if let Ok(v) = HeaderValue::from_str(&self.expose_headers) {
                headers.insert("access-control-expose-headers", v);
            }
        }
        headers.append("vary", HeaderValue::from_static("origin"));
    }

    fn preflight(
        &self,
        ctx: &RequestContext,
        headers: &http::HeaderMap,
        origin: &str,
    ) -> CorsOutcome {
        let requested_method = headers
            .get("access-control-request-method")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !self.method_allowed(requested_method) {
            metrics::counter!("stargate_cors_rejected_total", "reason" => "method").increment(1);
            return CorsOutcome::Rejected(reject(ctx, "method not allowed"));
        }

        let requested_headers = headers
            .get("access-control-request-headers")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !self.allow_headers.is_empty() {
            for name in requested_headers.split(',').filter(|s| !s.is_empty()) {
                let name = name.trim().to_ascii_lowercase();
                if !name.is_empty() && !self.allow_headers.contains(&name) {
                    metrics::counter!("stargate_cors_rejected_total", "reason" => "headers")
                        .increment(1);
                    return CorsOutcome::Rejected(reject(ctx, "header not allowed"));
                }
            }
        }

        let mut builder = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("access-control-allow-origin", origin)
            .header("access-control-allow-methods", self.allow_methods.join(", "))
            .header("access-control-max-age", self.max_age_secs.to_string())
            .header("vary", "origin");

        let allow_headers = if self.allow_headers.is_empty() {
            // No explicit list: echo whatever the client asked for.
            requested_headers.to_string()
        } else {
            self.allow_headers.join(", ")
        };
        if !allow_headers.is_empty() {
            builder = builder.header("access-control-allow-headers", allow_headers);
        }
        if self.allow_credentials {
            builder = builder.header("access-control-allow-credentials", "true");
        }

        CorsOutcome::Preflight(builder.body(empty_body()).unwrap())
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        let bare = strip_scheme(origin).to_ascii_lowercase();
        self.allow_origins.iter().any(|p| match p {
            OriginPattern::Any => true,
            OriginPattern::Exact(o) => {
                origin.eq_ignore_ascii_case(o) || bare == strip_scheme(o)
            }
            OriginPattern::WildcardSuffix(suffix) => {
                // Host-only compare; the suffix includes the leading dot so
                // "evilexample.com" cannot match "*.example.com".
                let host = bare.split(':').next().unwrap_or(&bare);
                host.ends_with(suffix.as_str())
            }
        })
    }

    fn method_allowed(&self, method: &str) -> bool {
        let upper = method.to_uppercase();
        self.allow_methods.iter().any(|m| *m == upper)
    }
}

fn strip_scheme(origin: &str) -> &str {
    origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .unwrap_or(origin)
}

fn reject(ctx: &RequestContext, msg: &str) -> Response<BoxBody> {
    ctx.error_response(StatusCode::FORBIDDEN, msg)
}
