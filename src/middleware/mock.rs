use crate::config::{MockResponseConfig, MockRule};
use crate::middleware::placeholder;
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use http::{HeaderName, HeaderValue, Response, StatusCode};

/// Priority-ordered mock response rules; the first matching rule wins and
/// the upstream is never invoked.
#[derive(Debug)]
pub struct MockPolicy {
    rules: Vec<CompiledMockRule>,
}

#[derive(Debug)]
struct CompiledMockRule {
    name: String,
    path_match: PathMatch,
    methods: Vec<String>,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    status: StatusCode,
    body: String,
    response_headers: Vec<(HeaderName, String)>,
}

#[derive(Debug)]
enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(regex::Regex),
}

impl MockPolicy {
    pub fn new(cfg: &MockResponseConfig) -> Self {
        let mut rules: Vec<&MockRule> = cfg.rules.iter().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));

        let compiled = rules
            .into_iter()
            .filter_map(|rule| {
                let path_match = match rule.path_match.as_str() {
                    "prefix" => PathMatch::Prefix(rule.path.clone()),
                    "regex" => match regex::Regex::new(&rule.path) {
                        Ok(re) => PathMatch::Regex(re),
                        Err(e) => {
                            tracing::error!(
                                "mock: rule '{}' regex invalid, dropped: {e}",
                                rule.name
                            );
                            return None;
                        }
                    },
                    _ => PathMatch::Exact(rule.path.clone()),
                };
                let response_headers = rule
                    .response_headers
                    .iter()
                    .filter_map(|(k, v)| {
                        match HeaderName::from_bytes(k.as_bytes()) {
                            Ok(name) => Some((name, v.clone())),
                            Err(e) => {
                                tracing::error!(
                                    "mock: rule '{}' header '{k}' invalid, dropped: {e}",
                                    rule.name
                                );
                                None
                            }
                        }
                    })
                    .collect();
                Some(CompiledMockRule {
                    name: rule.name.clone(),
                    path_match,
                    methods: rule.methods.iter().map(|m| m.to_uppercase()).collect(),
                    headers: rule
                        .headers
                        .iter()
                        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                        .collect(),
                    query: rule
                        .query
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    status: StatusCode::from_u16(rule.status).unwrap_or(StatusCode::OK),
                    body: rule.body.clone(),
                    response_headers,
                })
            })
            .collect();

        Self { rules: compiled }
    }

    /// Return the mocked response for the first matching rule, if any. The
    /// body and header values go through placeholder expansion.
    pub fn apply(
        &self,
        ctx: &RequestContext,
        headers: &http::HeaderMap,
    ) -> Option<Response<BoxBody>> {
        let rule = self.rules.iter().find(|r| r.matches(ctx, headers))?;

        metrics::counter!(
            "stargate_mock_responses_total",
            "rule" => rule.name.clone(),
        )
        .increment(1);
        tracing::debug!(
            "mock: rule '{}' matched, path={}, status={}",
            rule.name,
            ctx.uri_path,
            rule.status
        );

        let body = placeholder::expand(&rule.body, ctx, headers);
        let mut resp = Response::builder()
            .status(rule.status)
            .header("content-type", "application/json")
            .body(full_body(body))
            .unwrap();
        // Insert (replace) semantics so a rule supplying its own
        // content-type overrides the json default instead of appending a
        // second value.
        for (name, template) in &rule.response_headers {
            let value = placeholder::expand(template, ctx, headers);
            if let Ok(v) = HeaderValue::from_str(&value) {
                resp.headers_mut().insert(name.clone(), v);
            }
        }
        Some(resp)
    }
}

impl CompiledMockRule {
    fn matches(&self, ctx: &RequestContext, headers: &http::HeaderMap) -> bool {
        let path_ok = match &self.path_match {
            PathMatch::Exact(p) => ctx.uri_path == *p,
            PathMatch::Prefix(p) => ctx.uri_path.starts_with(p.as_str()),
            PathMatch::Regex(re) => re.is_match(&ctx.uri_path),
        };
        if !path_ok {
            return false;
        }

        if !self.methods.is_empty() {
            let upper = ctx.method.to_uppercase();
            if !self.methods.iter().any(|m| *m == upper) {
                return false;
            }
        }

        for (name, expected) in &self.headers {
            match headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
                Some(v) if v == expected => {}
                _ => return false,
            }
        }

        for (name, expected) in &self.query {
            if !ctx.query.iter().any(|(k, v)| k == name && v == expected) {
                return false;
            }
        }

        true
    }
}
