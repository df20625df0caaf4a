use crate::config::{HeaderRules, HeaderTransformConfig};
use crate::middleware::placeholder;
use crate::proxy::context::RequestContext;
use http::header::{HeaderName, HeaderValue};

/// Pre-compiled header transform rules for one direction. Applied in
/// Add → Remove → Rename → Replace order; Add and Replace values go through
/// placeholder expansion against the map being transformed.
#[derive(Debug, Default)]
pub struct CompiledRules {
    add: Vec<(HeaderName, String)>,
    remove: Vec<HeaderName>,
    rename: Vec<(HeaderName, HeaderName)>,
    replace: Vec<(HeaderName, String)>,
}

impl CompiledRules {
    fn compile(rules: &HeaderRules) -> Self {
        let name = |raw: &str| match HeaderName::from_bytes(raw.as_bytes()) {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::error!("header_transform: invalid header name '{raw}', dropped: {e}");
                None
            }
        };
        Self {
            add: rules
                .add
                .iter()
                .filter_map(|(k, v)| Some((name(k)?, v.clone())))
                .collect(),
            remove: rules.remove.iter().filter_map(|k| name(k)).collect(),
            rename: rules
                .rename
                .iter()
                .filter_map(|(from, to)| Some((name(from)?, name(to)?)))
                .collect(),
            replace: rules
                .replace
                .iter()
                .filter_map(|(k, v)| Some((name(k)?, v.clone())))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty()
            && self.remove.is_empty()
            && self.rename.is_empty()
            && self.replace.is_empty()
    }

    pub fn apply(&self, ctx: &RequestContext, headers: &mut http::HeaderMap) {
        for (name, template) in &self.add {
            let value = placeholder::expand(template, ctx, headers);
            if let Ok(v) = HeaderValue::from_str(&value) {
                headers.append(name.clone(), v);
            }
        }

        for name in &self.remove {
            headers.remove(name);
        }

        for (from, to) in &self.rename {
            // Move all values, preserving multi-value headers.
            let values: Vec<HeaderValue> = headers.get_all(from).iter().cloned().collect();
            if values.is_empty() {
                continue;
            }
            headers.remove(from);
            for v in values {
                headers.append(to.clone(), v);
            }
        }

        for (name, template) in &self.replace {
            // Replace only touches headers that are present.
            if !headers.contains_key(name) {
                continue;
            }
            let value = placeholder::expand(template, ctx, headers);
            if let Ok(v) = HeaderValue::from_str(&value) {
                headers.insert(name.clone(), v);
            }
        }
    }
}

/// Request- and response-direction transforms for one scope (global or
/// per-route).
#[derive(Debug)]
pub struct HeaderTransformPolicy {
    pub request: CompiledRules,
    pub response: CompiledRules,
}

impl HeaderTransformPolicy {
    pub fn new(cfg: &HeaderTransformConfig) -> Self {
        Self {
            request: CompiledRules::compile(&cfg.request),
            response: CompiledRules::compile(&cfg.response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::test_context;

    fn policy(yaml: &str) -> HeaderTransformPolicy {
        let cfg: HeaderTransformConfig = serde_yaml::from_str(yaml).unwrap();
        HeaderTransformPolicy::new(&cfg)
    }

    #[test]
    fn test_full_request_transform() {
        let p = policy(
            r#"
request:
  add:
    x-request-id: "${request_id}"
  remove: [x-internal-token]
  rename:
    user-agent: x-original-user-agent
  replace:
    accept: application/json
"#,
        );
        let ctx = test_context("POST", "/api/test");
        let mut headers = http::HeaderMap::new();
        headers.insert("user-agent", "c/1.0".parse().unwrap());
        headers.insert("x-internal-token", "s".parse().unwrap());
        headers.insert("accept", "text/html".parse().unwrap());

        p.request.apply(&ctx, &mut headers);

        assert_eq!(
            headers.get("x-request-id").unwrap().to_str().unwrap(),
            ctx.request_id
        );
        assert!(!headers.contains_key("x-internal-token"));
        assert!(!headers.contains_key("user-agent"));
        assert_eq!(headers.get("x-original-user-agent").unwrap(), "c/1.0");
        assert_eq!(headers.get("accept").unwrap(), "application/json");
    }

    #[test]
    fn test_replace_skips_absent_header() {
        let p = policy("request:\n  replace:\n    accept: application/json\n");
        let ctx = test_context("GET", "/");
        let mut headers = http::HeaderMap::new();
        p.request.apply(&ctx, &mut headers);
        assert!(!headers.contains_key("accept"));
    }

    #[test]
    fn test_rename_skips_absent_header() {
        let p = policy("request:\n  rename:\n    x-old: x-new\n");
        let ctx = test_context("GET", "/");
        let mut headers = http::HeaderMap::new();
        p.request.apply(&ctx, &mut headers);
        assert!(!headers.contains_key("x-new"));
    }

    #[test]
    fn test_rename_preserves_multi_values() {
        let p = policy("request:\n  rename:\n    x-tag: x-label\n");
        let ctx = test_context("GET", "/");
        let mut headers = http::HeaderMap::new();
        headers.append("x-tag", "a".parse().unwrap());
        headers.append("x-tag", "b".parse().unwrap());
        p.request.apply(&ctx, &mut headers);

        let values: Vec<_> = headers.get_all("x-label").iter().collect();
        assert_eq!(values.len(), 2);
        assert!(!headers.contains_key("x-tag"));
    }

    #[test]
    fn test_add_is_append() {
        let p = policy("request:\n  add:\n    x-tag: extra\n");
        let ctx = test_context("GET", "/");
        let mut headers = http::HeaderMap::new();
        headers.insert("x-tag", "original".parse().unwrap());
        p.request.apply(&ctx, &mut headers);
        assert_eq!(headers.get_all("x-tag").iter().count(), 2);
    }

    #[test]
    fn test_add_then_remove_order() {
        // Remove runs after Add, so a header both added and removed ends up
        // absent.
        let p = policy("request:\n  add:\n    x-temp: v\n  remove: [x-temp]\n");
        let ctx = test_context("GET", "/");
        let mut headers = http::HeaderMap::new();
        p.request.apply(&ctx, &mut headers);
        assert!(!headers.contains_key("x-temp"));
    }

    #[test]
    fn test_placeholder_in_add_value() {
        let p = policy("request:\n  add:\n    x-origin-path: \"${method} ${path}\"\n");
        let ctx = test_context("PUT", "/v2/items");
        let mut headers = http::HeaderMap::new();
        p.request.apply(&ctx, &mut headers);
        assert_eq!(headers.get("x-origin-path").unwrap(), "PUT /v2/items");
    }

    #[test]
    fn test_response_rules_independent() {
        let p = policy(
            r#"
request:
  add:
    x-req-only: "1"
response:
  add:
    x-resp-only: "1"
"#,
        );
        let ctx = test_context("GET", "/");
        let mut req = http::HeaderMap::new();
        let mut resp = http::HeaderMap::new();
        p.request.apply(&ctx, &mut req);
        p.response.apply(&ctx, &mut resp);
        assert!(req.contains_key("x-req-only"));
        assert!(!req.contains_key("x-resp-only"));
        assert!(resp.contains_key("x-resp-only"));
        assert!(!resp.contains_key("x-req-only"));
    }

    #[test]
    fn test_invalid_header_name_dropped() {
        let p = policy("request:\n  add:\n    \"bad header\": v\n    x-good: v\n");
        let ctx = test_context("GET", "/");
        let mut headers = http::HeaderMap::new();
        p.request.apply(&ctx, &mut headers);
        assert!(headers.contains_key("x-good"));
        assert_eq!(headers.len(), 1);
    }
}
