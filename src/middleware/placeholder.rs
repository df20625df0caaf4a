use crate::proxy::context::RequestContext;
use std::time::{SystemTime, UNIX_EPOCH};

/// Expand the shared `${...}` placeholder vocabulary used by header
/// transforms and mock response bodies:
///
///   `${method}` `${path}` `${host}` `${timestamp}` `${request_id}`
///   `${header:NAME}` `${query:NAME}`
///
/// Unknown placeholders are left verbatim; absent headers/query parameters
/// expand to the empty string.
pub fn expand(template: &str, ctx: &RequestContext, headers: &http::HeaderMap) -> String {
    if !template.contains("${") {
        return template.to_string();
    }

    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated placeholder: keep the tail as-is.
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match resolve(name, ctx, headers) {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str("${");
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn resolve(name: &str, ctx: &RequestContext, headers: &http::HeaderMap) -> Option<String> {
    match name {
        "method" => Some(ctx.method.clone()),
        "path" => Some(ctx.uri_path.clone()),
        "host" => Some(ctx.host.clone()),
        "request_id" => Some(ctx.request_id.clone()),
        "timestamp" => Some(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
                .to_string(),
        ),
        _ => {
            if let Some(header_name) = name.strip_prefix("header:") {
                return Some(
                    headers
                        .get(header_name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string(),
                );
            }
            if let Some(query_name) = name.strip_prefix("query:") {
                return Some(ctx.query_value(query_name).unwrap_or("").to_string());
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::test_context;

    fn headers() -> http::HeaderMap {
        let mut h = http::HeaderMap::new();
        h.insert("x-tenant", "acme".parse().unwrap());
        h
    }

    #[test]
    fn test_no_placeholder_passthrough() {
        let ctx = test_context("GET", "/api");
        assert_eq!(expand("plain text", &ctx, &headers()), "plain text");
    }

    #[test]
    fn test_request_fields() {
        let ctx = test_context("POST", "/api/users");
        let out = expand("${method} ${path} on ${host}", &ctx, &headers());
        assert_eq!(out, "POST /api/users on example.com");
    }

    #[test]
    fn test_request_id_and_timestamp() {
        let ctx = test_context("GET", "/");
        let out = expand("id=${request_id} ts=${timestamp}", &ctx, &headers());
        assert!(out.contains(&format!("id={}", ctx.request_id)));
        let ts: u64 = out.split("ts=").nth(1).unwrap().parse().unwrap();
        assert!(ts > 1_700_000_000);
    }

    #[test]
    fn test_header_and_query_lookup() {
        let mut ctx = test_context("GET", "/");
        ctx.query = vec![("version".into(), "v2".into())];
        let out = expand(
            "tenant=${header:x-tenant} version=${query:version}",
            &ctx,
            &headers(),
        );
        assert_eq!(out, "tenant=acme version=v2");
    }

    #[test]
    fn test_missing_header_and_query_empty() {
        let ctx = test_context("GET", "/");
        let out = expand("[${header:x-nope}][${query:nope}]", &ctx, &headers());
        assert_eq!(out, "[][]");
    }

    #[test]
    fn test_unknown_placeholder_kept() {
        let ctx = test_context("GET", "/");
        assert_eq!(expand("${mystery}", &ctx, &headers()), "${mystery}");
    }

    #[test]
    fn test_unterminated_placeholder_kept() {
        let ctx = test_context("GET", "/");
        assert_eq!(expand("x ${method", &ctx, &headers()), "x ${method");
    }

    #[test]
    fn test_adjacent_placeholders() {
        let ctx = test_context("GET", "/p");
        assert_eq!(expand("${method}${path}", &ctx, &headers()), "GET/p");
    }
}
