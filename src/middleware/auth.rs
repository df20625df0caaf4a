use crate::config::AuthConfig;
use crate::proxy::context::{BoxBody, RequestContext};
use http::{Response, StatusCode};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

/// Bearer-token JWT validation (HS256). Paths in `skip_paths` bypass the
/// check by prefix match.
pub struct AuthPolicy {
    decoding_key: DecodingKey,
    validation: Validation,
    skip_paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct Claims {
    pub sub: Option<String>,
    pub exp: u64,
}

impl AuthPolicy {
    pub fn new(cfg: &AuthConfig) -> Self {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
            validation,
            skip_paths: cfg.skip_paths.clone(),
        }
    }

    pub fn apply(
        &self,
        ctx: &RequestContext,
        headers: &http::HeaderMap,
    ) -> Option<Response<BoxBody>> {
        if self
            .skip_paths
            .iter()
            .any(|p| ctx.uri_path.starts_with(p.as_str()))
        {
            return None;
        }

        let token = headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let Some(token) = token else {
            metrics::counter!("stargate_auth_rejected_total", "reason" => "missing").increment(1);
            return Some(unauthorized(ctx, "missing bearer token"));
        };

        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => {
                tracing::debug!(
                    "auth: token accepted, route={}, sub={}",
                    ctx.route_id,
                    data.claims.sub.as_deref().unwrap_or("-")
                );
                None
            }
            Err(e) => {
                metrics::counter!("stargate_auth_rejected_total", "reason" => "invalid")
                    .increment(1);
                tracing::debug!("auth: token rejected, route={}, error={}", ctx.route_id, e);
                Some(unauthorized(ctx, "invalid token"))
            }
        }
    }
}

fn unauthorized(ctx: &RequestContext, msg: &str) -> Response<BoxBody> {
    let mut resp = ctx.error_response(StatusCode::UNAUTHORIZED, msg);
    resp.headers_mut().insert(
        http::header::WWW_AUTHENTICATE,
        http::HeaderValue::from_static("Bearer"),
    );
    resp
}
