use http::StatusCode;
use std::fmt;

/// Gateway-side classification of request failures. Policy rejections are
/// produced by middlewares; the upstream variants come out of the proxy
/// engine's transport error mapping.
#[derive(Debug)]
pub enum GatewayError {
    NoRouteMatch,
    NoHealthyTarget,
    RateLimited,
    CircuitOpen,
    UpstreamTimeout,
    UpstreamConnect(String),
    Upstream(String),
    Config(String),
    Internal(String),
}

impl GatewayError {
    /// Map a hyper client error to the gateway's transport error classes:
    /// connect / network failures surface as service-unavailable, everything
    /// else as bad-gateway. Deadlines are handled by the caller (it owns the
    /// timer) and map to `UpstreamTimeout`.
    pub fn from_client_error(e: &hyper_util::client::legacy::Error) -> Self {
        if e.is_connect() {
            Self::UpstreamConnect(e.to_string())
        } else {
            Self::Upstream(e.to_string())
        }
    }

    /// The status code the client sees for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoRouteMatch => StatusCode::NOT_FOUND,
            Self::NoHealthyTarget | Self::CircuitOpen | Self::UpstreamConnect(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Safe client-facing message — never leaks internals.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::NoRouteMatch => "not found",
            Self::NoHealthyTarget => "service unavailable",
            Self::RateLimited => "too many requests",
            Self::CircuitOpen => "service unavailable",
            Self::UpstreamTimeout => "gateway timeout",
            Self::UpstreamConnect(_) => "service unavailable",
            Self::Upstream(_) => "bad gateway",
            Self::Config(_) | Self::Internal(_) => "internal server error",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteMatch => write!(f, "no route matched"),
            GatewayError::NoHealthyTarget => write!(f, "no healthy upstream target"),
            GatewayError::RateLimited => write!(f, "rate limited"),
            GatewayError::CircuitOpen => write!(f, "circuit breaker open"),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            GatewayError::Upstream(msg) => write!(f, "upstream error: {}", msg),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}
