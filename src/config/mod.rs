pub mod source;
pub mod store;
pub mod types;

pub use types::*;

use anyhow::Result;
use std::path::Path;

const LB_ALGORITHMS: &[&str] = &["round_robin", "weighted", "ip_hash"];
const RL_ALGORITHMS: &[&str] = &["fixed_window", "token_bucket"];
const RL_IDENTIFIERS: &[&str] = &["ip", "user", "api_key", "combined"];
const PATH_MATCH_TYPES: &[&str] = &["exact", "prefix", "regex"];
const CANARY_STRATEGIES: &[&str] = &["weighted", "percentage", "header_based", "single"];
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: &[&str] = &["json", "text"];

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — allowing the gateway to start with zero configuration for
    /// local development (etcd can deliver the real document later).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::parse(content.as_bytes())?
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        if config.config_source.file.path.is_empty() {
            config.config_source.file.path = path.display().to_string();
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a raw configuration document. YAML is the primary format; a
    /// leading `{` selects JSON (the controller publishes JSON to etcd).
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)?;
        if text.trim_start().starts_with('{') {
            Ok(serde_json::from_str(text)?)
        } else {
            Ok(serde_yaml::from_str(text)?)
        }
    }

    /// Apply `STARGATE_*` environment variable overrides for infrastructure
    /// settings. Routes and upstreams are only ever configured through the
    /// document itself.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("STARGATE_SERVER_ADDRESS") {
            self.server.address = v;
        }
        if let Ok(v) = std::env::var("STARGATE_STORE_TYPE") {
            self.store.store_type = v;
        }
        if let Ok(v) = std::env::var("STARGATE_ETCD_ENDPOINTS") {
            self.config_source.etcd.endpoints =
                v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("STARGATE_ETCD_USERNAME") {
            self.config_source.etcd.username = Some(v);
        }
        if let Ok(v) = std::env::var("STARGATE_ETCD_PASSWORD") {
            self.config_source.etcd.password = Some(v);
        }
        if let Ok(v) = std::env::var("STARGATE_JWT_SECRET") {
            self.auth.jwt_secret = v;
        }
        if let Ok(v) = std::env::var("STARGATE_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("STARGATE_LOG_FORMAT") {
            self.logging.format = v;
        }
    }

    /// Validate the whole document. A reload that fails validation keeps the
    /// previous snapshot in place, so this must catch everything that would
    /// otherwise surface at request time.
    pub fn validate(&self) -> Result<()> {
        if self.server.address.trim().is_empty() {
            anyhow::bail!("server.address cannot be empty");
        }
        self.server
            .address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("server.address '{}' invalid: {e}", self.server.address))?;

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            anyhow::bail!("logging.level '{}' unknown", self.logging.level);
        }
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            anyhow::bail!("logging.format '{}' unknown", self.logging.format);
        }

        match self.store.store_type.as_str() {
            "file" => {}
            "etcd" => {
                if self.config_source.etcd.endpoints.is_empty() {
                    anyhow::bail!("store.type is etcd but config_source.etcd.endpoints is empty");
                }
                for ep in &self.config_source.etcd.endpoints {
                    if ep.is_empty() {
                        anyhow::bail!("etcd endpoint cannot be empty");
                    }
                }
            }
            other => anyhow::bail!("store.type '{other}' unknown, use 'file' or 'etcd'"),
        }

        if !LB_ALGORITHMS.contains(&self.load_balancer.algorithm.as_str()) {
            anyhow::bail!(
                "load_balancer.algorithm '{}' unknown",
                self.load_balancer.algorithm
            );
        }

        validate_rate_limit(&self.rate_limit, "rate_limit")?;

        for group in &self.load_balancer.canary_groups {
            if !CANARY_STRATEGIES.contains(&group.strategy.as_str()) {
                anyhow::bail!(
                    "canary group '{}' strategy '{}' unknown",
                    group.id,
                    group.strategy
                );
            }
        }

        let mut upstream_ids = std::collections::HashSet::new();
        let mut canary_groups: std::collections::HashSet<&str> = self
            .load_balancer
            .canary_groups
            .iter()
            .map(|g| g.id.as_str())
            .collect();
        for up in &self.upstreams {
            if up.id.is_empty() {
                anyhow::bail!("upstream with empty id");
            }
            if !upstream_ids.insert(up.id.as_str()) {
                anyhow::bail!("duplicate upstream id '{}'", up.id);
            }
            if let Some(ref alg) = up.algorithm {
                if !LB_ALGORITHMS.contains(&alg.as_str()) {
                    anyhow::bail!("upstream '{}' algorithm '{alg}' unknown", up.id);
                }
            }
            if let Some(ref scheme) = up.scheme {
                if scheme != "http" && scheme != "https" {
                    anyhow::bail!("upstream '{}' scheme '{scheme}' unknown", up.id);
                }
            }
            if let Some(ref canary) = up.canary {
                canary_groups.insert(canary.group.as_str());
                if canary.percentage > 100 {
                    anyhow::bail!("upstream '{}' canary percentage > 100", up.id);
                }
            }
        }

        let mut route_ids = std::collections::HashSet::new();
        for route in &self.routes {
            if route.id.is_empty() {
                anyhow::bail!("route with empty id");
            }
            if !route_ids.insert(route.id.as_str()) {
                anyhow::bail!("duplicate route id '{}'", route.id);
            }
            if !PATH_MATCH_TYPES.contains(&route.path_match.as_str()) {
                anyhow::bail!(
                    "route '{}' path_match '{}' unknown",
                    route.id,
                    route.path_match
                );
            }
            if route.path_match == "regex" {
                regex::Regex::new(&route.path)
                    .map_err(|e| anyhow::anyhow!("route '{}' path regex invalid: {e}", route.id))?;
            }
            if !upstream_ids.contains(route.upstream.as_str())
                && !canary_groups.contains(route.upstream.as_str())
            {
                anyhow::bail!(
                    "route '{}' references unknown upstream '{}'",
                    route.id,
                    route.upstream
                );
            }
            if let Some(ref rl) = route.rate_limit {
                validate_rate_limit(rl, &format!("route '{}' rate_limit", route.id))?;
            }
            if let Some(ref mock) = route.mock_response {
                validate_mock(mock, &route.id)?;
            }
        }

        if let Some(ref mock) = self.mock_response {
            validate_mock(mock, "_global")?;
        }

        if let Some(ref acl) = self.ip_acl {
            for entry in acl.whitelist.iter().chain(acl.blacklist.iter()) {
                crate::middleware::ip_acl::parse_cidr(entry)
                    .map_err(|e| anyhow::anyhow!("ip_acl entry '{entry}' invalid: {e}"))?;
            }
        }

        if self.auth.enabled && self.auth.jwt_secret.is_empty() {
            anyhow::bail!("auth.enabled requires auth.jwt_secret (or STARGATE_JWT_SECRET)");
        }

        Ok(())
    }
}

fn validate_rate_limit(rl: &RateLimitConfig, scope: &str) -> Result<()> {
    if !RL_ALGORITHMS.contains(&rl.algorithm.as_str()) {
        anyhow::bail!("{scope}.algorithm '{}' unknown", rl.algorithm);
    }
    if !RL_IDENTIFIERS.contains(&rl.identifier.as_str()) {
        anyhow::bail!("{scope}.identifier '{}' unknown", rl.identifier);
    }
    if rl.enabled {
        if rl.algorithm == "fixed_window" && (rl.max_requests == 0 || rl.window_secs == 0) {
            anyhow::bail!("{scope}: fixed_window needs max_requests > 0 and window_secs > 0");
        }
        if rl.algorithm == "token_bucket" && rl.rate <= 0.0 {
            anyhow::bail!("{scope}: token_bucket needs rate > 0");
        }
    }
    Ok(())
}

fn validate_mock(mock: &MockResponseConfig, scope: &str) -> Result<()> {
    for rule in &mock.rules {
        if !PATH_MATCH_TYPES.contains(&rule.path_match.as_str()) {
            anyhow::bail!(
                "mock rule '{}' ({scope}) path_match '{}' unknown",
                rule.name,
                rule.path_match
            );
        }
        if rule.path_match == "regex" {
            regex::Regex::new(&rule.path).map_err(|e| {
                anyhow::anyhow!("mock rule '{}' ({scope}) path regex invalid: {e}", rule.name)
            })?;
        }
        http::StatusCode::from_u16(rule.status)
            .map_err(|_| anyhow::anyhow!("mock rule '{}' ({scope}) status invalid", rule.name))?;
    }
    Ok(())
}
