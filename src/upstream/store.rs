use crate::config::{PassiveHealthCheck, ProxyConfig, TargetConfig, UpstreamConfig};
use crate::proxy::context::BoxBody;
use crate::upstream::loadbalance::Balancer;
use crate::upstream::target::Target;
use dashmap::DashMap;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// A rustls `ServerCertVerifier` that accepts any certificate without
/// validation. Used when `tls_verify: false` — the common case for internal
/// traffic where encryption is desired but upstream identity verification is
/// not.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Runtime representation of an upstream — the "live" counterpart of
/// `UpstreamConfig`. While the config is a pure serde struct describing what
/// the upstream should look like, this holds the mutable runtime state:
/// balancer, target health, and the pooled HTTP client.
#[derive(Clone)]
pub struct Upstream {
    config: Arc<UpstreamConfig>,

    /// Explicit scheme, if configured. Otherwise chosen per target by port.
    scheme: Option<Arc<str>>,

    balancer: Arc<Balancer>,

    /// Per-upstream HTTP client; the pool is bounded per host and shared by
    /// every request to this upstream. Wraps an `HttpsConnector` so both
    /// `http://` and `https://` targets work; HTTP/2 via ALPN.
    http_client: Client<HttpsConnector<HttpConnector>, BoxBody>,

    passive: Option<PassiveHealthCheck>,
}

impl Upstream {
    pub fn new(config: UpstreamConfig, proxy: &ProxyConfig, default_algorithm: &str) -> Self {
        let algorithm = config.algorithm.as_deref().unwrap_or(default_algorithm);
        let balancer = Balancer::new(algorithm);
        let initially_healthy = !has_active_check(&config);
        let targets: Vec<Arc<Target>> = config
            .targets
            .iter()
            .map(|t| Arc::new(Target::from_config(t, initially_healthy)))
            .collect();
        balancer.update_targets(targets);

        let http_client = build_upstream_http_client(proxy);
        let scheme = config.scheme.as_deref().map(Arc::from);
        let passive = config.health_check.as_ref().and_then(|h| h.passive.clone());

        Self {
            config: Arc::new(config),
            scheme,
            balancer,
            http_client,
            passive,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn http_client(&self) -> &Client<HttpsConnector<HttpConnector>, BoxBody> {
        &self.http_client
    }

    pub fn targets(&self) -> Arc<Vec<Arc<Target>>> {
        self.balancer.targets()
    }

    /// Select a target for this request; `None` when no target is healthy.
    pub fn select(&self, client_ip: IpAddr) -> Option<Arc<Target>> {
        self.balancer.select(client_ip)
    }

    pub fn has_selectable_target(&self) -> bool {
        self.balancer.healthy_count() > 0
    }

    /// Outbound scheme for a target: explicit config wins, else port 443
    /// implies https.
    pub fn scheme_for(&self, target: &Target) -> &str {
        match self.scheme {
            Some(ref s) => s,
            None if target.port == 443 => "https",
            None => "http",
        }
    }

    /// Passive health signal from the proxy engine. Crossing the configured
    /// consecutive-failure threshold isolates the target for the isolation
    /// window, after which it is probed (or re-admitted) again.
    pub fn record_passive(&self, target: &Target, success: bool, is_timeout: bool) {
        let Some(ref passive) = self.passive else {
            return;
        };
        let failures = target.record_passive(success);
        if !success && failures >= passive.consecutive_failures {
            target.isolate_for_ms(passive.isolation_duration_secs * 1000);
            target.reset_passive_failures();
            metrics::counter!(
                "stargate_passive_isolations_total",
                "upstream" => self.config.id.clone(),
                "target" => target.endpoint().to_owned(),
            )
            .increment(1);
            tracing::warn!(
                "health: passive: target isolated, upstream={}, target={}, failures={}, timeout={}",
                self.config.id,
                target.endpoint(),
                failures,
                is_timeout,
            );
        }
    }

    /// Apply a new config while preserving runtime state: targets that are
    /// still present keep their `Arc` (health bit, streaks); the balancer is
    /// reused when the algorithm is unchanged (keeps the round-robin
    /// counter).
    pub fn update_config(
        &self,
        new_config: UpstreamConfig,
        proxy: &ProxyConfig,
        default_algorithm: &str,
    ) -> Self {
        let old_algorithm = self
            .config
            .algorithm
            .as_deref()
            .unwrap_or(default_algorithm);
        let new_algorithm = new_config.algorithm.as_deref().unwrap_or(default_algorithm);

        let current = self.balancer.targets();
        let existing: HashMap<&str, &Arc<Target>> =
            current.iter().map(|t| (t.endpoint(), t)).collect();

        let initially_healthy = !has_active_check(&new_config);
        let targets: Vec<Arc<Target>> = new_config
            .targets
            .iter()
            .map(|t| reuse_or_create(&existing, t, initially_healthy))
            .collect();

        let balancer = if new_algorithm != old_algorithm {
            let b = Balancer::new(new_algorithm);
            b.update_targets(targets);
            b
        } else {
            self.balancer.update_targets(targets);
            self.balancer.clone()
        };

        let scheme = new_config.scheme.as_deref().map(Arc::from);
        let passive = new_config
            .health_check
            .as_ref()
            .and_then(|h| h.passive.clone());

        Self {
            config: Arc::new(new_config),
            scheme,
            balancer,
            // Pool settings are global proxy config; reuse the client.
            http_client: self.http_client.clone(),
            passive,
        }
    }
}

fn has_active_check(config: &UpstreamConfig) -> bool {
    config
        .health_check
        .as_ref()
        .is_some_and(|h| h.active.is_some())
}

fn reuse_or_create(
    existing: &HashMap<&str, &Arc<Target>>,
    cfg: &TargetConfig,
    initially_healthy: bool,
) -> Arc<Target> {
    let endpoint = format!("{}:{}", cfg.host, cfg.port);
    match existing.get(endpoint.as_str()) {
        Some(t) if t.weight == cfg.weight && t.metadata == cfg.metadata => (*t).clone(),
        // Weight/metadata changed: rebuild but carry the health bit over so
        // a reload does not resurrect a dead target.
        Some(t) => {
            let rebuilt = Target::from_config(cfg, t.is_healthy());
            Arc::new(rebuilt)
        }
        None => Arc::new(Target::from_config(cfg, initially_healthy)),
    }
}

/// Central registry of live upstreams. Thread-safe, cheaply cloneable.
#[derive(Clone, Default)]
pub struct UpstreamStore {
    upstreams: Arc<DashMap<String, Upstream>>,
}

impl UpstreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Upstream> {
        self.upstreams.get(id).map(|e| e.value().clone())
    }

    pub fn upsert(&self, config: UpstreamConfig, proxy: &ProxyConfig, default_algorithm: &str) {
        let id = config.id.clone();
        if let Some(existing) = self.upstreams.get(&id) {
            let updated = existing
                .value()
                .update_config(config, proxy, default_algorithm);
            drop(existing);
            self.upstreams.insert(id, updated);
        } else {
            self.upstreams
                .insert(id, Upstream::new(config, proxy, default_algorithm));
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.upstreams.remove(id).is_some()
    }

    pub fn for_each(&self, mut f: impl FnMut(&str, &Upstream)) {
        for entry in self.upstreams.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Reconcile the store with a full snapshot: upsert everything present,
    /// drop everything absent.
    pub fn sync(&self, configs: &[UpstreamConfig], proxy: &ProxyConfig, default_algorithm: &str) {
        let keep: std::collections::HashSet<&str> =
            configs.iter().map(|c| c.id.as_str()).collect();
        for config in configs {
            self.upsert(config.clone(), proxy, default_algorithm);
        }
        self.upstreams.retain(|id, _| keep.contains(id.as_str()));
    }
}

/// Build a hyper `Client` that supports both HTTP and HTTPS upstreams.
///
/// - Plain `http://` connections go through the inner `HttpConnector`.
/// - `https://` connections are terminated with rustls (ring backend).
/// - HTTP/2 is negotiated via ALPN for TLS connections; plain HTTP stays on
///   HTTP/1.1.
/// - When `tls_verify` is `false` (the default), certificate validation is
///   skipped.
fn build_upstream_http_client(
    proxy: &ProxyConfig,
) -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(Duration::from_secs(proxy.keepalive_pool.idle_timeout)));
    http.set_connect_timeout(Some(Duration::from_secs_f64(proxy.connect_timeout_secs)));
    http.enforce_http(false);

    let https = if proxy.tls_verify {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    } else {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();

        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    };

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(proxy.keepalive_pool.idle_timeout))
        .pool_max_idle_per_host(proxy.keepalive_pool.size)
        .build(https)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthCheckConfig;

    fn upstream_config(yaml: &str) -> UpstreamConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn proxy() -> ProxyConfig {
        ProxyConfig::default()
    }

    #[tokio::test]
    async fn test_targets_start_healthy_without_active_check() {
        let up = Upstream::new(
            upstream_config("id: u\ntargets: [{host: a, port: 80}]\n"),
            &proxy(),
            "round_robin",
        );
        assert!(up.has_selectable_target());
        assert!(up.select("10.0.0.1".parse().unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_targets_start_unhealthy_with_active_check() {
        let up = Upstream::new(
            upstream_config(
                "id: u\ntargets: [{host: a, port: 80}]\nhealth_check:\n  active: {}\n",
            ),
            &proxy(),
            "round_robin",
        );
        assert!(!up.has_selectable_target());
        assert!(up.select("10.0.0.1".parse().unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_scheme_for_target() {
        let up = Upstream::new(
            upstream_config("id: u\ntargets: [{host: a, port: 80}, {host: b, port: 443}]\n"),
            &proxy(),
            "round_robin",
        );
        let targets = up.targets();
        assert_eq!(up.scheme_for(&targets[0]), "http");
        assert_eq!(up.scheme_for(&targets[1]), "https");

        let up = Upstream::new(
            upstream_config("id: u\nscheme: https\ntargets: [{host: a, port: 80}]\n"),
            &proxy(),
            "round_robin",
        );
        assert_eq!(up.scheme_for(&up.targets()[0]), "https");
    }

    #[tokio::test]
    async fn test_update_preserves_target_health() {
        let store = UpstreamStore::new();
        store.upsert(
            upstream_config("id: u\ntargets: [{host: a, port: 80}, {host: b, port: 80}]\n"),
            &proxy(),
            "round_robin",
        );

        let up = store.get("u").unwrap();
        let a = up
            .targets()
            .iter()
            .find(|t| t.endpoint() == "a:80")
            .unwrap()
            .clone();
        a.set_healthy(false);

        // Reload with b removed and c added.
        store.upsert(
            upstream_config("id: u\ntargets: [{host: a, port: 80}, {host: c, port: 80}]\n"),
            &proxy(),
            "round_robin",
        );

        let up = store.get("u").unwrap();
        let targets = up.targets();
        assert_eq!(targets.len(), 2);
        let a2 = targets.iter().find(|t| t.endpoint() == "a:80").unwrap();
        assert!(!a2.is_healthy(), "health survived the reload");
        assert!(targets.iter().any(|t| t.endpoint() == "c:80"));
        assert!(!targets.iter().any(|t| t.endpoint() == "b:80"));
    }

    #[tokio::test]
    async fn test_sync_removes_absent_upstreams() {
        let store = UpstreamStore::new();
        let p = proxy();
        store.sync(
            &[
                upstream_config("id: a\ntargets: [{host: a, port: 80}]\n"),
                upstream_config("id: b\ntargets: [{host: b, port: 80}]\n"),
            ],
            &p,
            "round_robin",
        );
        assert_eq!(store.len(), 2);

        store.sync(
            &[upstream_config("id: b\ntargets: [{host: b, port: 80}]\n")],
            &p,
            "round_robin",
        );
        assert_eq!(store.len(), 1);
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());
    }

    #[tokio::test]
    async fn test_passive_isolation_after_threshold() {
        let mut cfg = upstream_config("id: u\ntargets: [{host: a, port: 80}]\n");
        cfg.health_check = Some(HealthCheckConfig {
            active: None,
            passive: Some(PassiveHealthCheck {
                consecutive_failures: 3,
                isolation_duration_secs: 60,
            }),
        });
        let up = Upstream::new(cfg, &proxy(), "round_robin");
        let target = up.targets()[0].clone();

        up.record_passive(&target, false, false);
        up.record_passive(&target, false, false);
        assert!(target.is_selectable());
        up.record_passive(&target, false, true);
        assert!(target.is_isolated());
        assert!(!up.has_selectable_target());
    }

    #[tokio::test]
    async fn test_passive_success_resets_streak() {
        let mut cfg = upstream_config("id: u\ntargets: [{host: a, port: 80}]\n");
        cfg.health_check = Some(HealthCheckConfig {
            active: None,
            passive: Some(PassiveHealthCheck {
                consecutive_failures: 2,
                isolation_duration_secs: 60,
            }),
        });
        let up = Upstream::new(cfg, &proxy(), "round_robin");
        let target = up.targets()[0].clone();

        up.record_passive(&target, false, false);
        up.record_passive(&target, true, false);
        up.record_passive(&target, false, false);
        assert!(!target.is_isolated());
    }
}
