use crate::config::TargetConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A concrete host:port endpoint with weight, health, and metadata.
///
/// The `healthy` bit is written by the health checker (active probes); the
/// proxy engine's passive signals write the isolation deadline. Everything
/// else is immutable once published. Shared via `Arc` between the balancer
/// (reader) and the health machinery (writer), so a config reload can keep
/// runtime state for targets that survive it.
#[derive(Debug)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub metadata: HashMap<String, String>,

    healthy: AtomicBool,
    /// Set the first time the target is marked healthy. A fresh target is
    /// admitted by a single successful probe; re-admission after a failure
    /// requires the full healthy threshold.
    ever_healthy: AtomicBool,
    /// Milliseconds (since process start) until which passive isolation
    /// holds. 0 = not isolated.
    isolated_until_ms: AtomicU64,

    /// Active probe streaks. Success resets the failure streak and vice
    /// versa.
    probe_successes: AtomicU32,
    probe_failures: AtomicU32,

    /// Consecutive request failures observed by the proxy engine.
    passive_failures: AtomicU32,

    /// Pre-computed "host:port" — avoids a `format!()` allocation on every
    /// request in endpoint lookups, health recording, and logging.
    endpoint: Arc<str>,
}

/// Monotonic clock base for isolation deadlines.
fn now_ms() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

impl Target {
    /// Build from config. Targets of an actively health-checked upstream
    /// start unhealthy until their first successful probe (preventing
    /// cold-start storms); unchecked targets start healthy.
    pub fn from_config(cfg: &TargetConfig, initially_healthy: bool) -> Self {
        let endpoint: Arc<str> = format!("{}:{}", cfg.host, cfg.port).into();
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            weight: cfg.weight,
            metadata: cfg.metadata.clone(),
            healthy: AtomicBool::new(initially_healthy),
            ever_healthy: AtomicBool::new(initially_healthy),
            isolated_until_ms: AtomicU64::new(0),
            probe_successes: AtomicU32::new(0),
            probe_failures: AtomicU32::new(0),
            passive_failures: AtomicU32::new(0),
            endpoint,
        }
    }

    /// Returns the cached "host:port" string. Zero allocation.
    #[inline]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
        if healthy {
            self.ever_healthy.store(true, Ordering::Release);
        }
    }

    pub fn ever_healthy(&self) -> bool {
        self.ever_healthy.load(Ordering::Acquire)
    }

    /// Whether the balancer may hand this target out right now: the health
    /// bit is set and any passive isolation window has elapsed.
    pub fn is_selectable(&self) -> bool {
        if !self.is_healthy() {
            return false;
        }
        let until = self.isolated_until_ms.load(Ordering::Acquire);
        until == 0 || now_ms() >= until
    }

    pub fn is_isolated(&self) -> bool {
        let until = self.isolated_until_ms.load(Ordering::Acquire);
        until != 0 && now_ms() < until
    }

    /// Passive isolation: take the target out of rotation for `duration_ms`.
    /// After the window the target is probed again (active checking) or
    /// re-admitted directly (passive-only).
    pub fn isolate_for_ms(&self, duration_ms: u64) {
        self.isolated_until_ms
            .store(now_ms() + duration_ms, Ordering::Release);
    }

    pub fn clear_isolation(&self) {
        self.isolated_until_ms.store(0, Ordering::Release);
    }

    /// Record a passive request outcome; returns the consecutive failure
    /// count after the update.
    pub fn record_passive(&self, success: bool) -> u32 {
        if success {
            self.passive_failures.store(0, Ordering::Relaxed);
            0
        } else {
            self.passive_failures.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    /// Record an active probe outcome; returns the streak length in the
    /// probed direction.
    pub fn record_probe(&self, success: bool) -> u32 {
        if success {
            self.probe_failures.store(0, Ordering::Relaxed);
            self.probe_successes.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.probe_successes.store(0, Ordering::Relaxed);
            self.probe_failures.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    pub fn reset_passive_failures(&self) {
        self.passive_failures.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) fn test_target(host: &str, port: u16, weight: u32) -> Arc<Target> {
    Arc::new(Target::from_config(
        &TargetConfig {
            host: host.to_string(),
            port,
            weight,
            metadata: HashMap::new(),
        },
        true,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(healthy: bool) -> Target {
        Target::from_config(
            &TargetConfig {
                host: "10.0.0.1".into(),
                port: 8080,
                weight: 100,
                metadata: HashMap::new(),
            },
            healthy,
        )
    }

    #[test]
    fn test_endpoint_precomputed() {
        let t = target(true);
        assert_eq!(t.endpoint(), "10.0.0.1:8080");
    }

    #[test]
    fn test_initially_unhealthy_until_probe() {
        let t = target(false);
        assert!(!t.is_healthy());
        assert!(!t.is_selectable());
        t.set_healthy(true);
        assert!(t.is_selectable());
    }

    #[test]
    fn test_isolation_blocks_selection() {
        let t = target(true);
        assert!(t.is_selectable());
        t.isolate_for_ms(60_000);
        assert!(t.is_isolated());
        assert!(!t.is_selectable());
        t.clear_isolation();
        assert!(t.is_selectable());
    }

    #[test]
    fn test_expired_isolation_readmits() {
        let t = target(true);
        t.isolate_for_ms(0);
        // A zero-length window has already elapsed.
        assert!(!t.is_isolated());
        assert!(t.is_selectable());
    }

    #[test]
    fn test_passive_failure_streak() {
        let t = target(true);
        assert_eq!(t.record_passive(false), 1);
        assert_eq!(t.record_passive(false), 2);
        assert_eq!(t.record_passive(true), 0);
        assert_eq!(t.record_passive(false), 1);
    }

    #[test]
    fn test_probe_streaks_reset_each_other() {
        let t = target(false);
        assert_eq!(t.record_probe(true), 1);
        assert_eq!(t.record_probe(true), 2);
        assert_eq!(t.record_probe(false), 1);
        // The success streak was reset by the failure.
        assert_eq!(t.record_probe(true), 1);
    }
}
