use crate::config::CircuitBreakerConfig;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-route circuit breaker state machine: Closed → Open → HalfOpen →
/// Closed/Open.
///
/// A missing breaker is created lazily from the route's effective config at
/// first observation. State transitions are serialized per route through a
/// mutex held only for the state read/transition, never across I/O.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<RouteBreaker>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Outcome of checking the breaker before a request.
pub enum BreakerDecision {
    /// Closed — proceed normally.
    Allow,
    /// Half-open — this request is one of the bounded probes.
    Probe,
    /// Open — reject immediately with gateway-unavailable.
    Reject(BreakerSnapshot),
}

/// Counters captured for response headers and logging.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub total: u64,
    pub failed: u64,
    pub error_rate: f64,
}

struct RouteBreaker {
    core: Mutex<BreakerCore>,
}

/// All counters are scoped to the current state epoch and reset at every
/// transition.
struct BreakerCore {
    state: BreakerState,
    config: CircuitBreakerConfig,
    total: u64,
    success: u64,
    failed: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    half_open_successes: u32,
    last_transition: Instant,
}

impl BreakerCore {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            config,
            total: 0,
            success: 0,
            failed: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            half_open_successes: 0,
            last_transition: Instant::now(),
        }
    }

    fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 * 100.0 / self.total as f64
        }
    }

    fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            total: self.total,
            failed: self.failed,
            error_rate: self.error_rate(),
        }
    }

    fn transition(&mut self, to: BreakerState, route_id: &str) {
        let from = self.state;
        self.state = to;
        self.total = 0;
        self.success = 0;
        self.failed = 0;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
        self.half_open_successes = 0;
        self.last_transition = Instant::now();
        metrics::counter!(
            "stargate_circuit_breaker_transitions_total",
            "route" => route_id.to_owned(),
            "to" => to.as_str(),
        )
        .increment(1);
        tracing::warn!(
            "circuit_breaker: route={} {} -> {}",
            route_id,
            from.as_str(),
            to.as_str(),
        );
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, route_id: &str, config: &CircuitBreakerConfig) -> Arc<RouteBreaker> {
        // Fast path: breaker already exists — no allocation.
        if let Some(entry) = self.breakers.get(route_id) {
            return entry.value().clone();
        }
        self.breakers
            .entry(route_id.to_string())
            .or_insert_with(|| {
                Arc::new(RouteBreaker {
                    core: Mutex::new(BreakerCore::new(config.clone())),
                })
            })
            .clone()
    }

    /// Check whether a request on `route_id` may proceed.
    pub fn check(&self, route_id: &str, config: &CircuitBreakerConfig) -> BreakerDecision {
        let breaker = self.get_or_create(route_id, config);
        let mut core = breaker.core.lock().unwrap();
        match core.state {
            BreakerState::Closed => BreakerDecision::Allow,
            BreakerState::Open => {
                let recovery = Duration::from_millis(core.config.recovery_timeout_ms);
                if core.last_transition.elapsed() >= recovery {
                    core.transition(BreakerState::HalfOpen, route_id);
                    core.half_open_in_flight = 1;
                    BreakerDecision::Probe
                } else {
                    BreakerDecision::Reject(core.snapshot())
                }
            }
            BreakerState::HalfOpen => {
                if core.half_open_in_flight < core.config.max_half_open_requests {
                    core.half_open_in_flight += 1;
                    BreakerDecision::Probe
                } else {
                    BreakerDecision::Reject(core.snapshot())
                }
            }
        }
    }

    /// Record a request outcome. Success is an HTTP status in [200, 300);
    /// everything else, including transport errors, counts as failure.
    pub fn record(&self, route_id: &str, config: &CircuitBreakerConfig, success: bool) {
        let breaker = self.get_or_create(route_id, config);
        let mut core = breaker.core.lock().unwrap();
        match core.state {
            BreakerState::Closed => {
                core.total += 1;
                if success {
                    core.success += 1;
                    core.consecutive_successes += 1;
                    core.consecutive_failures = 0;
                } else {
                    core.failed += 1;
                    core.consecutive_failures += 1;
                    core.consecutive_successes = 0;
                }

                // Both trip conditions are gated on the sample volume.
                if core.total >= core.config.request_volume_threshold {
                    let tripped = core.consecutive_failures >= core.config.failure_threshold
                        || core.error_rate() >= core.config.error_percentage_threshold;
                    if tripped {
                        core.transition(BreakerState::Open, route_id);
                    }
                }
            }
            BreakerState::HalfOpen => {
                core.half_open_in_flight = core.half_open_in_flight.saturating_sub(1);
                if success {
                    core.half_open_successes += 1;
                    if core.half_open_successes >= core.config.success_threshold {
                        core.transition(BreakerState::Closed, route_id);
                    }
                } else {
                    // Any probe failure re-opens.
                    core.transition(BreakerState::Open, route_id);
                }
            }
            // Late responses racing an Open transition carry no new signal.
            BreakerState::Open => {}
        }
    }

    /// Release a half-open probe slot without recording an outcome. Used
    /// when a later middleware short-circuits the request after the breaker
    /// admitted it, so no upstream exchange ever happened.
    pub fn release_probe(&self, route_id: &str) {
        if let Some(breaker) = self.breakers.get(route_id) {
            let mut core = breaker.value().core.lock().unwrap();
            if core.state == BreakerState::HalfOpen {
                core.half_open_in_flight = core.half_open_in_flight.saturating_sub(1);
            }
        }
    }

    /// Current counters for response headers; `None` when the route has no
    /// breaker yet.
    pub fn snapshot(&self, route_id: &str) -> Option<BreakerSnapshot> {
        self.breakers
            .get(route_id)
            .map(|b| b.value().core.lock().unwrap().snapshot())
    }

    /// Admin operation: clear counters and force the breaker closed.
    pub fn reset(&self, route_id: &str) -> bool {
        match self.breakers.get(route_id) {
            Some(breaker) => {
                let mut core = breaker.value().core.lock().unwrap();
                core.transition(BreakerState::Closed, route_id);
                true
            }
            None => false,
        }
    }

    /// Drop breakers for routes no longer present in the snapshot.
    pub fn retain_routes(&self, active: &std::collections::HashSet<String>) {
        self.breakers.retain(|id, _| active.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 3,
            success_threshold: 3,
            request_volume_threshold: 5,
            error_percentage_threshold: 50.0,
            recovery_timeout_ms: 50,
            max_half_open_requests: 1,
        }
    }

    fn drive_failures(reg: &BreakerRegistry, cfg: &CircuitBreakerConfig, n: usize) {
        for _ in 0..n {
            assert!(matches!(reg.check("r", cfg), BreakerDecision::Allow));
            reg.record("r", cfg, false);
        }
    }

    #[test]
    fn test_starts_closed() {
        let reg = BreakerRegistry::new();
        assert!(matches!(reg.check("r", &config()), BreakerDecision::Allow));
    }

    #[test]
    fn test_volume_threshold_gates_trip() {
        let reg = BreakerRegistry::new();
        let cfg = config();
        // 4 consecutive failures exceed failure_threshold but not the volume
        // threshold — the breaker must stay closed.
        drive_failures(&reg, &cfg, 4);
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Allow));
        // The 5th sample satisfies the volume gate and trips.
        reg.record("r", &cfg, false);
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Reject(_)));
    }

    #[test]
    fn test_error_rate_trips() {
        let reg = BreakerRegistry::new();
        let cfg = CircuitBreakerConfig {
            failure_threshold: 100, // out of reach; only the rate can trip
            ..config()
        };
        // 3 failures / 6 total = 50% >= threshold, volume 6 >= 5.
        reg.record("r", &cfg, true);
        reg.record("r", &cfg, false);
        reg.record("r", &cfg, true);
        reg.record("r", &cfg, false);
        reg.record("r", &cfg, true);
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Allow));
        reg.record("r", &cfg, false);
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Reject(_)));
    }

    #[test]
    fn test_open_rejects_with_snapshot() {
        let reg = BreakerRegistry::new();
        let cfg = config();
        drive_failures(&reg, &cfg, 5);
        match reg.check("r", &cfg) {
            BreakerDecision::Reject(snap) => {
                assert_eq!(snap.state, BreakerState::Open);
            }
            _ => panic!("expected reject"),
        }
    }

    #[test]
    fn test_half_open_after_recovery_timeout() {
        let reg = BreakerRegistry::new();
        let cfg = config();
        drive_failures(&reg, &cfg, 5);
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Reject(_)));

        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Probe));
    }

    #[test]
    fn test_half_open_bounds_concurrent_probes() {
        let reg = BreakerRegistry::new();
        let cfg = config();
        drive_failures(&reg, &cfg, 5);
        std::thread::sleep(Duration::from_millis(60));

        // One probe slot: the first check wins it, the second is rejected.
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Probe));
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Reject(_)));

        // Completing the probe frees the slot.
        reg.record("r", &cfg, true);
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Probe));
    }

    #[test]
    fn test_probe_successes_close() {
        let reg = BreakerRegistry::new();
        let cfg = config();
        drive_failures(&reg, &cfg, 5);
        std::thread::sleep(Duration::from_millis(60));

        for _ in 0..3 {
            assert!(matches!(reg.check("r", &cfg), BreakerDecision::Probe));
            reg.record("r", &cfg, true);
        }
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Allow));
        assert_eq!(reg.snapshot("r").unwrap().state, BreakerState::Closed);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let reg = BreakerRegistry::new();
        let cfg = config();
        drive_failures(&reg, &cfg, 5);
        std::thread::sleep(Duration::from_millis(60));

        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Probe));
        reg.record("r", &cfg, false);
        assert_eq!(reg.snapshot("r").unwrap().state, BreakerState::Open);
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Reject(_)));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let reg = BreakerRegistry::new();
        let cfg = config();
        // Alternate so consecutive_failures never reaches 3 and the rate
        // stays below 50% at each volume checkpoint.
        for _ in 0..6 {
            reg.record("r", &cfg, true);
            reg.record("r", &cfg, true);
            reg.record("r", &cfg, false);
        }
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Allow));
    }

    #[test]
    fn test_reset_forces_closed() {
        let reg = BreakerRegistry::new();
        let cfg = config();
        drive_failures(&reg, &cfg, 5);
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Reject(_)));

        assert!(reg.reset("r"));
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Allow));
        let snap = reg.snapshot("r").unwrap();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.total, 0);

        assert!(!reg.reset("unknown"));
    }

    #[test]
    fn test_counters_reset_at_transition() {
        let reg = BreakerRegistry::new();
        let cfg = config();
        drive_failures(&reg, &cfg, 5);
        let snap = reg.snapshot("r").unwrap();
        assert_eq!(snap.state, BreakerState::Open);
        assert_eq!(snap.total, 0, "epoch counters reset on transition");
    }

    #[test]
    fn test_retain_routes() {
        let reg = BreakerRegistry::new();
        let cfg = config();
        reg.check("a", &cfg);
        reg.check("b", &cfg);
        let mut keep = std::collections::HashSet::new();
        keep.insert("a".to_string());
        reg.retain_routes(&keep);
        assert!(reg.snapshot("a").is_some());
        assert!(reg.snapshot("b").is_none());
    }

    #[test]
    fn test_independent_routes() {
        let reg = BreakerRegistry::new();
        let cfg = config();
        drive_failures(&reg, &cfg, 5);
        assert!(matches!(reg.check("r", &cfg), BreakerDecision::Reject(_)));
        assert!(matches!(reg.check("other", &cfg), BreakerDecision::Allow));
    }
}
