pub mod ip_hash;
pub mod round_robin;
pub mod weighted;

use crate::upstream::target::Target;
use ip_hash::IpHashBalancer;
use round_robin::RoundRobinBalancer;
use std::net::IpAddr;
use std::sync::Arc;
use weighted::WeightedBalancer;

/// Enum-based load balancer — no trait objects, no dynamic dispatch.
///
/// Every variant stores its target list behind an `ArcSwap`, so
/// `update_targets` may run concurrently with `select` without a select ever
/// observing a torn list. Health is evaluated at the moment of selection:
/// only targets whose `healthy` bit is set (and whose passive isolation has
/// elapsed) participate.
pub enum Balancer {
    RoundRobin(RoundRobinBalancer),
    Weighted(WeightedBalancer),
    IpHash(IpHashBalancer),
}

impl Balancer {
    pub fn new(algorithm: &str) -> Arc<Self> {
        match algorithm {
            "weighted" => Arc::new(Self::Weighted(WeightedBalancer::new())),
            "ip_hash" => Arc::new(Self::IpHash(IpHashBalancer::new())),
            _ => Arc::new(Self::RoundRobin(RoundRobinBalancer::new())),
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::RoundRobin(_) => "round_robin",
            Self::Weighted(_) => "weighted",
            Self::IpHash(_) => "ip_hash",
        }
    }

    /// Atomically replace the target list.
    pub fn update_targets(&self, targets: Vec<Arc<Target>>) {
        match self {
            Self::RoundRobin(lb) => lb.update_targets(targets),
            Self::Weighted(lb) => lb.update_targets(targets),
            Self::IpHash(lb) => lb.update_targets(targets),
        }
    }

    /// Select a healthy target, or `None` when none is selectable.
    pub fn select(&self, client_ip: IpAddr) -> Option<Arc<Target>> {
        match self {
            Self::RoundRobin(lb) => lb.select(),
            Self::Weighted(lb) => lb.select(),
            Self::IpHash(lb) => lb.select(client_ip),
        }
    }

    pub fn targets(&self) -> Arc<Vec<Arc<Target>>> {
        match self {
            Self::RoundRobin(lb) => lb.targets(),
            Self::Weighted(lb) => lb.targets(),
            Self::IpHash(lb) => lb.targets(),
        }
    }

    /// Count of targets selectable right now.
    pub fn healthy_count(&self) -> usize {
        self.targets().iter().filter(|t| t.is_selectable()).count()
    }
}

/// Snapshot of the currently selectable targets. Collected once per select
/// so the algorithm and the health filter agree on one view.
pub(crate) fn selectable(targets: &[Arc<Target>]) -> Vec<&Arc<Target>> {
    targets.iter().filter(|t| t.is_selectable()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::target::test_target;

    #[test]
    fn test_algorithm_names() {
        assert_eq!(Balancer::new("round_robin").algorithm(), "round_robin");
        assert_eq!(Balancer::new("weighted").algorithm(), "weighted");
        assert_eq!(Balancer::new("ip_hash").algorithm(), "ip_hash");
        // Unknown names fall back to round robin.
        assert_eq!(Balancer::new("mystery").algorithm(), "round_robin");
    }

    #[test]
    fn test_healthy_count_tracks_health_bit() {
        let lb = Balancer::new("round_robin");
        let a = test_target("a", 80, 100);
        let b = test_target("b", 80, 100);
        lb.update_targets(vec![a.clone(), b.clone()]);
        assert_eq!(lb.healthy_count(), 2);
        a.set_healthy(false);
        assert_eq!(lb.healthy_count(), 1);
    }

    #[test]
    fn test_empty_select_returns_none() {
        let lb = Balancer::new("round_robin");
        lb.update_targets(vec![]);
        assert!(lb.select("10.0.0.1".parse().unwrap()).is_none());
    }
}
