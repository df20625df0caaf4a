use super::selectable;
use crate::upstream::target::Target;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Weighted random selection: draw a uniform integer in
/// [0, total-healthy-weight) and walk the prefix sum.
///
/// The prefix sum is computed over the selectable snapshot taken at call
/// time, so weights of unhealthy targets never dilute the draw.
pub struct WeightedBalancer {
    targets: ArcSwap<Vec<Arc<Target>>>,
}

impl Default for WeightedBalancer {
    fn default() -> Self {
        Self {
            targets: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl WeightedBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_targets(&self, targets: Vec<Arc<Target>>) {
        self.targets.store(Arc::new(targets));
    }

    pub fn select(&self) -> Option<Arc<Target>> {
        let targets = self.targets.load();
        let healthy = selectable(&targets);
        pick_weighted(&healthy, |total| rand::random::<u64>() % total)
    }

    pub fn targets(&self) -> Arc<Vec<Arc<Target>>> {
        self.targets.load_full()
    }
}

/// Shared prefix-sum walk for the weighted and ip-hash balancers.
/// `draw` receives the total weight and returns a point in [0, total).
/// Zero-weight targets never match; an all-zero set falls back to the first
/// entry so a misconfigured upstream still serves.
pub(super) fn pick_weighted(
    healthy: &[&Arc<Target>],
    draw: impl FnOnce(u64) -> u64,
) -> Option<Arc<Target>> {
    if healthy.is_empty() {
        return None;
    }
    let total: u64 = healthy.iter().map(|t| t.weight as u64).sum();
    if total == 0 {
        return Some(healthy[0].clone());
    }
    let point = draw(total);
    let mut cumulative = 0u64;
    for t in healthy {
        cumulative += t.weight as u64;
        if point < cumulative {
            return Some((*t).clone());
        }
    }
    Some(healthy[healthy.len() - 1].clone())
}
