use super::selectable;
use crate::upstream::target::Target;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Round-robin over the healthy set using a monotonic counter.
///
/// The counter is taken modulo the number of currently selectable targets,
/// so any k consecutive selections over a stable healthy set of size k form
/// a permutation. No lock is held through downstream I/O — the counter is a
/// single atomic add.
pub struct RoundRobinBalancer {
    targets: ArcSwap<Vec<Arc<Target>>>,
    counter: AtomicU64,
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self {
            targets: ArcSwap::from_pointee(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_targets(&self, targets: Vec<Arc<Target>>) {
        self.targets.store(Arc::new(targets));
    }

    pub fn select(&self) -> Option<Arc<Target>> {
        let targets = self.targets.load();
        let healthy = selectable(&targets);
        if healthy.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let idx = (count % healthy.len() as u64) as usize;
        Some(healthy[idx].clone())
    }

    pub fn targets(&self) -> Arc<Vec<Arc<Target>>> {
        self.targets.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::target::test_target;
    use std::collections::HashSet;

    #[test]
    fn test_consecutive_selections_are_a_permutation() {
        let lb = RoundRobinBalancer::new();
        lb.update_targets(vec![
            test_target("a", 80, 100),
            test_target("b", 80, 100),
            test_target("c", 80, 100),
        ]);

        for _ in 0..5 {
            let picked: HashSet<String> = (0..3)
                .map(|_| lb.select().unwrap().endpoint().to_string())
                .collect();
            assert_eq!(picked.len(), 3);
        }
    }

    #[test]
    fn test_skips_unhealthy() {
        let lb = RoundRobinBalancer::new();
        let a = test_target("a", 80, 100);
        let b = test_target("b", 80, 100);
        lb.update_targets(vec![a.clone(), b.clone()]);

        a.set_healthy(false);
        for _ in 0..10 {
            assert_eq!(lb.select().unwrap().endpoint(), "b:80");
        }
    }

    #[test]
    fn test_empty_and_all_unhealthy() {
        let lb = RoundRobinBalancer::new();
        lb.update_targets(vec![]);
        assert!(lb.select().is_none());

        let a = test_target("a", 80, 100);
        a.set_healthy(false);
        lb.update_targets(vec![a]);
        assert!(lb.select().is_none());
    }

    #[test]
    fn test_single_target() {
        let lb = RoundRobinBalancer::new();
        lb.update_targets(vec![test_target("a", 80, 100)]);
        for _ in 0..20 {
            assert_eq!(lb.select().unwrap().endpoint(), "a:80");
        }
    }

    #[test]
    fn test_uniform_distribution() {
        let lb = RoundRobinBalancer::new();
        lb.update_targets(vec![test_target("a", 80, 100), test_target("b", 80, 100)]);
        let mut counts = std::collections::HashMap::new();
        for _ in 0..1000 {
            let t = lb.select().unwrap();
            *counts.entry(t.host.clone()).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 500);
        assert_eq!(counts["b"], 500);
    }
}
