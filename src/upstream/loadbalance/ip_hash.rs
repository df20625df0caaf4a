use super::selectable;
use super::weighted::pick_weighted;
use crate::upstream::target::Target;
use arc_swap::ArcSwap;
use std::net::IpAddr;
use std::sync::Arc;

/// Client-IP affinity: a 32-bit hash of the client address taken modulo the
/// total healthy weight, walked over the prefix sum. Deterministic per
/// client as long as the healthy set is unchanged.
pub struct IpHashBalancer {
    targets: ArcSwap<Vec<Arc<Target>>>,
}

impl Default for IpHashBalancer {
    fn default() -> Self {
        Self {
            targets: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl IpHashBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_targets(&self, targets: Vec<Arc<Target>>) {
        self.targets.store(Arc::new(targets));
    }

    pub fn select(&self, client_ip: IpAddr) -> Option<Arc<Target>> {
        let targets = self.targets.load();
        let healthy = selectable(&targets);
        let hash = hash_ip(client_ip) as u64;
        pick_weighted(&healthy, |total| hash % total)
    }

    pub fn targets(&self) -> Arc<Vec<Arc<Target>>> {
        self.targets.load_full()
    }
}

/// FNV-1a over the address bytes. 32-bit, stable across processes.
fn hash_ip(ip: IpAddr) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    let mut feed = |bytes: &[u8]| {
        for &b in bytes {
            hash ^= b as u32;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    match ip {
        IpAddr::V4(v4) => feed(&v4.octets()),
        IpAddr::V6(v6) => feed(&v6.octets()),
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::target::test_target;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_deterministic_per_client() {
        let lb = IpHashBalancer::new();
        lb.update_targets(vec![
            test_target("a", 80, 100),
            test_target("b", 80, 100),
            test_target("c", 80, 100),
        ]);

        let first = lb.select(ip("203.0.113.7")).unwrap().endpoint().to_string();
        for _ in 0..20 {
            assert_eq!(lb.select(ip("203.0.113.7")).unwrap().endpoint(), first);
        }
    }

    #[test]
    fn test_different_clients_spread() {
        let lb = IpHashBalancer::new();
        lb.update_targets(vec![
            test_target("a", 80, 100),
            test_target("b", 80, 100),
            test_target("c", 80, 100),
            test_target("d", 80, 100),
        ]);

        let mut hosts = std::collections::HashSet::new();
        for i in 0..64u8 {
            let client = ip(&format!("10.1.{}.{}", i, i.wrapping_mul(7)));
            hosts.insert(lb.select(client).unwrap().host.clone());
        }
        // 64 distinct clients over 4 targets must hit more than one target.
        assert!(hosts.len() > 1);
    }

    #[test]
    fn test_health_change_remaps() {
        let lb = IpHashBalancer::new();
        let a = test_target("a", 80, 100);
        let b = test_target("b", 80, 100);
        lb.update_targets(vec![a.clone(), b.clone()]);

        let client = ip("198.51.100.9");
        let picked = lb.select(client).unwrap();
        let other = if picked.host == "a" { &b } else { &a };

        // Take the picked target down: the same client lands on the survivor.
        picked.set_healthy(false);
        assert_eq!(lb.select(client).unwrap().host, other.host);
    }

    #[test]
    fn test_v6_supported() {
        let lb = IpHashBalancer::new();
        lb.update_targets(vec![test_target("a", 80, 100), test_target("b", 80, 100)]);
        let first = lb.select(ip("2001:db8::1")).unwrap().endpoint().to_string();
        assert_eq!(lb.select(ip("2001:db8::1")).unwrap().endpoint(), first);
    }

    #[test]
    fn test_hash_is_stable() {
        // FNV-1a reference value for 1.2.3.4.
        assert_eq!(hash_ip(ip("1.2.3.4")), hash_ip(ip("1.2.3.4")));
        assert_ne!(hash_ip(ip("1.2.3.4")), hash_ip(ip("1.2.3.5")));
    }
}
