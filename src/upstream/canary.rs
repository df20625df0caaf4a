use crate::config::GatewayConfig;
use std::collections::HashMap;

/// Version-weighted selection across a set of upstreams sharing a canary
/// group id. Built whole from a config snapshot and swapped atomically with
/// the rest of the routing state.
pub struct CanaryGroups {
    groups: HashMap<String, CanaryGroup>,
}

pub struct CanaryGroup {
    pub id: String,
    strategy: CanaryStrategy,
    rules: Vec<CanaryRule>,
    /// Ordered by upstream declaration order in the snapshot.
    pub versions: Vec<CanaryVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CanaryStrategy {
    Weighted,
    Percentage,
    /// Falls back to weighted selection until explicit rules are supplied;
    /// rules, when present, are evaluated first regardless of strategy.
    HeaderBased,
    Single,
}

struct CanaryRule {
    kind: RuleKind,
    name: String,
    value: String,
    version: String,
}

enum RuleKind {
    Header,
    Cookie,
    Query,
}

pub struct CanaryVersion {
    pub label: String,
    pub upstream_id: String,
    pub weight: u32,
    pub percentage: u32,
}

impl CanaryGroups {
    /// Assemble groups from explicit `load_balancer.canary_groups` entries
    /// plus the upstream membership declarations. A membership referencing a
    /// group with no explicit entry creates an implicit weighted group.
    pub fn build(config: &GatewayConfig) -> Self {
        let mut groups: HashMap<String, CanaryGroup> = HashMap::new();

        for gc in &config.load_balancer.canary_groups {
            let strategy = match gc.strategy.as_str() {
                "percentage" => CanaryStrategy::Percentage,
                "header_based" => CanaryStrategy::HeaderBased,
                "single" => CanaryStrategy::Single,
                _ => CanaryStrategy::Weighted,
            };
            let rules = gc
                .rules
                .iter()
                .filter_map(|r| {
                    let kind = match r.kind.as_str() {
                        "header" => RuleKind::Header,
                        "cookie" => RuleKind::Cookie,
                        "query" => RuleKind::Query,
                        other => {
                            tracing::warn!(
                                "canary: group '{}' rule kind '{}' unknown, dropped",
                                gc.id,
                                other
                            );
                            return None;
                        }
                    };
                    Some(CanaryRule {
                        kind,
                        name: r.name.clone(),
                        value: r.value.clone(),
                        version: r.version.clone(),
                    })
                })
                .collect();
            groups.insert(
                gc.id.clone(),
                CanaryGroup {
                    id: gc.id.clone(),
                    strategy,
                    rules,
                    versions: Vec::new(),
                },
            );
        }

        for up in &config.upstreams {
            let Some(ref membership) = up.canary else {
                continue;
            };
            let group = groups
                .entry(membership.group.clone())
                .or_insert_with(|| CanaryGroup {
                    id: membership.group.clone(),
                    strategy: CanaryStrategy::Weighted,
                    rules: Vec::new(),
                    versions: Vec::new(),
                });
            group.versions.push(CanaryVersion {
                label: membership.version.clone(),
                upstream_id: up.id.clone(),
                weight: membership.weight,
                percentage: membership.percentage,
            });
        }

        Self { groups }
    }

    pub fn get(&self, id: &str) -> Option<&CanaryGroup> {
        self.groups.get(id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl CanaryGroup {
    /// Pick a version for this request. Explicit rules win; weighting covers
    /// the rest. `healthy` reports whether a version's upstream currently has
    /// at least one selectable target — only healthy versions participate,
    /// and selection fails when every version is unhealthy.
    pub fn select_version(
        &self,
        headers: &http::HeaderMap,
        query: &[(String, String)],
        healthy: impl Fn(&str) -> bool,
    ) -> Option<&CanaryVersion> {
        // Rule evaluation order: explicit rules → weighted fallback.
        for rule in &self.rules {
            if rule.matches(headers, query) {
                if let Some(version) = self
                    .versions
                    .iter()
                    .find(|v| v.label == rule.version && healthy(&v.upstream_id))
                {
                    return Some(version);
                }
            }
        }

        let healthy_versions: Vec<&CanaryVersion> = self
            .versions
            .iter()
            .filter(|v| healthy(&v.upstream_id))
            .collect();
        if healthy_versions.is_empty() {
            return None;
        }

        match self.strategy {
            CanaryStrategy::Single => Some(healthy_versions[0]),
            CanaryStrategy::Percentage => {
                Self::draw(&healthy_versions, |v| v.percentage as u64)
            }
            // header_based without a matching rule behaves as weighted.
            CanaryStrategy::Weighted | CanaryStrategy::HeaderBased => {
                Self::draw(&healthy_versions, |v| v.weight as u64)
            }
        }
    }

    /// Weighted draw over the healthy versions. A zero total falls back to a
    /// uniform pick so a group whose weights were all zeroed still serves.
    fn draw<'a>(
        healthy: &[&'a CanaryVersion],
        share: impl Fn(&CanaryVersion) -> u64,
    ) -> Option<&'a CanaryVersion> {
        let total: u64 = healthy.iter().map(|v| share(v)).sum();
        if total == 0 {
            let idx = (rand::random::<u64>() % healthy.len() as u64) as usize;
            return Some(healthy[idx]);
        }
        let point = rand::random::<u64>() % total;
        let mut cumulative = 0u64;
        for v in healthy {
            cumulative += share(v);
            if point < cumulative {
                return Some(v);
            }
        }
        Some(healthy[healthy.len() - 1])
    }
}

impl CanaryRule {
    fn matches(&self, headers: &http::HeaderMap, query: &[(String, String)]) -> bool {
        match self.kind {
            RuleKind::Header => headers
                .get(self.name.as_str())
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == self.value),
            RuleKind::Cookie => headers
                .get(http::header::COOKIE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|cookies| {
                    cookies.split(';').any(|pair| {
                        let mut it = pair.trim().splitn(2, '=');
                        it.next() == Some(self.name.as_str())
                            && it.next() == Some(self.value.as_str())
                    })
                }),
            RuleKind::Query => query.iter().any(|(k, v)| *k == self.name && *v == self.value),
        }
    }
}
