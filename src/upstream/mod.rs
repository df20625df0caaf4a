pub mod canary;
pub mod circuit_breaker;
pub mod health;
pub mod loadbalance;
pub mod store;
pub mod target;

pub use canary::CanaryGroups;
pub use circuit_breaker::{BreakerDecision, BreakerRegistry, BreakerState};
pub use health::{HealthChecker, HealthSubscriber, HealthTransition};
pub use loadbalance::Balancer;
pub use store::{Upstream, UpstreamStore};
pub use target::Target;
