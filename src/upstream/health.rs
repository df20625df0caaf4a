use crate::config::ActiveHealthCheck;
use crate::upstream::store::{Upstream, UpstreamStore};
use crate::upstream::target::Target;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A health transition observed by the active checker. Subscribers are
/// invoked synchronously before the probe round continues.
pub struct HealthTransition {
    pub upstream: String,
    pub endpoint: String,
    pub healthy: bool,
}

pub type HealthSubscriber = Arc<dyn Fn(&HealthTransition) + Send + Sync>;

/// Active health prober. Each upstream with an active policy is probed at
/// its configured interval; targets flip healthy/unhealthy on consecutive
/// streak thresholds. The checker is cancellable and idempotent on stop.
pub struct HealthChecker {
    store: UpstreamStore,
    client: reqwest::Client,
    subscribers: Vec<HealthSubscriber>,
    last_probe: DashMap<String, Instant>,
    stopped: AtomicBool,
}

impl HealthChecker {
    pub fn new(store: UpstreamStore) -> Self {
        Self {
            store,
            client: build_probe_client(),
            subscribers: Vec::new(),
            last_probe: DashMap::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Register a transition subscriber. Called synchronously on every
    /// healthy-bit flip, before the flip's probe round returns.
    pub fn subscribe(&mut self, subscriber: HealthSubscriber) {
        self.subscribers.push(subscriber);
    }

    /// Stop the checker. Safe to call more than once.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Spawn the probe loop. A coarse 1s tick drives per-upstream interval
    /// bookkeeping so upstreams may have different probe intervals.
    pub fn spawn(self: Arc<Self>, shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_stopped() {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown.notified() => return,
                }
                self.run_once().await;
            }
        })
    }

    /// Run a single round: probe every actively-checked upstream whose
    /// interval has elapsed.
    pub async fn run_once(&self) {
        let mut due: Vec<(Upstream, Arc<ActiveHealthCheck>, Vec<Arc<Target>>)> = Vec::new();

        self.store.for_each(|id, upstream| {
            let Some(hc) = &upstream.config().health_check else {
                return;
            };
            let Some(active) = &hc.active else {
                return;
            };

            let interval = Duration::from_secs(active.interval_secs.max(1));
            let elapsed = self
                .last_probe
                .get(id)
                .map(|t| t.elapsed() >= interval)
                .unwrap_or(true);
            if !elapsed {
                return;
            }
            self.last_probe.insert(id.to_string(), Instant::now());

            let targets: Vec<Arc<Target>> = upstream.targets().iter().cloned().collect();
            if targets.is_empty() {
                return;
            }
            due.push((upstream.clone(), Arc::new(active.clone()), targets));
        });

        for (upstream, active, targets) in due {
            let concurrency = active.concurrency.max(1);
            stream::iter(targets)
                .map(|target| {
                    let upstream = upstream.clone();
                    let active = active.clone();
                    async move {
                        self.probe_target(&upstream, &active, &target).await;
                    }
                })
                .buffer_unordered(concurrency)
                .collect::<()>()
                .await;
        }
    }

    async fn probe_target(&self, upstream: &Upstream, active: &ActiveHealthCheck, target: &Target) {
        // Passively isolated targets sit out their window; probing resumes
        // once it elapses.
        if target.is_isolated() {
            return;
        }

        let url = format!(
            "{}://{}{}",
            upstream.scheme_for(target),
            target.endpoint(),
            active.path
        );

        let result = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(active.timeout_secs))
            .send()
            .await;

        let success = matches!(&result, Ok(resp) if resp.status().is_success());
        let streak = target.record_probe(success);

        metrics::counter!(
            "stargate_health_check_total",
            "upstream" => upstream.id().to_owned(),
            "target" => target.endpoint().to_owned(),
            "result" => if success { "success" } else { "failure" },
        )
        .increment(1);

        if success {
            // A never-admitted target joins on its first passing probe;
            // re-admission after going unhealthy needs the full threshold.
            let needed = if target.ever_healthy() {
                active.healthy_threshold
            } else {
                1
            };
            if streak >= needed && !target.is_healthy() {
                target.set_healthy(true);
                target.clear_isolation();
                self.notify(upstream.id(), target, true);
            }
            debug!(
                "health: active: probe passed, upstream={}, target={}",
                upstream.id(),
                target.endpoint()
            );
        } else {
            if streak >= active.unhealthy_threshold && target.is_healthy() {
                target.set_healthy(false);
                self.notify(upstream.id(), target, false);
                warn!(
                    "health: active: target marked unhealthy, upstream={}, target={}, consecutive_failures={}",
                    upstream.id(),
                    target.endpoint(),
                    streak,
                );
            }
            debug!(
                "health: active: probe failed, upstream={}, target={}",
                upstream.id(),
                target.endpoint()
            );
        }
    }

    fn notify(&self, upstream: &str, target: &Target, healthy: bool) {
        let transition = HealthTransition {
            upstream: upstream.to_string(),
            endpoint: target.endpoint().to_string(),
            healthy,
        };
        metrics::gauge!(
            "stargate_upstream_health_status",
            "upstream" => transition.upstream.clone(),
            "target" => transition.endpoint.clone(),
        )
        .set(if healthy { 1.0 } else { 0.0 });
        for subscriber in &self.subscribers {
            subscriber(&transition);
        }
    }
}

fn build_probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .no_proxy()
        .build()
        .expect("failed to build health check client")
}
