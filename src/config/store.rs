use crate::config::GatewayConfig;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Owns the current typed configuration snapshot.
///
/// `apply_bytes` parses and validates a raw document; a failure leaves the
/// previous snapshot in place and reports the error to the caller. Accepted
/// snapshots are published to subscribers, which observe monotonically newer
/// values (intermediate snapshots may be skipped by a slow subscriber).
pub struct ConfigStore {
    current: ArcSwap<GatewayConfig>,
    tx: watch::Sender<Arc<GatewayConfig>>,
    generation: std::sync::atomic::AtomicU64,
}

impl ConfigStore {
    pub fn new(initial: GatewayConfig) -> Self {
        let initial = Arc::new(initial);
        let (tx, _) = watch::channel(initial.clone());
        Self {
            current: ArcSwap::new(initial),
            tx,
            generation: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// The snapshot readers see right now.
    pub fn current(&self) -> Arc<GatewayConfig> {
        self.current.load_full()
    }

    /// Number of accepted snapshots since startup.
    pub fn generation(&self) -> u64 {
        self.generation.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Subscribe to snapshot updates. The receiver holds the latest value
    /// immediately.
    pub fn subscribe(&self) -> watch::Receiver<Arc<GatewayConfig>> {
        self.tx.subscribe()
    }

    /// Parse, validate, and publish a new raw document. Environment
    /// overrides are re-applied so operator-pinned settings survive reloads.
    pub fn apply_bytes(&self, bytes: &[u8]) -> Result<Arc<GatewayConfig>> {
        let mut config = match GatewayConfig::parse(bytes) {
            Ok(c) => c,
            Err(e) => {
                warn!("config: snapshot parse failed, keeping previous: {}", e);
                metrics::counter!("stargate_config_reloads_total", "result" => "error")
                    .increment(1);
                return Err(e);
            }
        };

        config.apply_env_overrides();

        if let Err(e) = config.validate() {
            warn!("config: snapshot validation failed, keeping previous: {}", e);
            metrics::counter!("stargate_config_reloads_total", "result" => "error").increment(1);
            return Err(e);
        }

        let snapshot = Arc::new(config);
        self.current.store(snapshot.clone());
        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        // Publish; subscribers having gone away is not an error.
        let _ = self.tx.send(snapshot.clone());

        metrics::counter!("stargate_config_reloads_total", "result" => "success").increment(1);
        info!(
            "config: snapshot accepted, generation={}, routes={}, upstreams={}",
            generation,
            snapshot.routes.len(),
            snapshot.upstreams.len()
        );
        Ok(snapshot)
    }
}
