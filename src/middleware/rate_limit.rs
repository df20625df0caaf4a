use crate::config::RateLimitConfig;
use crate::proxy::context::RequestContext;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// Entries not touched for this long are eligible for eviction.
const GC_EXPIRE: Duration = Duration::from_secs(300);
/// GC sweep period.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Atomic-increment key-value store with TTL.
///
/// Fixed-window counting runs entirely on this primitive, so N gateway
/// replicas pointed at a shared implementation (an external store) count one
/// global window. The in-process implementation below is a sharded map of
/// atomics.
pub trait CounterStore: Send + Sync {
    /// Atomically add one to `key`, creating it with `ttl` when absent.
    /// Returns the post-increment value.
    fn incr(&self, key: &str, ttl: Duration) -> u64;

    /// Read without modifying. `None` when absent or expired.
    fn get(&self, key: &str) -> Option<u64>;

    /// Drop expired entries. Called periodically by the owner.
    fn evict_expired(&self);
}

struct CounterEntry {
    value: AtomicU64,
    expires_at: Instant,
}

/// In-process `CounterStore`: a concurrent map of atomics. Shards come from
/// the underlying map; increments are lock-free on the hot path.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, Arc<CounterEntry>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryCounterStore {
    fn incr(&self, key: &str, ttl: Duration) -> u64 {
        // Fast path: live entry — no allocation.
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return entry.value.fetch_add(1, Ordering::Relaxed) + 1;
            }
        }
        // Slow path: insert or replace an expired entry.
        let fresh = Arc::new(CounterEntry {
            value: AtomicU64::new(0),
            expires_at: Instant::now() + ttl,
        });
        let entry = match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                if occ.get().expires_at <= Instant::now() {
                    occ.insert(fresh.clone());
                    fresh
                } else {
                    occ.get().clone()
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                vac.insert(fresh.clone());
                fresh
            }
        };
        entry.value.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn get(&self, key: &str) -> Option<u64> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.load(Ordering::Relaxed))
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }
}

/// Quota information carried on the 429 (and successful) responses:
/// `X-RateLimit-Limit`, `-Remaining`, `-Reset` (seconds until the window
/// rolls), `-Window` (window length in seconds).
#[derive(Debug, Clone)]
pub struct QuotaInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_secs: u64,
    pub window_secs: u64,
    pub window_start: u64,
}

/// Token bucket — mutex-protected so concurrent callers never skip a refill.
/// `tokio::sync::Mutex` keeps waiting callers on the runtime instead of
/// blocking the worker thread.
struct Bucket {
    inner: Mutex<BucketInner>,
    last_access: AtomicU64,
}

struct BucketInner {
    /// Micro-tokens: tokens scaled by `PRECISION`.
    tokens: u64,
    last_refill_us: u64,
}

const PRECISION: u64 = 1_000_000;

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Per-identifier quota enforcement. Buckets and windows are keyed by
/// (route-or-global, identifier); the instance is shared across config
/// reloads so counters survive a snapshot swap.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    buckets: DashMap<String, Arc<Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryCounterStore::new()))
    }

    /// Plug in a shared store implementation (the in-process default, or an
    /// external replica-shared one).
    pub fn with_store(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            buckets: DashMap::new(),
        }
    }

    /// Decide whether `identifier` may proceed under `config`.
    pub async fn allow(&self, config: &RateLimitConfig, identifier: &str) -> (bool, QuotaInfo) {
        match config.algorithm.as_str() {
            "token_bucket" => self.allow_token_bucket(config, identifier).await,
            _ => self.allow_fixed_window(config, identifier),
        }
    }

    fn allow_fixed_window(&self, config: &RateLimitConfig, identifier: &str) -> (bool, QuotaInfo) {
        let window = config.window_secs.max(1);
        let now = unix_now_secs();
        let window_start = now - now % window;

        // Bucket keyed by (identifier, window-start): after the window rolls
        // the key is fresh by construction, and the TTL lets the sweeper
        // reclaim old windows.
        let key = format!("{identifier}:{window_start}");
        let count = self
            .store
            .incr(&key, Duration::from_secs(window.saturating_mul(2)));

        let allowed = count <= config.max_requests;
        let quota = QuotaInfo {
            limit: config.max_requests,
            remaining: config.max_requests.saturating_sub(count),
            reset_secs: window_start + window - now,
            window_secs: window,
            window_start,
        };
        (allowed, quota)
    }

    async fn allow_token_bucket(
        &self,
        config: &RateLimitConfig,
        identifier: &str,
    ) -> (bool, QuotaInfo) {
        let rate = config.rate.max(0.000_001);
        let capacity = config.burst.max(1);
        let max_tokens = capacity * PRECISION;

        let bucket = if let Some(entry) = self.buckets.get(identifier) {
            entry.value().clone()
        } else {
            self.buckets
                .entry(identifier.to_string())
                .or_insert_with(|| {
                    Arc::new(Bucket {
                        inner: Mutex::new(BucketInner {
                            tokens: max_tokens,
                            last_refill_us: now_us(),
                        }),
                        last_access: AtomicU64::new(now_us()),
                    })
                })
                .clone()
        };
        bucket.last_access.store(now_us(), Ordering::Relaxed);

        let mut inner = bucket.inner.lock().await;

        // Lazy refill from elapsed wall time since the last refill.
        let now = now_us();
        let elapsed = now.saturating_sub(inner.last_refill_us);
        if elapsed > 0 {
            let refill = (elapsed as f64 * rate / 1_000_000.0 * PRECISION as f64) as u64;
            inner.tokens = (inner.tokens + refill).min(max_tokens);
            inner.last_refill_us = now;
        }

        let allowed = if inner.tokens >= PRECISION {
            inner.tokens -= PRECISION;
            true
        } else {
            false
        };

        let remaining = inner.tokens / PRECISION;
        let reset_secs = if allowed {
            0
        } else {
            // Seconds until one full token is available.
            let deficit = PRECISION - inner.tokens;
            ((deficit as f64 / PRECISION as f64) / rate).ceil() as u64
        };
        let quota = QuotaInfo {
            limit: capacity,
            remaining,
            reset_secs,
            window_secs: 0,
            window_start: 0,
        };
        (allowed, quota)
    }

    /// Derive the rate-limit identifier for a request.
    /// Strategies: "ip", "user" (header), "api_key" (header), "combined".
    pub fn extract_identifier(
        config: &RateLimitConfig,
        ctx: &RequestContext,
        headers: &http::HeaderMap,
    ) -> String {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        match config.identifier.as_str() {
            "user" => header(&config.user_header),
            "api_key" => header(&config.api_key_header),
            "combined" => format!(
                "{}:{}:{}",
                ctx.client_ip,
                header(&config.user_header),
                header(&config.api_key_header)
            ),
            _ => ctx.client_ip.to_string(),
        }
    }

    /// Spawn the periodic eviction task: expired fixed windows and idle
    /// token buckets are reclaimed so dynamic identifiers cannot grow the
    /// maps without bound.
    pub fn start_gc(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                limiter.evict_stale();
            }
        });
    }

    fn evict_stale(&self) {
        self.store.evict_expired();
        let cutoff = now_us().saturating_sub(GC_EXPIRE.as_micros() as u64);
        self.buckets
            .retain(|_, b| b.last_access.load(Ordering::Relaxed) > cutoff);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
