use crate::config::source::ConfigSource;
use crate::config::store::ConfigStore;
use crate::config::{GatewayConfig, LoggingConfig};
use crate::server::{self, GatewayState};
use crate::upstream::HealthChecker;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    /// Overrides `server.address` when set.
    pub listen: Option<String>,
}

/// Gateway lifecycle: load → serve-state build → watch → serve → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    // Phase 1: bootstrap config (file + env overrides) and observability.
    let mut config = GatewayConfig::load(&args.config_path)?;
    if let Some(listen) = args.listen {
        config.server.address = listen;
        config.validate()?;
    }
    init_tracing(&config.logging);
    crate::metrics::install();

    tracing::info!(
        "server: starting stargate {}, listen={}, store={}",
        env!("CARGO_PKG_VERSION"),
        config.server.address,
        config.store.store_type,
    );

    // Phase 2: state from the initial snapshot.
    let store = Arc::new(ConfigStore::new(config));
    let state = GatewayState::new(store.current());

    // Phase 3: dynamic configuration source. A broken source is a startup
    // failure (exit 1) — serving stale config silently is worse.
    let source = Arc::new(build_config_source(&store.current()).await?);

    let shutdown = Arc::new(Notify::new());
    start_config_watcher(store.clone(), state.clone(), source.clone(), &shutdown);

    // Phase 4: background machinery.
    let checker = Arc::new(make_health_checker(&state));
    let checker_handle = checker.clone().spawn(shutdown.clone());
    state.limiter.start_gc();

    // Phase 5: serve.
    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(state, shutdown).await }
    });

    // Phase 6: block until signal, then clean up.
    wait_for_shutdown().await;
    shutdown.notify_waiters();
    source.close();
    checker.stop();

    if let Err(e) = proxy_handle.await? {
        tracing::error!("server: proxy task error: {}", e);
    }
    let _ = checker_handle.await;

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "text" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_target(false),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(false)
                    .json(),
            )
            .init();
    }

    // The writer guard must outlive main; the process exits with the runtime.
    std::mem::forget(guard);
}

async fn build_config_source(config: &Arc<GatewayConfig>) -> Result<ConfigSource> {
    match config.store.store_type.as_str() {
        "etcd" => {
            let source = ConfigSource::etcd(&config.config_source.etcd).await?;
            tracing::info!(
                "config: etcd source ready, key={}",
                config.config_source.etcd.key
            );
            Ok(source)
        }
        _ => {
            let source = ConfigSource::file(&config.config_source.file)?;
            tracing::info!(
                "config: file source ready, path={}, poll_interval_ms={}",
                config.config_source.file.path,
                config.config_source.file.poll_interval_ms
            );
            Ok(source)
        }
    }
}

/// Watch raw bytes, run them through the store (parse + validate + publish),
/// and apply accepted snapshots to the live state. A rejected snapshot
/// leaves the previous one serving.
fn start_config_watcher(
    store: Arc<ConfigStore>,
    state: GatewayState,
    source: Arc<ConfigSource>,
    shutdown: &Arc<Notify>,
) {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut rx = source.watch(shutdown);
        while let Some(bytes) = rx.recv().await {
            match store.apply_bytes(&bytes) {
                Ok(snapshot) => state.apply_snapshot(snapshot).await,
                Err(_) => {
                    // Already logged and counted by the store.
                }
            }
        }
        tracing::info!("config: watch ended");
    });
}

fn make_health_checker(state: &GatewayState) -> HealthChecker {
    let mut checker = HealthChecker::new(state.upstreams.clone());
    checker.subscribe(Arc::new(|transition| {
        tracing::info!(
            "health: transition, upstream={}, target={}, healthy={}",
            transition.upstream,
            transition.endpoint,
            transition.healthy,
        );
    }));
    checker
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
