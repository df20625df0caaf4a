use crate::config::{EtcdConfig, FileSourceConfig};
use crate::etcd::EtcdClient;
use anyhow::Result;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// How long the etcd driver sleeps before re-establishing a broken watch.
const ETCD_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Abstract pull+watch of raw configuration bytes.
///
/// `watch()` delivers the current value immediately, then again on every
/// change, until the source is closed or the per-watch shutdown fires. Each
/// `watch()` call is independent: a new subscriber always gets a fresh
/// initial value. Transient errors inside a watch are logged and recovered;
/// they never terminate the sequence.
pub enum ConfigSource {
    File(FileSource),
    Etcd(EtcdSource),
}

impl ConfigSource {
    /// Build a file-backed source. Fails when the path does not exist —
    /// a watchable source must have an initial value.
    pub fn file(cfg: &FileSourceConfig) -> Result<Self> {
        let path = PathBuf::from(&cfg.path);
        if !path.is_file() {
            anyhow::bail!("config source file '{}' does not exist", cfg.path);
        }
        Ok(Self::File(FileSource {
            path,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
            closed: Arc::new(Closed::new()),
        }))
    }

    /// Build an etcd-backed source. Fails when no endpoint is reachable,
    /// authentication is rejected, or the key is absent.
    pub async fn etcd(cfg: &EtcdConfig) -> Result<Self> {
        let client = EtcdClient::connect(cfg).await?;
        if client.get(&cfg.key).await?.is_none() {
            anyhow::bail!("etcd key '{}' not found", cfg.key);
        }
        Ok(Self::Etcd(EtcdSource {
            client,
            key: cfg.key.clone(),
            closed: Arc::new(Closed::new()),
        }))
    }

    /// Read the current raw value.
    pub async fn get(&self) -> Result<Bytes> {
        match self {
            Self::File(s) => s.get().await,
            Self::Etcd(s) => s.get().await,
        }
    }

    /// Start watching. The receiver yields the current value first, then one
    /// item per observed change. The stream ends when `shutdown` is notified
    /// or the source is closed.
    pub fn watch(&self, shutdown: Arc<Notify>) -> mpsc::Receiver<Bytes> {
        match self {
            Self::File(s) => s.watch(shutdown),
            Self::Etcd(s) => s.watch(shutdown),
        }
    }

    /// Stop all watchers. Idempotent — closing twice is a no-op.
    pub fn close(&self) {
        match self {
            Self::File(s) => s.closed.close(),
            Self::Etcd(s) => s.closed.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::File(s) => s.closed.is_closed(),
            Self::Etcd(s) => s.closed.is_closed(),
        }
    }
}

/// Close flag shared between a source and its spawned watchers.
struct Closed {
    flag: AtomicBool,
    notify: Notify,
}

impl Closed {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn close(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Polls the file's modification time and re-reads the whole file when it is
/// strictly newer than the last observed timestamp. Callers tolerate
/// identical bytes, so no content diffing is done here.
pub struct FileSource {
    path: PathBuf,
    poll_interval: Duration,
    closed: Arc<Closed>,
}

impl FileSource {
    async fn get(&self) -> Result<Bytes> {
        let data = tokio::fs::read(&self.path).await?;
        Ok(Bytes::from(data))
    }

    fn watch(&self, shutdown: Arc<Notify>) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(8);
        let path = self.path.clone();
        let poll_interval = self.poll_interval;
        let closed = self.closed.clone();

        tokio::spawn(async move {
            let mut last_mtime = match read_with_mtime(&path).await {
                Ok((bytes, mtime)) => {
                    if tx.send(bytes).await.is_err() {
                        return;
                    }
                    mtime
                }
                Err(e) => {
                    warn!("config: file source initial read failed: {}", e);
                    SystemTime::UNIX_EPOCH
                }
            };

            loop {
                if closed.is_closed() {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.notified() => return,
                    _ = closed.notify.notified() => return,
                }

                let mtime = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("config: file source stat failed: {}", e);
                        continue;
                    }
                };

                if mtime <= last_mtime {
                    continue;
                }

                match tokio::fs::read(&path).await {
                    Ok(data) => {
                        last_mtime = mtime;
                        debug!("config: file source changed, {} bytes", data.len());
                        if tx.send(Bytes::from(data)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("config: file source read failed: {}", e);
                    }
                }
            }
        });

        rx
    }
}

async fn read_with_mtime(path: &PathBuf) -> Result<(Bytes, SystemTime)> {
    let data = tokio::fs::read(path).await?;
    let mtime = tokio::fs::metadata(path).await?.modified()?;
    Ok((Bytes::from(data), mtime))
}

/// Watches a single etcd key. A broken watch stream is re-established after
/// a short sleep, and the current value is re-emitted so downstream readers
/// converge — connection loss is transparent to the subscriber.
pub struct EtcdSource {
    client: EtcdClient,
    key: String,
    closed: Arc<Closed>,
}

impl EtcdSource {
    async fn get(&self) -> Result<Bytes> {
        match self.client.get(&self.key).await? {
            Some(value) => Ok(Bytes::from(value)),
            None => anyhow::bail!("etcd key '{}' not found", self.key),
        }
    }

    fn watch(&self, shutdown: Arc<Notify>) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(8);
        let client = self.client.clone();
        let key = self.key.clone();
        let closed = self.closed.clone();

        tokio::spawn(async move {
            let mut revision: Option<i64> = None;
            let mut need_initial = true;

            loop {
                if closed.is_closed() {
                    return;
                }

                // (Re-)emit the current value: on first subscription and
                // after every reconnect, so readers converge regardless of
                // events missed while the stream was down.
                if need_initial {
                    match client.get(&key).await {
                        Ok(Some(value)) => {
                            if tx.send(Bytes::from(value)).await.is_err() {
                                return;
                            }
                            need_initial = false;
                        }
                        Ok(None) => {
                            warn!("config: etcd key '{}' missing, waiting for put", key);
                            need_initial = false;
                        }
                        Err(e) => {
                            warn!("config: etcd read failed: {}, retrying", e);
                            tokio::select! {
                                _ = tokio::time::sleep(ETCD_RECONNECT_DELAY) => continue,
                                _ = shutdown.notified() => return,
                                _ = closed.notify.notified() => return,
                            }
                        }
                    }
                }

                let mut stream = match client.watch_key(&key, revision.map(|r| r + 1)).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("config: etcd watch open failed: {}, retrying", e);
                        need_initial = true;
                        tokio::select! {
                            _ = tokio::time::sleep(ETCD_RECONNECT_DELAY) => continue,
                            _ = shutdown.notified() => return,
                            _ = closed.notify.notified() => return,
                        }
                    }
                };

                loop {
                    let resp = tokio::select! {
                        resp = stream.next_response() => resp,
                        _ = shutdown.notified() => return,
                        _ = closed.notify.notified() => return,
                    };

                    let Some(resp) = resp else {
                        warn!("config: etcd watch stream ended, reconnecting");
                        need_initial = true;
                        break;
                    };

                    let Some(result) = resp.result else {
                        continue;
                    };

                    if let Some(header) = &result.header {
                        if let Some(rev) = header.revision {
                            revision = Some(rev);
                        }
                    }

                    for event in &result.events {
                        let event_type = event.event_type.as_deref().unwrap_or("PUT");
                        if event_type != "PUT" {
                            continue;
                        }
                        let Some(kv) = &event.kv else { continue };
                        match crate::etcd::client::b64_decode(&kv.value) {
                            Ok(value) => {
                                debug!("config: etcd key updated, {} bytes", value.len());
                                if tx.send(Bytes::from(value)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!("config: etcd value decode failed: {}", e);
                            }
                        }
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(ETCD_RECONNECT_DELAY) => {}
                    _ = shutdown.notified() => return,
                    _ = closed.notify.notified() => return,
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("stargate-source-{}.yaml", uuid::Uuid::new_v4()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_file_source_missing_path_fails() {
        let cfg = FileSourceConfig {
            path: "/nonexistent/stargate.yaml".into(),
            poll_interval_ms: 100,
        };
        assert!(ConfigSource::file(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_file_source_get() {
        let path = temp_file("routes: []\n");
        let cfg = FileSourceConfig {
            path: path.display().to_string(),
            poll_interval_ms: 50,
        };
        let source = ConfigSource::file(&cfg).unwrap();
        let bytes = source.get().await.unwrap();
        assert_eq!(&bytes[..], b"routes: []\n");
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_file_watch_emits_initial_then_change() {
        let path = temp_file("a: 1\n");
        let cfg = FileSourceConfig {
            path: path.display().to_string(),
            poll_interval_ms: 20,
        };
        let source = ConfigSource::file(&cfg).unwrap();
        let shutdown = Arc::new(Notify::new());
        let mut rx = source.watch(shutdown.clone());

        let initial = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&initial[..], b"a: 1\n");

        // Rewriting the file bumps the mtime; the poller must pick it up
        // within a couple of intervals.
        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::write(&path, "a: 2\n").unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&changed[..], b"a: 2\n");

        shutdown.notify_waiters();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_file_watch_terminates_on_shutdown() {
        let path = temp_file("a: 1\n");
        let cfg = FileSourceConfig {
            path: path.display().to_string(),
            poll_interval_ms: 20,
        };
        let source = ConfigSource::file(&cfg).unwrap();
        let shutdown = Arc::new(Notify::new());
        let mut rx = source.watch(shutdown.clone());

        rx.recv().await.unwrap();
        shutdown.notify_waiters();

        let ended = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(ended, Ok(None)));
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_watch_is_restartable() {
        let path = temp_file("a: 1\n");
        let cfg = FileSourceConfig {
            path: path.display().to_string(),
            poll_interval_ms: 20,
        };
        let source = ConfigSource::file(&cfg).unwrap();

        let shutdown = Arc::new(Notify::new());
        let mut rx1 = source.watch(shutdown.clone());
        assert!(rx1.recv().await.is_some());
        shutdown.notify_waiters();

        // A fresh watch gets a fresh initial value.
        let shutdown2 = Arc::new(Notify::new());
        let mut rx2 = source.watch(shutdown2.clone());
        let initial = tokio::time::timeout(Duration::from_secs(1), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&initial[..], b"a: 1\n");
        shutdown2.notify_waiters();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let path = temp_file("a: 1\n");
        let cfg = FileSourceConfig {
            path: path.display().to_string(),
            poll_interval_ms: 20,
        };
        let source = ConfigSource::file(&cfg).unwrap();
        assert!(!source.is_closed());
        source.close();
        assert!(source.is_closed());
        source.close();
        assert!(source.is_closed());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_closed_source_watch_ends() {
        let path = temp_file("a: 1\n");
        let cfg = FileSourceConfig {
            path: path.display().to_string(),
            poll_interval_ms: 20,
        };
        let source = ConfigSource::file(&cfg).unwrap();
        source.close();

        let shutdown = Arc::new(Notify::new());
        let mut rx = source.watch(shutdown);
        // The initial value may or may not arrive before the close flag is
        // observed; either way the stream must end promptly.
        let deadline = tokio::time::timeout(Duration::from_secs(1), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(deadline.is_ok());
        std::fs::remove_file(&path).ok();
    }
}
