//! Event watcher: schedules source adapters at per-source cadences,
//! deduplicates events via a persistent seen-set, and hands new
//! events to the orchestrator.
//!
//! Deduplication windows are expiry-on-read: 12 hours for persistent
//! events (the condition may reappear after a failed fix), 24 hours
//! for self-resolving ones. The cache is flushed after every
//! mutation, with writes coalesced inside a 500ms window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::domain::models::{EventDetails, EventSource, SecurityEvent, Severity};
use crate::domain::models::config::Config;
use crate::domain::ports::SourceAdapter;
use crate::infrastructure::state::StateStore;

/// Suppression window for persistent events.
const PERSISTENT_WINDOW_SECS: u64 = 12 * 3600;
/// Suppression window for self-resolving events.
const SELF_RESOLVING_WINDOW_SECS: u64 = 24 * 3600;
/// Write-coalescing window for cache flushes.
const FLUSH_COALESCE_MS: u64 = 500;
/// Consecutive poll failures before a meta-event is emitted.
const ADAPTER_FAILURE_THRESHOLD: u32 = 3;

const SEEN_EVENTS_FILE: &str = "seen_events.json";

/// Persistent signature -> last-seen epoch-seconds cache.
pub struct SeenEventCache {
    entries: Mutex<HashMap<String, u64>>,
    store: StateStore,
    flush_signal: Arc<Notify>,
}

impl SeenEventCache {
    /// Load the cache from disk. Returns the cache and whether the
    /// previous file was corrupt (and quarantined).
    pub fn load(store: StateStore) -> (Arc<Self>, bool) {
        let loaded = store.load::<HashMap<String, u64>>(SEEN_EVENTS_FILE);
        let cache = Arc::new(Self {
            entries: Mutex::new(loaded.value),
            store,
            flush_signal: Arc::new(Notify::new()),
        });
        cache.clone().spawn_flusher();
        (cache, loaded.quarantined)
    }

    /// Atomic read-modify-write: expire the entry if stale, report
    /// whether the signature is new, and record it.
    pub async fn is_new(&self, signature: &str, is_persistent: bool, now_epoch: u64) -> bool {
        let window = if is_persistent {
            PERSISTENT_WINDOW_SECS
        } else {
            SELF_RESOLVING_WINDOW_SECS
        };

        let mut entries = self.entries.lock().await;
        let fresh = match entries.get(signature) {
            Some(last_seen) if now_epoch.saturating_sub(*last_seen) < window => false,
            _ => true,
        };
        if fresh {
            entries.insert(signature.to_string(), now_epoch);
            drop(entries);
            self.flush_signal.notify_one();
        }
        fresh
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Background flusher: waits for a mutation, then sleeps the
    /// coalescing window so bursts produce one write.
    fn spawn_flusher(self: Arc<Self>) {
        let signal = self.flush_signal.clone();
        tokio::spawn(async move {
            loop {
                signal.notified().await;
                sleep(Duration::from_millis(FLUSH_COALESCE_MS)).await;
                self.flush().await;
            }
        });
    }

    /// Write the cache to disk immediately.
    pub async fn flush(&self) {
        let snapshot = self.entries.lock().await.clone();
        if let Err(e) = self.store.save(SEEN_EVENTS_FILE, &snapshot) {
            warn!(error = %e, "seen-event cache flush failed");
        }
    }
}

/// Per-source polling statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SourceStats {
    pub scans: u64,
    pub events: u64,
    pub consecutive_failures: u32,
    pub last_scan_epoch: Option<u64>,
}

pub struct EventWatcher {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    cache: Arc<SeenEventCache>,
    submit: mpsc::Sender<SecurityEvent>,
    poll_timeout: Duration,
    intervals: HashMap<EventSource, u64>,
    stats: Arc<Mutex<HashMap<EventSource, SourceStats>>>,
    shutdown: watch::Sender<bool>,
}

impl EventWatcher {
    pub fn new(
        config: &Config,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        cache: Arc<SeenEventCache>,
        submit: mpsc::Sender<SecurityEvent>,
    ) -> Self {
        let mut intervals = HashMap::new();
        for adapter in &adapters {
            let source = adapter.source();
            intervals.insert(source, config.scan_interval(source.as_str()));
        }
        let (shutdown, _) = watch::channel(false);
        Self {
            adapters,
            cache,
            submit,
            poll_timeout: Duration::from_secs(config.sources.poll_timeout_seconds),
            intervals,
            stats: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        }
    }

    /// Spawn one polling loop per adapter.
    pub fn start(&self) {
        for adapter in &self.adapters {
            let source = adapter.source();
            let interval = Duration::from_secs(*self.intervals.get(&source).unwrap_or(&30));
            info!(source = %source, interval_secs = interval.as_secs(), "starting watcher loop");

            let adapter = adapter.clone();
            let cache = self.cache.clone();
            let submit = self.submit.clone();
            let stats = self.stats.clone();
            let poll_timeout = self.poll_timeout;
            let mut shutdown = self.shutdown.subscribe();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                info!(source = %source, "watcher loop stopped");
                                return;
                            }
                        }
                        () = sleep(interval) => {
                            Self::poll_once(&*adapter, &cache, &submit, &stats, poll_timeout).await;
                        }
                    }
                }
            });
        }
    }

    /// Signal all loops to halt.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Poll every adapter once, regardless of cadence. Returns new
    /// events submitted per source.
    pub async fn force_scan_all(&self) -> HashMap<EventSource, u64> {
        let mut counts = HashMap::new();
        for adapter in &self.adapters {
            let submitted = Self::poll_once(
                &**adapter,
                &self.cache,
                &self.submit,
                &self.stats,
                self.poll_timeout,
            )
            .await;
            counts.insert(adapter.source(), submitted);
        }
        counts
    }

    pub async fn statistics(&self) -> HashMap<EventSource, SourceStats> {
        self.stats.lock().await.clone()
    }

    /// One poll cycle for one adapter: poll under timeout, dedupe,
    /// submit. An adapter error never stops sibling adapters; three
    /// consecutive failures emit a HIGH meta-event.
    async fn poll_once(
        adapter: &dyn SourceAdapter,
        cache: &SeenEventCache,
        submit: &mpsc::Sender<SecurityEvent>,
        stats: &Mutex<HashMap<EventSource, SourceStats>>,
        poll_timeout: Duration,
    ) -> u64 {
        let source = adapter.source();
        let now_epoch = chrono::Utc::now().timestamp().max(0) as u64;

        {
            let mut stats = stats.lock().await;
            let entry = stats.entry(source).or_default();
            entry.scans += 1;
            entry.last_scan_epoch = Some(now_epoch);
        }

        let polled = match tokio::time::timeout(poll_timeout, adapter.poll()).await {
            Ok(Ok(events)) => Ok(events),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("poll timed out after {}s", poll_timeout.as_secs())),
        };

        match polled {
            Ok(events) => {
                {
                    let mut stats = stats.lock().await;
                    stats.entry(source).or_default().consecutive_failures = 0;
                }

                let mut submitted = 0;
                for event in events {
                    let signature = event.signature();
                    if cache.is_new(&signature, event.is_persistent(), now_epoch).await {
                        info!(
                            source = %source,
                            severity = %event.severity,
                            %signature,
                            "new security event"
                        );
                        if submit.send(event).await.is_err() {
                            warn!(source = %source, "orchestrator channel closed");
                            return submitted;
                        }
                        submitted += 1;
                    }
                }
                if submitted > 0 {
                    let mut stats = stats.lock().await;
                    stats.entry(source).or_default().events += submitted;
                }
                submitted
            }
            Err(reason) => {
                error!(source = %source, %reason, "adapter poll failed");
                let failures = {
                    let mut stats = stats.lock().await;
                    let entry = stats.entry(source).or_default();
                    entry.consecutive_failures += 1;
                    entry.consecutive_failures
                };

                if failures == ADAPTER_FAILURE_THRESHOLD {
                    let meta = SecurityEvent::new(
                        source,
                        Severity::High,
                        EventDetails::AdapterFailure {
                            adapter: source.as_str().to_string(),
                            consecutive_failures: failures,
                            last_error: reason,
                        },
                    );
                    let signature = meta.signature();
                    if cache.is_new(&signature, meta.is_persistent(), now_epoch).await {
                        let _ = submit.send(meta).await;
                    }
                }
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::WatcherError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> Arc<SeenEventCache> {
        let store = StateStore::new(dir.path()).unwrap();
        SeenEventCache::load(store).0
    }

    #[tokio::test]
    async fn test_is_new_idempotence_within_window() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);

        let now = 1_700_000_000;
        assert!(cache.is_new("scan:CVE-1:openssl:1.0", true, now).await);
        assert!(!cache.is_new("scan:CVE-1:openssl:1.0", true, now + 1).await);
        assert!(!cache.is_new("scan:CVE-1:openssl:1.0", true, now + 2).await);
    }

    #[tokio::test]
    async fn test_persistent_window_expires_after_12h() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);

        let now = 1_700_000_000;
        assert!(cache.is_new("file:/etc/shadow:modified", true, now).await);
        // Just inside the window.
        assert!(
            !cache
                .is_new("file:/etc/shadow:modified", true, now + 12 * 3600 - 1)
                .await
        );
        // At the boundary the entry expired.
        assert!(
            cache
                .is_new("file:/etc/shadow:modified", true, now + 12 * 3600)
                .await
        );
    }

    #[tokio::test]
    async fn test_self_resolving_window_is_24h() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);

        let now = 1_700_000_000;
        assert!(cache.is_new("host:1.2.3.4:sshd", false, now).await);
        assert!(!cache.is_new("host:1.2.3.4:sshd", false, now + 23 * 3600).await);
        assert!(cache.is_new("host:1.2.3.4:sshd", false, now + 24 * 3600).await);
    }

    #[tokio::test]
    async fn test_cache_survives_reload() {
        let dir = TempDir::new().unwrap();
        let now = 1_700_000_000;
        {
            let cache = cache(&dir);
            assert!(cache.is_new("net:9.9.9.9:scan", false, now).await);
            cache.flush().await;
        }
        // Fresh load from the same directory: still suppressed.
        let cache = cache(&dir);
        assert!(!cache.is_new("net:9.9.9.9:scan", false, now + 10).await);
    }

    struct ScriptedAdapter {
        source: EventSource,
        polls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn source(&self) -> EventSource {
            self.source
        }

        async fn poll(&self) -> Result<Vec<SecurityEvent>, WatcherError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(WatcherError::PollFailed {
                    source_name: self.source.to_string(),
                    reason: "tool unavailable".into(),
                });
            }
            Ok(vec![SecurityEvent::new(
                self.source,
                Severity::Medium,
                EventDetails::HostBan {
                    ip: "198.51.100.9".into(),
                    jail: "sshd".into(),
                },
            )])
        }
    }

    #[tokio::test]
    async fn test_duplicate_events_submitted_once() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let (tx, mut rx) = mpsc::channel(16);
        let stats = Mutex::new(HashMap::new());

        let adapter = ScriptedAdapter {
            source: EventSource::HostIps,
            polls: AtomicU32::new(0),
            fail: false,
        };

        let first = EventWatcher::poll_once(&adapter, &cache, &tx, &stats, Duration::from_secs(5)).await;
        let second = EventWatcher::poll_once(&adapter, &cache, &tx, &stats, Duration::from_secs(5)).await;
        assert_eq!(first, 1);
        assert_eq!(second, 0);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.signature(), "host:198.51.100.9:sshd");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_three_failures_emit_meta_event() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let (tx, mut rx) = mpsc::channel(16);
        let stats = Mutex::new(HashMap::new());

        let adapter = ScriptedAdapter {
            source: EventSource::NetworkIps,
            polls: AtomicU32::new(0),
            fail: true,
        };

        for _ in 0..2 {
            EventWatcher::poll_once(&adapter, &cache, &tx, &stats, Duration::from_secs(5)).await;
            assert!(rx.try_recv().is_err());
        }
        EventWatcher::poll_once(&adapter, &cache, &tx, &stats, Duration::from_secs(5)).await;

        let meta = rx.try_recv().unwrap();
        assert_eq!(meta.severity, Severity::High);
        assert_eq!(meta.signature(), "meta:network_ips:adapter_failure");
        match meta.details {
            EventDetails::AdapterFailure {
                consecutive_failures,
                ..
            } => assert_eq!(consecutive_failures, 3),
            other => panic!("unexpected details: {other:?}"),
        }
    }
}
