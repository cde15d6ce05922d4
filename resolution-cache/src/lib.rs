//! Resolution cache for ArNS-style name records (spec §4.K). Wraps a slow
//! paginated upstream behind a local key-value store with two debounce
//! intervals: `cacheHitDebounceTtl` bounds how often a present entry
//! triggers a background refresh, `cacheMissDebounceTtl` bounds how often
//! an absent name retries the upstream. At most one refresh is in flight
//! at a time; refreshes never block the caller that triggers them, except
//! when no refresh has ever completed and one is already running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::error::AppError;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A resolved name record (spec.md: `{name, processId?, ...record fields,
/// resolvedAt, ttl}`). Upstream-specific fields beyond the ones named in
/// the record sketch are not modeled; callers that need more should widen
/// this struct rather than bolt on a side channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    pub name: String,
    pub process_id: Option<String>,
    pub tx_id: Option<String>,
    pub ttl_seconds: u64,
}

/// One page of a paginated upstream listing.
#[derive(Debug, Clone)]
pub struct ResolutionPage {
    pub records: Vec<ResolvedName>,
    pub next_cursor: Option<String>,
}

/// What the cache refreshes from on a miss or debounce expiry.
#[async_trait]
pub trait ResolutionUpstream: Send + Sync {
    async fn fetch_page(&self, cursor: Option<String>) -> Result<ResolutionPage, AppError>;
}

/// Outcome of one refresh cycle, broadcast to whoever is waiting on it.
/// `Err` carries a string rather than `AppError` since the latter isn't
/// `Clone`.
type RefreshOutcome = Result<(), String>;

struct Inner {
    kv: HashMap<String, ResolvedName>,
    last_hydrate: Option<Instant>,
    ever_hydrated: bool,
    refreshing: Option<broadcast::Sender<RefreshOutcome>>,
}

pub struct ResolutionCache {
    inner: Arc<Mutex<Inner>>,
    upstream: Arc<dyn ResolutionUpstream>,
    hit_debounce: Duration,
    miss_debounce: Duration,
    epoch: watch::Sender<u64>,
}

impl ResolutionCache {
    pub fn new(upstream: Arc<dyn ResolutionUpstream>, hit_debounce: Duration, miss_debounce: Duration) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                kv: HashMap::new(),
                last_hydrate: None,
                ever_hydrated: false,
                refreshing: None,
            })),
            upstream,
            hit_debounce,
            miss_debounce,
            epoch,
        }
    }

    /// Observes refresh completions without polling; used by tests that
    /// need to wait for a scheduled background refresh to land.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    /// spec §4.K `get(name)`: five branches depending on presence and
    /// debounce state. Branches (b) and (c) schedule a refresh without
    /// awaiting it; branch (e) awaits an in-flight refresh when no
    /// hydration has ever completed, since there's nothing else to serve.
    pub async fn get(&self, name: &str, cancel: &CancellationToken) -> Result<Option<ResolvedName>, AppError> {
        enum Action {
            Present(ResolvedName),
            Absent,
            PresentAndRefresh(ResolvedName, broadcast::Sender<RefreshOutcome>),
            AbsentAndRefresh(broadcast::Sender<RefreshOutcome>),
            AwaitThenRead(broadcast::Receiver<RefreshOutcome>),
        }

        let now = Instant::now();
        let action = {
            let mut inner = self.inner.lock();

            if let Some(tx) = inner.refreshing.clone() {
                if inner.ever_hydrated {
                    match inner.kv.get(name).cloned() {
                        Some(entry) => Action::Present(entry),
                        None => Action::Absent,
                    }
                } else {
                    Action::AwaitThenRead(tx.subscribe())
                }
            } else {
                let elapsed = inner.last_hydrate.map(|t| now.duration_since(t));
                match inner.kv.get(name).cloned() {
                    Some(entry) => {
                        if elapsed.map(|e| e < self.hit_debounce).unwrap_or(false) {
                            Action::Present(entry)
                        } else {
                            let (tx, _rx) = broadcast::channel(1);
                            inner.refreshing = Some(tx.clone());
                            Action::PresentAndRefresh(entry, tx)
                        }
                    }
                    None => {
                        if elapsed.map(|e| e >= self.miss_debounce).unwrap_or(true) {
                            let (tx, _rx) = broadcast::channel(1);
                            inner.refreshing = Some(tx.clone());
                            Action::AbsentAndRefresh(tx)
                        } else {
                            Action::Absent
                        }
                    }
                }
            }
        };

        match action {
            Action::Present(entry) => Ok(Some(entry)),
            Action::Absent => Ok(None),
            Action::PresentAndRefresh(entry, tx) => {
                self.spawn_refresh(tx);
                Ok(Some(entry))
            }
            Action::AbsentAndRefresh(tx) => {
                self.spawn_refresh(tx);
                Ok(None)
            }
            Action::AwaitThenRead(mut rx) => {
                tokio::select! {
                    _ = rx.recv() => {}
                    () = cancel.cancelled() => return Err(AppError::Cancelled),
                }
                Ok(self.inner.lock().kv.get(name).cloned())
            }
        }
    }

    /// Schedules a refresh regardless of debounce state. Still
    /// single-flighted: a no-op if one is already running.
    pub fn force_refresh(&self) {
        let tx = {
            let mut inner = self.inner.lock();
            if inner.refreshing.is_some() {
                return;
            }
            let (tx, _rx) = broadcast::channel(1);
            inner.refreshing = Some(tx.clone());
            tx
        };
        self.spawn_refresh(tx);
    }

    fn spawn_refresh(&self, tx: broadcast::Sender<RefreshOutcome>) {
        let inner = Arc::clone(&self.inner);
        let upstream = Arc::clone(&self.upstream);
        let epoch = self.epoch.clone();
        tokio::spawn(async move {
            run_refresh(inner, upstream, tx, epoch).await;
        });
    }
}

async fn run_refresh(
    inner: Arc<Mutex<Inner>>,
    upstream: Arc<dyn ResolutionUpstream>,
    tx: broadcast::Sender<RefreshOutcome>,
    epoch: watch::Sender<u64>,
) {
    let mut cursor = None;
    let mut outcome: RefreshOutcome = Ok(());

    loop {
        match fetch_page_with_retry(&upstream, cursor.clone()).await {
            Ok(page) => {
                let next_cursor = page.next_cursor.clone();
                {
                    let mut guard = inner.lock();
                    for record in page.records {
                        guard.kv.insert(record.name.clone(), record);
                    }
                }
                if next_cursor.is_none() {
                    break;
                }
                cursor = next_cursor;
            }
            Err(e) => {
                warn!(error = %e, "resolution cache refresh abandoned a page after repeated failures");
                outcome = Err(e.to_string());
                break;
            }
        }
    }

    {
        let mut guard = inner.lock();
        guard.last_hydrate = Some(Instant::now());
        guard.ever_hydrated = true;
        guard.refreshing = None;
    }

    epoch.send_modify(|v| *v = v.saturating_add(1));
    let _ = tx.send(outcome);
}

/// Up to 3 attempts per page with exponential-ish backoff; a page that
/// never succeeds abandons the whole refresh and leaves the KV untouched
/// for the records it would have carried.
async fn fetch_page_with_retry(upstream: &Arc<dyn ResolutionUpstream>, cursor: Option<String>) -> Result<ResolutionPage, AppError> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match upstream.fetch_page(cursor.clone()).await {
            Ok(page) => return Ok(page),
            Err(_) if attempt < 3 => {
                let backoff = Duration::from_millis(50u64.saturating_mul(1u64 << (attempt - 1)));
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
