//! Single-flight LRU attribute cache (spec §4.G). Concurrent `get(id)`
//! calls for the same id coalesce onto one upstream fetch; only a
//! successful fetch populates the LRU. `set(id, partial)` merges over
//! whatever is already cached.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use common::error::AppError;
use data_cache::{AttributeSource, DataAttributes};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// `DataAttributes`, or a string-rendered upstream failure so it can be
/// broadcast to every waiter (`AppError` itself isn't `Clone`).
type Outcome = Result<Option<DataAttributes>, String>;

/// What the cache fetches from on a miss.
#[async_trait]
pub trait AttributeUpstream: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<DataAttributes, AppError>;
}

/// New fields in `patch` override; fields absent in `patch` keep the
/// existing value. `verified` is sticky: once true it stays true.
fn merge(existing: &DataAttributes, patch: &DataAttributes) -> DataAttributes {
    DataAttributes {
        hash: patch.hash.or(existing.hash),
        data_size: patch.data_size.or(existing.data_size),
        content_type: patch.content_type.clone().or_else(|| existing.content_type.clone()),
        verified: patch.verified || existing.verified,
    }
}

pub struct AttributeCache {
    lru: Mutex<LruCache<String, DataAttributes>>,
    pending: Mutex<HashMap<String, broadcast::Sender<Outcome>>>,
    upstream: Arc<dyn AttributeUpstream>,
}

impl AttributeCache {
    pub fn new(capacity: usize, upstream: Arc<dyn AttributeUpstream>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            lru: Mutex::new(LruCache::new(capacity)),
            pending: Mutex::new(HashMap::new()),
            upstream,
        }
    }

    async fn await_broadcast(mut rx: broadcast::Receiver<Outcome>) -> Result<Option<DataAttributes>, AppError> {
        match rx.recv().await {
            Ok(Ok(attrs)) => Ok(attrs),
            Ok(Err(msg)) => Err(AppError::Internal(msg)),
            Err(_) => Err(AppError::Internal(
                "attribute fetch coalescing channel closed without a result".to_string(),
            )),
        }
    }

    async fn lead_fetch(&self, id: &str, tx: broadcast::Sender<Outcome>) -> Result<Option<DataAttributes>, AppError> {
        let result = self.upstream.fetch(id).await;
        self.pending.lock().remove(id);

        match result {
            Ok(attrs) => {
                self.lru.lock().put(id.to_string(), attrs.clone());
                let _ = tx.send(Ok(Some(attrs.clone())));
                Ok(Some(attrs))
            }
            Err(e) if e.is_not_found() => {
                debug!(id, "attribute upstream reports absent");
                let _ = tx.send(Ok(None));
                Ok(None)
            }
            Err(e) => {
                let _ = tx.send(Err(e.to_string()));
                Err(e)
            }
        }
    }
}

#[async_trait]
impl AttributeSource for AttributeCache {
    async fn get(&self, id: &str) -> Result<Option<DataAttributes>, AppError> {
        if let Some(cached) = self.lru.lock().get(id).cloned() {
            return Ok(Some(cached));
        }

        enum Slot {
            Leader(broadcast::Sender<Outcome>),
            Follower(broadcast::Receiver<Outcome>),
        }

        let slot = {
            let mut pending = self.pending.lock();
            if let Some(tx) = pending.get(id) {
                Slot::Follower(tx.subscribe())
            } else {
                let (tx, _rx) = broadcast::channel(1);
                pending.insert(id.to_string(), tx.clone());
                Slot::Leader(tx)
            }
        };

        match slot {
            Slot::Follower(rx) => {
                debug!(id, "coalescing onto an in-flight attribute fetch");
                Self::await_broadcast(rx).await
            }
            Slot::Leader(tx) => self.lead_fetch(id, tx).await,
        }
    }

    async fn set(&self, id: &str, partial: DataAttributes) -> Result<(), AppError> {
        let mut lru = self.lru.lock();
        let merged = match lru.get(id) {
            Some(existing) => merge(existing, &partial),
            None => partial,
        };
        lru.put(id.to_string(), merged);
        Ok(())
    }
}
