//! Ordered N-way fallback source (spec §4.E): the shared pattern behind the
//! transaction-boundary, transaction-offset, ArNS, and attribute lookups.
//! A cancellation must always propagate; any other sub-source failure is
//! treated as "empty, try the next one".

use std::sync::Arc;

use async_trait::async_trait;
use common::error::AppError;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A single fallback tier. `Ok(None)` means "this source had nothing, try
/// the next"; `Err(AppError::Cancelled)` must propagate unchanged; any other
/// `Err` is logged and treated the same as `Ok(None)` (spec §4.E step 4).
#[async_trait]
pub trait FallbackSubSource<T: Send>: Send + Sync {
    async fn try_fetch(&self, cancel: &CancellationToken) -> Result<Option<T>, AppError>;

    /// A name used only for logging.
    fn name(&self) -> &str {
        "sub-source"
    }
}

struct Tier<T> {
    source: Arc<dyn FallbackSubSource<T>>,
    concurrency: Option<Arc<Semaphore>>,
}

/// An ordered chain of sub-sources, each with an optional concurrency cap,
/// queried in order until one returns a valid result.
pub struct CompositeSource<T> {
    tiers: Vec<Tier<T>>,
    validity: Option<Box<dyn Fn(&T) -> bool + Send + Sync>>,
}

impl<T: Send + 'static> CompositeSource<T> {
    pub fn new() -> Self {
        Self {
            tiers: Vec::new(),
            validity: None,
        }
    }

    pub fn with_validity(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.validity = Some(Box::new(predicate));
        self
    }

    pub fn add_source(
        mut self,
        source: Arc<dyn FallbackSubSource<T>>,
        concurrency_cap: Option<usize>,
    ) -> Self {
        self.tiers.push(Tier {
            source,
            concurrency: concurrency_cap.map(|cap| Arc::new(Semaphore::new(cap))),
        });
        self
    }

    fn is_valid(&self, value: &T) -> bool {
        self.validity.as_ref().is_none_or(|f| f(value))
    }

    /// Query tiers in order; return the first valid result. A saturated
    /// concurrency cap skips that tier rather than waiting (spec §4.E step 5).
    pub async fn resolve(&self, cancel: &CancellationToken) -> Result<Option<T>, AppError> {
        for tier in &self.tiers {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let _permit = match &tier.concurrency {
                Some(sem) => match sem.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        debug!(source = tier.source.name(), "concurrency cap saturated, skipping tier");
                        continue;
                    }
                },
                None => None,
            };

            match tier.source.try_fetch(cancel).await {
                Ok(Some(value)) => {
                    if self.is_valid(&value) {
                        return Ok(Some(value));
                    }
                    debug!(source = tier.source.name(), "result failed validity predicate, continuing");
                }
                Ok(None) => {
                    debug!(source = tier.source.name(), "no result, continuing");
                }
                Err(e) if matches!(e, AppError::Cancelled) => return Err(e),
                Err(e) => {
                    debug!(source = tier.source.name(), error = %e, "sub-source failed, continuing");
                }
            }
        }
        Ok(None)
    }
}

impl<T: Send + 'static> Default for CompositeSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The ArNS variant (spec §4.E "Special case"): every resolver is started
/// under a shared concurrency cap; the winner is the first valid result in
/// resolver order among those that complete. Every resolver is invoked (or
/// deliberately skipped by the cap) before a "not found" is returned.
pub struct ParallelCompositeSource<T> {
    sources: Vec<Arc<dyn FallbackSubSource<T>>>,
    concurrency: Arc<Semaphore>,
    validity: Option<Box<dyn Fn(&T) -> bool + Send + Sync>>,
}

impl<T: Send + Sync + 'static> ParallelCompositeSource<T> {
    pub fn new(sources: Vec<Arc<dyn FallbackSubSource<T>>>, concurrency_cap: usize) -> Self {
        Self {
            sources,
            concurrency: Arc::new(Semaphore::new(concurrency_cap.max(1))),
            validity: None,
        }
    }

    pub fn with_validity(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.validity = Some(Box::new(predicate));
        self
    }

    pub async fn resolve(&self, cancel: &CancellationToken) -> Result<Option<T>, AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let futures = self.sources.iter().map(|source| {
            let source = Arc::clone(source);
            let sem = Arc::clone(&self.concurrency);
            let cancel = cancel.clone();
            async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Err(AppError::Internal("semaphore closed".to_string())),
                };
                source.try_fetch(&cancel).await
            }
        });

        let results = futures::future::join_all(futures).await;

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        for result in results {
            match result {
                Ok(Some(value)) => {
                    if self.validity.as_ref().is_none_or(|f| f(&value)) {
                        return Ok(Some(value));
                    }
                }
                Ok(None) => {}
                Err(e) if matches!(e, AppError::Cancelled) => return Err(e),
                Err(e) => debug!(error = %e, "arns resolver failed, continuing"),
            }
        }
        Ok(None)
    }
}
