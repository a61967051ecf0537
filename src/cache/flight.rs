//! In-flight work coalescing keyed by [`CacheKey`].
//!
//! The first caller for a key starts the work on its own task; callers that
//! arrive while it is still running await the same shared result instead of
//! repeating it. The entry is cleared once the work settles, so the next miss
//! after that starts fresh.

use std::future::Future;
use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use thiserror::Error;

use super::keys::CacheKey;

pub(crate) const METRIC_INFLIGHT_COALESCED: &str = "imagecache_inflight_coalesced_total";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("in-flight task for `{key}` ended without a result")]
pub struct FlightAborted {
    pub key: String,
}

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, FlightAborted>>>;

pub struct InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pending: Arc<DashMap<CacheKey, SharedResult<T>>>,
}

impl<T> Clone for InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T> Default for InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Run `work` for `key`, or join the run already in progress.
    ///
    /// `work` executes on a spawned task and completes even if every waiting
    /// caller goes away.
    pub async fn run<F>(&self, key: CacheKey, work: F) -> Result<T, FlightAborted>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let shared = match self.pending.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                counter!(METRIC_INFLIGHT_COALESCED).increment(1);
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => {
                let guard = FlightGuard {
                    key: key.clone(),
                    pending: Arc::clone(&self.pending),
                };
                let handle = tokio::spawn(async move {
                    let _guard = guard;
                    work.await
                });
                let label = key.to_string();
                let shared = async move { handle.await.map_err(|_| FlightAborted { key: label }) }
                    .boxed()
                    .shared();
                vacant.insert(shared.clone());
                shared
            }
        };

        shared.await
    }

    /// Whether no work is currently running.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Clears the pending entry when the spawned work finishes or unwinds.
struct FlightGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    key: CacheKey,
    pending: Arc<DashMap<CacheKey, SharedResult<T>>>,
}

impl<T> Drop for FlightGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}
