use crate::cache::{CacheStore, Invalidation, Lookup};
use crate::config::QueryPolicy;
use crate::error::{QueryError, RemoteError};
use crate::keys::QueryKey;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

pub type FetchFuture = BoxFuture<'static, Result<Value, RemoteError>>;
pub type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

// Wraps an async closure into a shareable fetcher.
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Fresh,
    // Served from cache while a background refetch runs.
    Stale,
    Fetched,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRead {
    pub value: Value,
    pub source: ReadSource,
}

impl QueryRead {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueryError> {
        serde_json::from_value(self.value.clone()).map_err(|e| QueryError::Decode(e.to_string()))
    }

    pub fn is_stale(&self) -> bool {
        self.source == ReadSource::Stale
    }

    pub fn load<T: DeserializeOwned>(&self) -> Result<Loaded<T>, QueryError> {
        Ok(Loaded {
            data: self.decode()?,
            stale: self.is_stale(),
        })
    }
}

// A decoded read, flagged when served from a stale entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<T> {
    pub data: T,
    pub stale: bool,
}

struct Observed {
    readers: usize,
    policy: QueryPolicy,
    fetcher: Fetcher,
}

#[derive(Default)]
struct ManagerInner {
    inflight: Mutex<HashSet<QueryKey>>,
    observers: Mutex<HashMap<QueryKey, Observed>>,
    background_refetches: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// Removes the key from the in-flight set when the refetch ends, however it ends.
struct InflightGuard {
    inner: Arc<ManagerInner>,
    key: QueryKey,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        lock(&self.inner.inflight).remove(&self.key);
    }
}

/// Typed reads over the cache store with stale-while-revalidate and retries.
#[derive(Clone)]
pub struct QueryCacheManager {
    store: CacheStore,
    policy: QueryPolicy,
    inner: Arc<ManagerInner>,
}

impl QueryCacheManager {
    pub fn new(store: CacheStore, policy: QueryPolicy) -> Self {
        Self {
            store,
            policy,
            inner: Arc::new(ManagerInner::default()),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn policy(&self) -> &QueryPolicy {
        &self.policy
    }

    pub async fn query(&self, key: QueryKey, fetch: Fetcher) -> Result<QueryRead, QueryError> {
        let policy = self.policy;
        self.query_with(key, &policy, fetch).await
    }

    /// Fresh hit: served with no fetch. Stale hit: served now, refreshed in the
    /// background. Miss or expired: fetched with retries. A failed fetch leaves
    /// whatever is cached untouched.
    pub async fn query_with(
        &self,
        key: QueryKey,
        policy: &QueryPolicy,
        fetch: Fetcher,
    ) -> Result<QueryRead, QueryError> {
        match self.store.lookup(&key) {
            Lookup::Fresh(value) => Ok(QueryRead {
                value,
                source: ReadSource::Fresh,
            }),
            Lookup::Stale(value) => {
                self.spawn_refetch(key, *policy, fetch);
                Ok(QueryRead {
                    value,
                    source: ReadSource::Stale,
                })
            }
            Lookup::Miss => self.fetch_now(key, policy, fetch).await,
        }
    }

    async fn fetch_now(
        &self,
        key: QueryKey,
        policy: &QueryPolicy,
        fetch: Fetcher,
    ) -> Result<QueryRead, QueryError> {
        match policy.retry.run(|| fetch()).await {
            Ok(value) => {
                self.store
                    .put_fetched(key, value.clone(), policy.freshness());
                Ok(QueryRead {
                    value,
                    source: ReadSource::Fetched,
                })
            }
            Err((source, attempts)) => {
                warn!(%key, attempts, error = %source, "query failed");
                Err(QueryError::Failed { attempts, source })
            }
        }
    }

    // At most one background refetch per key runs at a time.
    fn spawn_refetch(&self, key: QueryKey, policy: QueryPolicy, fetch: Fetcher) -> bool {
        if !lock(&self.inner.inflight).insert(key.clone()) {
            return false;
        }
        self.inner.background_refetches.fetch_add(1, Ordering::Relaxed);

        let store = self.store.clone();
        let guard = InflightGuard {
            inner: self.inner.clone(),
            key: key.clone(),
        };
        tokio::spawn(async move {
            let _guard = guard;
            match policy.retry.run(|| fetch()).await {
                Ok(value) => {
                    if store.put_fetched(key.clone(), value, policy.freshness()) {
                        debug!(%key, "background refetch stored");
                    }
                }
                Err((e, attempts)) => {
                    warn!(%key, attempts, error = %e, "background refetch failed, keeping cached value");
                }
            }
        });
        true
    }

    pub fn background_refetches(&self) -> u64 {
        self.inner.background_refetches.load(Ordering::Relaxed)
    }

    /// Registers an active reader of `key`. Invalidations under it trigger a refetch
    /// while at least one observer is alive.
    pub fn observe(&self, key: QueryKey, fetch: Fetcher) -> QueryObserver {
        let mut observers = lock(&self.inner.observers);
        observers
            .entry(key.clone())
            .and_modify(|o| o.readers += 1)
            .or_insert_with(|| Observed {
                readers: 1,
                policy: self.policy,
                fetcher: fetch,
            });
        QueryObserver {
            inner: self.inner.clone(),
            key,
        }
    }

    pub fn has_active_reader(&self, prefix: &QueryKey) -> bool {
        lock(&self.inner.observers)
            .keys()
            .any(|k| k.starts_with(prefix))
    }

    /// Unconditional prefix invalidation followed by refetch of observed keys.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let removed = self.store.invalidate(prefix);
        self.refetch_observed(prefix, &HashSet::new());
        removed
    }

    /// Invalidation from out-of-band changes. Keys held by pending optimistic
    /// patches are deferred to their mutation instead of being dropped.
    pub fn invalidate_guarded(&self, prefix: &QueryKey) -> Invalidation {
        let outcome = self.store.invalidate_guarded(prefix);
        let skip: HashSet<QueryKey> = outcome.deferred.iter().cloned().collect();
        self.refetch_observed(prefix, &skip);
        outcome
    }

    fn refetch_observed(&self, prefix: &QueryKey, skip: &HashSet<QueryKey>) {
        let due: Vec<(QueryKey, QueryPolicy, Fetcher)> = lock(&self.inner.observers)
            .iter()
            .filter(|(k, _)| k.starts_with(prefix) && !skip.contains(*k))
            .map(|(k, o)| (k.clone(), o.policy, o.fetcher.clone()))
            .collect();
        for (key, policy, fetch) in due {
            self.spawn_refetch(key, policy, fetch);
        }
    }

    pub fn get_query_data(&self, key: &QueryKey) -> Option<Value> {
        self.store.get(key)
    }

    pub fn set_query_data(&self, key: QueryKey, value: Value) {
        self.store.put_with(key, value, self.policy.freshness());
    }
}

/// Active interest in a query key; dropping it ends the interest.
pub struct QueryObserver {
    inner: Arc<ManagerInner>,
    key: QueryKey,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        let mut observers = lock(&self.inner.observers);
        if let Some(o) = observers.get_mut(&self.key) {
            o.readers -= 1;
            if o.readers == 0 {
                observers.remove(&self.key);
            }
        }
    }
}
