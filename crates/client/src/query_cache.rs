//! Keyed cache of server data with cancellable, deduplicated fetches.
//!
//! Every key may have a registered query function. Reads through [`QueryCache::fetch`]
//! return the cached value while it is fresh and otherwise run the query,
//! joining a fetch that is already in flight. Writes through [`QueryCache::set`]
//! are synchronous, which is what optimistic updates and rollback rely on.
//!
//! A fetch whose key was cancelled, or superseded by a newer fetch, never
//! writes its result.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use eventsub_shared::ApiError;
use futures_util::future::{AbortHandle, Abortable, BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::retry::RetryPolicy;

/// Cache keys for server data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Events,
    UserSubscriptions,
    SubscriptionStatus(i64),
    CurrentUser,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("query {0:?} was cancelled")]
    Cancelled(QueryKey),
    #[error("no query function registered for {0:?}")]
    NotRegistered(QueryKey),
    #[error("cached value for {0:?} has an unexpected type")]
    TypeMismatch(QueryKey),
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// How long a fetched value is served without refetching.
    pub stale_time: Duration,
    pub retry: RetryPolicy,
}

impl QueryOptions {
    pub fn new(stale_time: Duration) -> Self {
        Self {
            stale_time,
            retry: RetryPolicy::query(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

type Value = Arc<dyn Any + Send + Sync>;
type QueryFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, ApiError>> + Send + Sync>;
type FetchFuture = Shared<BoxFuture<'static, Result<Value, QueryError>>>;

struct InFlight {
    id: u64,
    abort: AbortHandle,
    future: FetchFuture,
}

#[derive(Default)]
struct Entry {
    data: Option<Value>,
    updated_at: Option<Instant>,
    invalidated: bool,
    error: Option<ApiError>,
    in_flight: Option<InFlight>,
    query: Option<(QueryFn, QueryOptions)>,
}

impl Entry {
    fn is_fresh(&self) -> bool {
        if self.invalidated {
            return false;
        }
        match (&self.updated_at, &self.query) {
            (Some(at), Some((_, options))) => at.elapsed() < options.stale_time,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

struct Inner {
    entries: Mutex<HashMap<QueryKey, Entry>>,
    next_fetch: AtomicU64,
    revision: watch::Sender<u64>,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<QueryKey, Entry>> {
        // Entries are only replaced whole, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

/// Shared handle to the cache. Clones refer to the same store.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (revision, _rx) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                next_fetch: AtomicU64::new(1),
                revision,
            }),
        }
    }

    /// Register the function that loads `key` from the server.
    pub fn register<T, F, Fut>(&self, key: QueryKey, options: QueryOptions, query: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let query: QueryFn = Arc::new(move || {
            let fut = query();
            async move { fut.await.map(|v| Arc::new(v) as Value) }.boxed()
        });
        self.inner.entries().entry(key).or_default().query = Some((query, options));
    }

    pub fn is_registered(&self, key: QueryKey) -> bool {
        self.inner
            .entries()
            .get(&key)
            .map(|e| e.query.is_some())
            .unwrap_or(false)
    }

    /// Synchronous typed read of the current value.
    pub fn get<T: Send + Sync + 'static>(&self, key: QueryKey) -> Option<Arc<T>> {
        let data = self.inner.entries().get(&key)?.data.clone()?;
        data.downcast::<T>().ok()
    }

    /// Synchronous write. Marks the value fresh.
    pub fn set<T: Send + Sync + 'static>(&self, key: QueryKey, value: T) {
        self.set_arc(key, Arc::new(value));
    }

    /// Write a shared value, e.g. a snapshot taken with [`QueryCache::get`].
    pub fn set_arc<T: Send + Sync + 'static>(&self, key: QueryKey, value: Arc<T>) {
        {
            let mut entries = self.inner.entries();
            let entry = entries.entry(key).or_default();
            entry.data = Some(value as Value);
            entry.updated_at = Some(Instant::now());
            entry.invalidated = false;
            entry.error = None;
        }
        tracing::debug!(?key, "cache write");
        self.inner.bump();
    }

    pub fn is_stale(&self, key: QueryKey) -> bool {
        self.inner
            .entries()
            .get(&key)
            .map(|e| !e.is_fresh())
            .unwrap_or(true)
    }

    pub fn is_fetching(&self, key: QueryKey) -> bool {
        self.inner
            .entries()
            .get(&key)
            .map(|e| e.in_flight.is_some())
            .unwrap_or(false)
    }

    /// Error of the last failed fetch, cleared by the next successful write.
    pub fn error(&self, key: QueryKey) -> Option<ApiError> {
        self.inner.entries().get(&key)?.error.clone()
    }

    /// Abort an in-flight fetch for `key`. Its result is discarded.
    ///
    /// Returns whether a fetch was running.
    pub fn cancel(&self, key: QueryKey) -> bool {
        let in_flight = self
            .inner
            .entries()
            .get_mut(&key)
            .and_then(|e| e.in_flight.take());
        match in_flight {
            Some(fetch) => {
                tracing::debug!(?key, fetch_id = fetch.id, "cancelled fetch");
                fetch.abort.abort();
                true
            }
            None => false,
        }
    }

    /// Return the cached value if fresh, otherwise fetch it.
    pub async fn fetch<T: Send + Sync + 'static>(&self, key: QueryKey) -> Result<Arc<T>, QueryError> {
        let cached = {
            let entries = self.inner.entries();
            entries
                .get(&key)
                .filter(|e| e.is_fresh())
                .and_then(|e| e.data.clone())
        };
        let value = match cached {
            Some(value) => value,
            None => self.start_or_join(key)?.await?,
        };
        value.downcast::<T>().map_err(|_| QueryError::TypeMismatch(key))
    }

    /// Fetch `key` from the server regardless of freshness, replacing any
    /// fetch already in flight.
    pub async fn refetch<T: Send + Sync + 'static>(&self, key: QueryKey) -> Result<Arc<T>, QueryError> {
        self.cancel(key);
        let value = self.start_or_join(key)?.await?;
        value.downcast::<T>().map_err(|_| QueryError::TypeMismatch(key))
    }

    /// Mark `key` stale and, if it has a query function, refetch it.
    ///
    /// Resolves once the refetch has settled.
    pub async fn invalidate(&self, key: QueryKey) -> Result<(), QueryError> {
        let registered = {
            let mut entries = self.inner.entries();
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.invalidated = true;
                    entry.query.is_some()
                }
                None => false,
            }
        };
        if !registered {
            return Ok(());
        }
        tracing::debug!(?key, "invalidated, refetching");
        self.cancel(key);
        self.start_or_join(key)?.await.map(|_| ())
    }

    /// Drop the cached value for `key`, keeping its query function.
    pub fn remove(&self, key: QueryKey) {
        self.cancel(key);
        if let Some(entry) = self.inner.entries().get_mut(&key) {
            entry.data = None;
            entry.updated_at = None;
            entry.error = None;
            entry.invalidated = false;
        }
        self.inner.bump();
    }

    /// Drop every cached value and abort all fetches.
    pub fn clear(&self) {
        {
            let mut entries = self.inner.entries();
            for entry in entries.values_mut() {
                if let Some(fetch) = entry.in_flight.take() {
                    fetch.abort.abort();
                }
                entry.data = None;
                entry.updated_at = None;
                entry.error = None;
                entry.invalidated = false;
            }
        }
        tracing::debug!("cache cleared");
        self.inner.bump();
    }

    /// Receiver that changes whenever any cached value changes.
    pub fn revision(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    fn start_or_join(&self, key: QueryKey) -> Result<FetchFuture, QueryError> {
        let mut entries = self.inner.entries();
        let entry = entries.entry(key).or_default();

        if let Some(fetch) = &entry.in_flight {
            return Ok(fetch.future.clone());
        }

        let (query, options) = entry.query.clone().ok_or(QueryError::NotRegistered(key))?;
        let id = self.inner.next_fetch.fetch_add(1, Ordering::Relaxed);
        let (abort, registration) = AbortHandle::new_pair();

        let retry = options.retry;
        let request = Abortable::new(async move { retry.run(|| query()).await }, registration);

        let inner = Arc::clone(&self.inner);
        let future = async move {
            let outcome = request.await;
            let mut entries = inner.entries();
            let entry = entries.entry(key).or_default();

            let current = entry.in_flight.as_ref().map(|f| f.id) == Some(id);
            if current {
                entry.in_flight = None;
            }

            match outcome {
                Err(_aborted) => Err(QueryError::Cancelled(key)),
                Ok(_) if !current => Err(QueryError::Cancelled(key)),
                Ok(Ok(value)) => {
                    entry.data = Some(value.clone());
                    entry.updated_at = Some(Instant::now());
                    entry.invalidated = false;
                    entry.error = None;
                    drop(entries);
                    tracing::debug!(?key, fetch_id = id, "fetch stored");
                    inner.bump();
                    Ok(value)
                }
                Ok(Err(err)) => {
                    tracing::debug!(?key, fetch_id = id, error = %err, "fetch failed");
                    entry.error = Some(err.clone());
                    Err(QueryError::Api(err))
                }
            }
        }
        .boxed()
        .shared();

        entry.in_flight = Some(InFlight {
            id,
            abort,
            future: future.clone(),
        });
        Ok(future)
    }
}
