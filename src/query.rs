//! Read orchestration: cache-first reads with deduplicated fetching.
//!
//! A read consults the store first and returns fresh data without touching
//! the network. On a miss (or a stale entry) it launches the caller-supplied
//! fetch, commits the result behind the generation fence, and shares the
//! in-flight future so concurrent reads of the same key ride along instead
//! of fetching twice.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(CacheStore::new());
//! let queries = QueryExecutor::new(store.clone());
//!
//! let key = CacheKey::new("events").join(42_i64);
//! let outcome = queries
//!   .read(&key, move || {
//!     let api = api.clone();
//!     async move { api.fetch_event(42).await }
//!   })
//!   .await;
//!
//! match outcome {
//!   ReadOutcome::Ready(event) => render(event),
//!   ReadOutcome::Failed { error, stale } => render_error(error, stale),
//! }
//! ```

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::error::RemoteError;
use crate::key::CacheKey;
use crate::store::{CacheStore, EntryStatus};

/// Outcome of a single read.
#[derive(Debug, Clone)]
pub enum ReadOutcome {
  /// Data is available.
  Ready(Value),
  /// The fetch failed. Stale data, when the cache still holds some, stays
  /// available so the consumer can render it next to a retry affordance.
  Failed {
    error: RemoteError,
    stale: Option<Value>,
  },
}

impl ReadOutcome {
  pub fn is_ready(&self) -> bool {
    matches!(self, ReadOutcome::Ready(_))
  }

  pub fn is_failed(&self) -> bool {
    matches!(self, ReadOutcome::Failed { .. })
  }

  pub fn data(&self) -> Option<&Value> {
    match self {
      ReadOutcome::Ready(data) => Some(data),
      ReadOutcome::Failed { .. } => None,
    }
  }

  pub fn error(&self) -> Option<&RemoteError> {
    match self {
      ReadOutcome::Failed { error, .. } => Some(error),
      ReadOutcome::Ready(_) => None,
    }
  }
}

type FetchFuture = BoxFuture<'static, Result<Value, RemoteError>>;
type SharedFetch = Shared<FetchFuture>;

/// Type-erased fetch factory, retained per key so the invalidator can
/// refetch without a caller present.
pub(crate) type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Orchestrates reads against the store.
///
/// Cheap to clone; clones share the same in-flight and fetcher registries.
#[derive(Clone)]
pub struct QueryExecutor {
  store: Arc<CacheStore>,
  /// In-flight fetch per key, tagged with the launching generation so a
  /// superseded fetch only cleans up its own slot
  inflight: Arc<Mutex<HashMap<CacheKey, (u64, SharedFetch)>>>,
  fetchers: Arc<Mutex<HashMap<CacheKey, Fetcher>>>,
  /// How long a `Fresh` entry may be served without refetching
  stale_time: Duration,
}

impl QueryExecutor {
  pub fn new(store: Arc<CacheStore>) -> Self {
    Self {
      store,
      inflight: Arc::new(Mutex::new(HashMap::new())),
      fetchers: Arc::new(Mutex::new(HashMap::new())),
      stale_time: Duration::minutes(5),
    }
  }

  /// Set the freshness window for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  /// Read `key`, fetching with `fetch_fn` on a miss.
  ///
  /// A fresh cached entry short-circuits without invoking `fetch_fn`.
  /// Concurrent reads of the same key share one underlying fetch. The
  /// fetcher is retained so a later `Refetch`-mode invalidation can renew
  /// this key on its own.
  pub async fn read<F, Fut>(&self, key: &CacheKey, fetch_fn: F) -> ReadOutcome
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
  {
    let fetcher: Fetcher = Arc::new(move || fetch_fn().boxed());
    lock(&self.fetchers).insert(key.clone(), fetcher.clone());
    self.read_with(key, fetcher).await
  }

  pub(crate) async fn read_with(&self, key: &CacheKey, fetcher: Fetcher) -> ReadOutcome {
    if let Some(entry) = self.store.get(key) {
      if entry.status == EntryStatus::Fresh && !self.is_expired(entry.last_updated) {
        if let Some(data) = entry.data {
          return ReadOutcome::Ready(data);
        }
      }
    }

    let shared = self.join_or_launch(key, fetcher);
    let result = shared.await;

    // The commit already happened inside the shared fetch. Report the
    // store's current view, so a reader whose fetch lost the generation
    // race surfaces the newer value instead of the discarded one.
    let current = self.store.get(key).and_then(|entry| entry.data);
    match result {
      Ok(value) => ReadOutcome::Ready(current.unwrap_or(value)),
      Err(error) => ReadOutcome::Failed {
        error,
        stale: current,
      },
    }
  }

  /// Spawn a detached re-read of `key` using its retained fetcher, if any.
  pub(crate) fn refetch(&self, key: &CacheKey) {
    let fetcher = lock(&self.fetchers).get(key).cloned();
    let Some(fetcher) = fetcher else {
      return;
    };
    debug!(key = %key, "refetch triggered");
    let executor = self.clone();
    let key = key.clone();
    tokio::spawn(async move {
      let _ = executor.read_with(&key, fetcher).await;
    });
  }

  /// Forget the in-flight fetch for `key`, if any.
  ///
  /// The fetch itself keeps running but can no longer commit (its
  /// generation has been superseded by the caller) and no new reader will
  /// join it. Invoked when a mutation starts on the key.
  pub(crate) fn abandon(&self, key: &CacheKey) {
    lock(&self.inflight).remove(key);
  }

  fn is_expired(&self, last_updated: DateTime<Utc>) -> bool {
    Utc::now() - last_updated > self.stale_time
  }

  /// Join the in-flight fetch for `key`, or launch one.
  ///
  /// The generation is captured synchronously, before this call returns,
  /// so any operation that begins afterwards supersedes this fetch.
  /// Subscriber-visible status changes happen on first poll, after the
  /// registry lock is released.
  fn join_or_launch(&self, key: &CacheKey, fetcher: Fetcher) -> SharedFetch {
    let mut inflight = lock(&self.inflight);
    if let Some((_, existing)) = inflight.get(key) {
      return existing.clone();
    }

    let generation = self.store.begin_operation(key);
    debug!(key = %key, generation, "fetch started");

    let store = self.store.clone();
    let inflight_map = self.inflight.clone();
    let key_owned = key.clone();
    let shared = async move {
      store.set_status(&key_owned, EntryStatus::Fetching);
      let result = fetcher().await;
      {
        let mut map = lock(&inflight_map);
        if map.get(&key_owned).is_some_and(|(launched, _)| *launched == generation) {
          map.remove(&key_owned);
        }
      }
      match &result {
        Ok(value) => {
          store.commit_if_current(&key_owned, generation, Some(value.clone()), EntryStatus::Fresh);
        }
        Err(error) => {
          // Leave whatever data the entry holds; just step back from Fetching
          debug!(key = %key_owned, %error, "fetch failed");
          store.status_if_current(&key_owned, generation, EntryStatus::Stale);
        }
      }
      result
    }
    .boxed()
    .shared();

    inflight.insert(key.clone(), (generation, shared.clone()));
    shared
  }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
