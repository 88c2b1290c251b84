//! Staleness marking and selective re-fetching.
//!
//! Invalidation is prefix-based: invalidating `["events"]` reaches both a
//! detail entry `["events", 42]` and the listing entry keyed `["events"]`.
//! The mode decides whether affected data is renewed eagerly or on the next
//! read; there is deliberately no default mode, every call site states one.

use std::sync::Arc;
use tracing::debug;

use crate::key::CacheKey;
use crate::query::QueryExecutor;
use crate::store::CacheStore;

/// What an invalidation does beyond marking entries stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateMode {
  /// Mark matching entries stale and immediately refetch every matching key
  /// that currently has a subscriber, so visible data renews without a new
  /// read call.
  Refetch,
  /// Mark matching entries stale only; the next read on an affected key
  /// treats it as a miss. No network activity.
  MarkOnly,
}

/// Marks entries stale by key prefix and optionally renews subscribed ones.
#[derive(Clone)]
pub struct Invalidator {
  store: Arc<CacheStore>,
  queries: QueryExecutor,
}

impl Invalidator {
  pub fn new(store: Arc<CacheStore>, queries: QueryExecutor) -> Self {
    Self { store, queries }
  }

  /// Mark every entry at or under `prefix` stale.
  ///
  /// With [`InvalidateMode::Refetch`], matching keys that have a live
  /// subscriber are re-read in detached tasks using their retained
  /// fetchers; keys nobody watches stay stale until the next read.
  pub fn invalidate(&self, prefix: &CacheKey, mode: InvalidateMode) {
    let matched = self.store.mark_stale(|key| key.starts_with(prefix));
    debug!(prefix = %prefix, matched = matched.len(), ?mode, "invalidated");

    if mode == InvalidateMode::Refetch {
      for key in matched {
        if self.store.has_subscriber(&key) {
          self.queries.refetch(&key);
        }
      }
    }
  }

  pub(crate) fn queries(&self) -> &QueryExecutor {
    &self.queries
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::EntryStatus;
  use futures::FutureExt;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn setup() -> (Arc<CacheStore>, QueryExecutor, Invalidator) {
    let store = Arc::new(CacheStore::new());
    let queries = QueryExecutor::new(store.clone());
    let invalidator = Invalidator::new(store.clone(), queries.clone());
    (store, queries, invalidator)
  }

  fn key(segments: &[&str]) -> CacheKey {
    segments.iter().copied().collect()
  }

  #[tokio::test]
  async fn test_mark_only_marks_all_prefix_matches() {
    let (store, _queries, invalidator) = setup();

    store.set(&key(&["events"]), json!([]), EntryStatus::Fresh);
    store.set(&key(&["events", "1"]), json!(1), EntryStatus::Fresh);
    store.set(&key(&["events", "2"]), json!(2), EntryStatus::Fresh);
    store.set(&key(&["venues", "1"]), json!(3), EntryStatus::Fresh);

    invalidator.invalidate(&key(&["events"]), InvalidateMode::MarkOnly);

    assert_eq!(store.get(&key(&["events"])).unwrap().status, EntryStatus::Stale);
    assert_eq!(store.get(&key(&["events", "1"])).unwrap().status, EntryStatus::Stale);
    assert_eq!(store.get(&key(&["events", "2"])).unwrap().status, EntryStatus::Stale);
    // Unrelated collection untouched
    assert_eq!(store.get(&key(&["venues", "1"])).unwrap().status, EntryStatus::Fresh);
  }

  #[tokio::test]
  async fn test_read_after_mark_only_fetches_again() {
    let (_store, queries, invalidator) = setup();
    let k = key(&["events", "1"]);
    let calls = Arc::new(AtomicU32::new(0));

    let calls_clone = calls.clone();
    let fetch = move || {
      calls_clone.fetch_add(1, Ordering::SeqCst);
      async { Ok(json!("data")) }.boxed()
    };

    queries.read(&k, fetch.clone()).await;
    queries.read(&k, fetch.clone()).await;
    // Fresh cache absorbed the second read
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    invalidator.invalidate(&key(&["events"]), InvalidateMode::MarkOnly);
    // MarkOnly itself fetched nothing
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    queries.read(&k, fetch).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_refetch_mode_renews_subscribed_keys_only() {
    let (store, queries, invalidator) = setup();
    let watched = key(&["events", "1"]);
    let unwatched = key(&["events", "2"]);
    let watched_calls = Arc::new(AtomicU32::new(0));
    let unwatched_calls = Arc::new(AtomicU32::new(0));

    let c = watched_calls.clone();
    queries
      .read(&watched, move || {
        c.fetch_add(1, Ordering::SeqCst);
        async { Ok(json!("a")) }.boxed()
      })
      .await;
    let c = unwatched_calls.clone();
    queries
      .read(&unwatched, move || {
        c.fetch_add(1, Ordering::SeqCst);
        async { Ok(json!("b")) }.boxed()
      })
      .await;

    let _sub = store.subscribe(watched.clone(), |_| {});

    invalidator.invalidate(&key(&["events"]), InvalidateMode::Refetch);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The watched key refetched and is fresh again
    assert_eq!(watched_calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.get(&watched).unwrap().status, EntryStatus::Fresh);
    // The unwatched key just went stale
    assert_eq!(unwatched_calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.get(&unwatched).unwrap().status, EntryStatus::Stale);
  }
}
