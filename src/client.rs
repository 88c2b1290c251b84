//! Cached resource client that wraps a remote client with the cache core.
//!
//! This wraps an application-supplied [`ResourceClient`] and provides the
//! same operations, but reads go through the cache and writes apply
//! optimistically with automatic rollback. Transport, serialization and
//! endpoints stay on the application's side of the trait.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::RemoteError;
use crate::invalidate::{InvalidateMode, Invalidator};
use crate::key::CacheKey;
use crate::mutation::{MutateOptions, MutationExecutor, MutationOutcome};
use crate::query::{QueryExecutor, ReadOutcome};
use crate::store::{CacheEntry, CacheStore, Subscription};

/// Remote operations for one resource collection.
///
/// Each method's failure carries a human-readable message in the
/// [`RemoteError`] variant named by its contract.
#[async_trait]
pub trait ResourceClient: Send + Sync + 'static {
  /// Fetch a single resource. Fails with `NotFound` or `Transport`.
  async fn fetch_one(&self, id: &str) -> Result<Value, RemoteError>;

  /// Apply a partial update, returning the updated resource.
  /// Fails with `Validation` or `Transport`.
  async fn update_one(&self, id: &str, patch: Value) -> Result<Value, RemoteError>;

  /// Delete a resource. Fails with `Transport`.
  async fn delete_one(&self, id: &str) -> Result<(), RemoteError>;

  /// List resources, optionally filtered. Fails with `Transport`.
  async fn list_resources(&self, filter: Option<&str>) -> Result<Vec<Value>, RemoteError>;
}

/// Resource client with transparent caching and optimistic writes.
///
/// Detail entries are keyed `[collection, id]` and listings `[collection]`
/// (filtered listings `[collection, "?filter"]`), so invalidating the
/// collection prefix reaches every entry belonging to it.
#[derive(Clone)]
pub struct CachedClient<C> {
  inner: Arc<C>,
  collection: String,
  store: Arc<CacheStore>,
  queries: QueryExecutor,
  mutations: MutationExecutor,
  invalidator: Invalidator,
}

impl<C: ResourceClient> CachedClient<C> {
  /// Create a cached client for one resource collection.
  ///
  /// Constructs the whole cache stack (store, query executor, invalidator,
  /// mutation executor) as explicitly owned state; nothing is global.
  pub fn new(inner: C, collection: &str) -> Self {
    let store = Arc::new(CacheStore::new());
    let queries = QueryExecutor::new(store.clone());
    let invalidator = Invalidator::new(store.clone(), queries.clone());
    let mutations = MutationExecutor::new(store.clone(), invalidator.clone());

    Self {
      inner: Arc::new(inner),
      collection: collection.to_string(),
      store,
      queries,
      mutations,
      invalidator,
    }
  }

  /// Set the freshness window for cached reads.
  pub fn with_stale_time(mut self, stale_time: chrono::Duration) -> Self {
    // Rewire the executor chain so every component sees the same window
    self.queries = self.queries.with_stale_time(stale_time);
    self.invalidator = Invalidator::new(self.store.clone(), self.queries.clone());
    self.mutations = MutationExecutor::new(self.store.clone(), self.invalidator.clone());
    self
  }

  /// The underlying store, for subscribing or host-driven eviction.
  pub fn store(&self) -> &Arc<CacheStore> {
    &self.store
  }

  /// Watch every entry of this client's collection.
  pub fn subscribe(
    &self,
    callback: impl Fn(&CacheEntry) + Send + Sync + 'static,
  ) -> Subscription {
    self.store.subscribe(self.collection_key(), callback)
  }

  /// Get a single resource by id, cache-first.
  pub async fn get(&self, id: &str) -> ReadOutcome {
    let key = self.detail_key(id);
    let inner = self.inner.clone();
    let id = id.to_string();
    self
      .queries
      .read(&key, move || {
        let inner = inner.clone();
        let id = id.clone();
        async move { inner.fetch_one(&id).await }
      })
      .await
  }

  /// List the collection, cache-first. The result is cached as a JSON
  /// array under the listing key.
  pub async fn list(&self, filter: Option<&str>) -> ReadOutcome {
    let key = self.listing_key(filter);
    let inner = self.inner.clone();
    let filter = filter.map(String::from);
    self
      .queries
      .read(&key, move || {
        let inner = inner.clone();
        let filter = filter.clone();
        async move {
          inner
            .list_resources(filter.as_deref())
            .await
            .map(Value::Array)
        }
      })
      .await
  }

  /// Update a resource optimistically.
  ///
  /// The patch's fields are merged into the cached value immediately; a
  /// failed remote write restores the pre-update value. Settlement
  /// invalidates the whole collection with `mode`.
  pub async fn update(&self, id: &str, patch: Value, mode: InvalidateMode) -> MutationOutcome {
    let key = self.detail_key(id);
    let inner = self.inner.clone();
    let id = id.to_string();
    let options = MutateOptions::new(mode)
      .with_apply(merge_patch)
      .with_related(self.collection_key());
    self
      .mutations
      .mutate(
        &key,
        patch,
        move |value| async move { inner.update_one(&id, value).await.map(|_| ()) },
        options,
      )
      .await
  }

  /// Delete a resource optimistically.
  ///
  /// The cached value disappears immediately and comes back if the remote
  /// delete fails. Settlement invalidates the whole collection with
  /// `mode`; `MarkOnly` is the usual choice when the consumer navigates
  /// away, so nothing refetches a list nobody is watching.
  pub async fn delete(&self, id: &str, mode: InvalidateMode) -> MutationOutcome {
    let key = self.detail_key(id);
    let inner = self.inner.clone();
    let id = id.to_string();
    let options = MutateOptions::new(mode)
      .with_apply(|_previous, _value| None)
      .with_related(self.collection_key());
    self
      .mutations
      .mutate(
        &key,
        Value::Null,
        move |_value| async move { inner.delete_one(&id).await },
        options,
      )
      .await
  }

  /// Invalidate an arbitrary key or prefix of this client's cache.
  pub fn invalidate(&self, prefix: &CacheKey, mode: InvalidateMode) {
    self.invalidator.invalidate(prefix, mode);
  }

  fn collection_key(&self) -> CacheKey {
    CacheKey::new(self.collection.clone())
  }

  fn detail_key(&self, id: &str) -> CacheKey {
    self.collection_key().join(id)
  }

  fn listing_key(&self, filter: Option<&str>) -> CacheKey {
    match filter {
      Some(filter) => self.collection_key().join(format!("?{}", filter)),
      None => self.collection_key(),
    }
  }
}

/// Shallow field merge of a patch into the cached object, used as the
/// optimistic staging hook for updates. Non-object values are replaced.
fn merge_patch(previous: Option<&Value>, patch: &Value) -> Option<Value> {
  match previous {
    Some(Value::Object(base)) => {
      let mut merged = base.clone();
      if let Value::Object(fields) = patch {
        for (field, value) in fields {
          merged.insert(field.clone(), value.clone());
        }
      }
      Some(Value::Object(merged))
    }
    _ => Some(patch.clone()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::EntryStatus;
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

  fn init_tracing() {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .try_init();
  }

  /// Counting fake remote; clones share the counters.
  #[derive(Clone, Default)]
  struct MockApi {
    fetch_calls: Arc<AtomicU32>,
    list_calls: Arc<AtomicU32>,
    update_calls: Arc<AtomicU32>,
    delete_calls: Arc<AtomicU32>,
    fail_writes: Arc<AtomicBool>,
  }

  #[async_trait]
  impl ResourceClient for MockApi {
    async fn fetch_one(&self, id: &str) -> Result<Value, RemoteError> {
      self.fetch_calls.fetch_add(1, Ordering::SeqCst);
      Ok(json!({"id": id, "title": "Remote title", "location": "Berlin"}))
    }

    async fn update_one(&self, _id: &str, patch: Value) -> Result<Value, RemoteError> {
      self.update_calls.fetch_add(1, Ordering::SeqCst);
      if self.fail_writes.load(Ordering::SeqCst) {
        Err(RemoteError::Validation("title may not be empty".to_string()))
      } else {
        Ok(patch)
      }
    }

    async fn delete_one(&self, _id: &str) -> Result<(), RemoteError> {
      self.delete_calls.fetch_add(1, Ordering::SeqCst);
      if self.fail_writes.load(Ordering::SeqCst) {
        Err(RemoteError::Transport("connection reset".to_string()))
      } else {
        Ok(())
      }
    }

    async fn list_resources(&self, _filter: Option<&str>) -> Result<Vec<Value>, RemoteError> {
      self.list_calls.fetch_add(1, Ordering::SeqCst);
      Ok(vec![json!({"id": "1"}), json!({"id": "2"})])
    }
  }

  #[tokio::test]
  async fn test_get_caches_resource() {
    init_tracing();
    let api = MockApi::default();
    let client = CachedClient::new(api.clone(), "events");

    let first = client.get("42").await;
    let second = client.get("42").await;

    assert!(first.is_ready());
    assert_eq!(second.data(), first.data());
    assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_list_caches_under_collection_prefix() {
    let api = MockApi::default();
    let client = CachedClient::new(api.clone(), "events");

    let all = client.list(None).await;
    let filtered = client.list(Some("city=berlin")).await;

    assert!(all.is_ready());
    assert!(filtered.is_ready());
    // Distinct listing keys, both under the collection prefix
    assert_eq!(api.list_calls.load(Ordering::SeqCst), 2);

    let listing_keys = client.store().keys_matching(&CacheKey::new("events"));
    assert_eq!(listing_keys.len(), 2);
  }

  #[tokio::test]
  async fn test_update_merges_optimistically_and_invalidates_collection() {
    let api = MockApi::default();
    let client = CachedClient::new(api.clone(), "events");

    client.get("42").await;
    client.list(None).await;

    let outcome = client
      .update("42", json!({"title": "Edited"}), InvalidateMode::MarkOnly)
      .await;

    assert!(outcome.is_success());
    assert_eq!(api.update_calls.load(Ordering::SeqCst), 1);

    // Patched field merged over the fetched resource
    let key = CacheKey::new("events").join("42");
    let entry = client.store().get(&key).unwrap();
    assert_eq!(
      entry.data,
      Some(json!({"id": "42", "title": "Edited", "location": "Berlin"}))
    );

    // The listing went stale but was not refetched
    let listing = client.store().get(&CacheKey::new("events")).unwrap();
    assert_eq!(listing.status, EntryStatus::Stale);
    assert_eq!(api.list_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_update_failure_rolls_back() {
    let api = MockApi::default();
    let client = CachedClient::new(api.clone(), "events");

    client.get("42").await;
    api.fail_writes.store(true, Ordering::SeqCst);

    let outcome = client
      .update("42", json!({"title": ""}), InvalidateMode::MarkOnly)
      .await;

    assert!(outcome.error().is_some_and(RemoteError::is_validation));

    let key = CacheKey::new("events").join("42");
    let entry = client.store().get(&key).unwrap();
    assert_eq!(
      entry.data,
      Some(json!({"id": "42", "title": "Remote title", "location": "Berlin"}))
    );
  }

  #[tokio::test]
  async fn test_delete_removes_value_and_marks_listing_stale() {
    let api = MockApi::default();
    let client = CachedClient::new(api.clone(), "events");

    client.get("42").await;
    client.list(None).await;

    let outcome = client.delete("42", InvalidateMode::MarkOnly).await;

    assert!(outcome.is_success());
    assert_eq!(api.delete_calls.load(Ordering::SeqCst), 1);

    let key = CacheKey::new("events").join("42");
    assert!(client.store().get(&key).unwrap().data.is_none());

    // Mark-only: the departed listing is stale, not refetched
    let listing = client.store().get(&CacheKey::new("events")).unwrap();
    assert_eq!(listing.status, EntryStatus::Stale);
    assert_eq!(api.list_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_delete_failure_restores_value() {
    let api = MockApi::default();
    let client = CachedClient::new(api.clone(), "events");

    client.get("42").await;
    api.fail_writes.store(true, Ordering::SeqCst);

    let outcome = client.delete("42", InvalidateMode::MarkOnly).await;

    assert!(outcome.error().is_some_and(RemoteError::is_transport));

    let key = CacheKey::new("events").join("42");
    let entry = client.store().get(&key).unwrap();
    assert_eq!(
      entry.data,
      Some(json!({"id": "42", "title": "Remote title", "location": "Berlin"}))
    );
  }

  #[tokio::test]
  async fn test_subscriber_watches_collection_changes() {
    let api = MockApi::default();
    let client = CachedClient::new(api.clone(), "events");

    let changes = Arc::new(AtomicU32::new(0));
    let changes_clone = changes.clone();
    let _sub = client.subscribe(move |_| {
      changes_clone.fetch_add(1, Ordering::SeqCst);
    });

    client.get("42").await;

    // At least the Fetching transition and the committed result
    assert!(changes.load(Ordering::SeqCst) >= 2);
  }
}
