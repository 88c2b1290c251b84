//! Entry store with generation fencing and subscriber notification.
//!
//! The store is the single shared mutable resource of the crate. All writes
//! from completing operations funnel through [`CacheStore::commit_if_current`],
//! which compares the committer's captured generation against the entry's
//! current one and silently drops losers. That fence replaces cancellation
//! tokens: starting a new operation on a key revokes every earlier in-flight
//! operation's ability to commit, without aborting the underlying future.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::trace;

use crate::key::CacheKey;

/// Freshness state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  /// Data is current and may be served without fetching
  Fresh,
  /// Data should be treated as a miss on the next read
  Stale,
  /// A fetch for this key is in flight
  Fetching,
}

/// Snapshot of a single cached entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: CacheKey,
  /// Cached value; `None` means the entry exists but holds no data
  pub data: Option<Value>,
  pub status: EntryStatus,
  /// When `data` or `status` last changed
  pub last_updated: DateTime<Utc>,
  /// Generation of the most recently begun operation on this key
  pub generation: u64,
}

impl CacheEntry {
  fn new(key: CacheKey) -> Self {
    Self {
      key,
      data: None,
      status: EntryStatus::Stale,
      last_updated: Utc::now(),
      generation: 0,
    }
  }
}

/// Callback invoked with an entry snapshot whenever its data or status changes.
pub type SubscriberFn = dyn Fn(&CacheEntry) + Send + Sync;

/// Keeps a subscriber registration alive.
///
/// The store holds only a [`Weak`] back reference to the callback, so
/// dropping the `Subscription` unsubscribes; the dead slot is pruned on the
/// next registry scan.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
  _callback: Arc<SubscriberFn>,
}

struct SubscriberSlot {
  prefix: CacheKey,
  callback: Weak<SubscriberFn>,
}

#[derive(Default)]
struct StoreInner {
  entries: HashMap<CacheKey, CacheEntry>,
  subscribers: Vec<SubscriberSlot>,
}

/// Key-to-entry mapping with per-key generation counters and prefix-scoped
/// subscriber notification.
///
/// Constructed explicitly and shared by reference (`Arc`) between the
/// executors; there is no global instance.
#[derive(Default)]
pub struct CacheStore {
  inner: Mutex<StoreInner>,
}

impl CacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, StoreInner> {
    // A panicking subscriber must not wedge the whole cache
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Get a snapshot of the entry for `key`, if one exists.
  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.lock().entries.get(key).cloned()
  }

  /// Unconditionally overwrite `key` with `data`, bumping `last_updated`
  /// and notifying subscribers. Creates the entry if absent.
  pub fn set(&self, key: &CacheKey, data: Value, status: EntryStatus) {
    let changed = {
      let mut inner = self.lock();
      let entry = inner
        .entries
        .entry(key.clone())
        .or_insert_with(|| CacheEntry::new(key.clone()));
      entry.data = Some(data);
      entry.status = status;
      entry.last_updated = Utc::now();
      entry.clone()
    };
    self.notify(&changed);
  }

  /// Change only the status of an existing entry, notifying subscribers.
  ///
  /// No-op if the entry is absent or already has `status`.
  pub fn set_status(&self, key: &CacheKey, status: EntryStatus) {
    let changed = {
      let mut inner = self.lock();
      match inner.entries.get_mut(key) {
        Some(entry) if entry.status != status => {
          entry.status = status;
          entry.last_updated = Utc::now();
          Some(entry.clone())
        }
        _ => None,
      }
    };
    if let Some(entry) = changed {
      self.notify(&entry);
    }
  }

  /// Mark every entry whose key satisfies `predicate` as stale.
  ///
  /// Returns the keys of all matching entries, including those that were
  /// already stale; subscribers are notified only for entries that changed.
  pub fn mark_stale(&self, predicate: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
    let mut matched = Vec::new();
    let mut changed = Vec::new();
    {
      let mut inner = self.lock();
      for (key, entry) in inner.entries.iter_mut() {
        if !predicate(key) {
          continue;
        }
        matched.push(key.clone());
        if entry.status != EntryStatus::Stale {
          entry.status = EntryStatus::Stale;
          entry.last_updated = Utc::now();
          changed.push(entry.clone());
        }
      }
    }
    for entry in &changed {
      self.notify(entry);
    }
    matched
  }

  /// Atomically increment and return the generation counter for `key`,
  /// creating the entry if absent.
  ///
  /// Every fetch or mutation calls this once at the start; the returned
  /// generation is its ticket for [`Self::commit_if_current`].
  pub fn begin_operation(&self, key: &CacheKey) -> u64 {
    let mut inner = self.lock();
    let entry = inner
      .entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::new(key.clone()));
    entry.generation += 1;
    entry.generation
  }

  /// Write `data` and `status` only if `generation` is still the entry's
  /// current generation. Returns whether the write happened.
  ///
  /// `data: None` writes *absence* (the rollback target of a mutation that
  /// created the entry). A discarded commit is not an error: the cache
  /// already holds newer state.
  pub fn commit_if_current(
    &self,
    key: &CacheKey,
    generation: u64,
    data: Option<Value>,
    status: EntryStatus,
  ) -> bool {
    let changed = {
      let mut inner = self.lock();
      match inner.entries.get_mut(key) {
        Some(entry) if entry.generation == generation => {
          entry.data = data;
          entry.status = status;
          entry.last_updated = Utc::now();
          Some(entry.clone())
        }
        Some(entry) => {
          trace!(key = %key, generation, current = entry.generation, "stale commit discarded");
          None
        }
        None => None,
      }
    };
    match changed {
      Some(entry) => {
        self.notify(&entry);
        true
      }
      None => false,
    }
  }

  /// Change only the status, and only if `generation` is still current.
  ///
  /// Used by a failed fetch to step back from `Fetching` without touching
  /// whatever data the entry still holds.
  pub fn status_if_current(&self, key: &CacheKey, generation: u64, status: EntryStatus) -> bool {
    let changed = {
      let mut inner = self.lock();
      match inner.entries.get_mut(key) {
        Some(entry) if entry.generation == generation => {
          entry.status = status;
          entry.last_updated = Utc::now();
          Some(entry.clone())
        }
        _ => None,
      }
    };
    match changed {
      Some(entry) => {
        self.notify(&entry);
        true
      }
      None => false,
    }
  }

  /// Register a callback for changes to any entry at or under `prefix`.
  ///
  /// The returned [`Subscription`] owns the callback; the store keeps a weak
  /// slot that dies with it.
  pub fn subscribe(
    &self,
    prefix: CacheKey,
    callback: impl Fn(&CacheEntry) + Send + Sync + 'static,
  ) -> Subscription {
    let callback: Arc<SubscriberFn> = Arc::new(callback);
    let mut inner = self.lock();
    inner.subscribers.retain(|slot| slot.callback.strong_count() > 0);
    inner.subscribers.push(SubscriberSlot {
      prefix,
      callback: Arc::downgrade(&callback),
    });
    Subscription {
      _callback: callback,
    }
  }

  /// Whether any live subscriber's prefix covers `key`.
  pub fn has_subscriber(&self, key: &CacheKey) -> bool {
    self
      .lock()
      .subscribers
      .iter()
      .any(|slot| slot.callback.strong_count() > 0 && key.starts_with(&slot.prefix))
  }

  /// Keys of all entries at or under `prefix`.
  pub fn keys_matching(&self, prefix: &CacheKey) -> Vec<CacheKey> {
    self
      .lock()
      .entries
      .keys()
      .filter(|key| key.starts_with(prefix))
      .cloned()
      .collect()
  }

  /// Synchronously invoke every subscriber whose prefix covers the changed
  /// entry's key. Callbacks run outside the internal lock so they may
  /// re-enter the store.
  fn notify(&self, entry: &CacheEntry) {
    let callbacks: Vec<Arc<SubscriberFn>> = {
      let mut inner = self.lock();
      inner.subscribers.retain(|slot| slot.callback.strong_count() > 0);
      inner
        .subscribers
        .iter()
        .filter(|slot| entry.key.starts_with(&slot.prefix))
        .filter_map(|slot| slot.callback.upgrade())
        .collect()
    };
    if !callbacks.is_empty() {
      trace!(key = %entry.key, subscribers = callbacks.len(), "notifying subscribers");
    }
    for callback in callbacks {
      callback(entry);
    }
  }
}
