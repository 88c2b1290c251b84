//! Optimistic mutation lifecycle: stage, write, roll back, settle.
//!
//! A mutation applies its intended value to the cache *before* the remote
//! write confirms, so subscribers see the change immediately. If the remote
//! rejects it, the exact pre-mutation snapshot is restored. Either way the
//! mutated key (and any declared related keys) is invalidated at settlement
//! so the cache eventually reconciles with the authoritative remote state.
//!
//! Overlapping mutations on one key are resolved by the generation fence:
//! the later `begin_operation` revokes the earlier mutation's commits, so
//! the earlier one can neither publish its optimistic value nor roll it
//! back over newer state. Its settlement still runs.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::RemoteError;
use crate::invalidate::{InvalidateMode, Invalidator};
use crate::key::CacheKey;
use crate::store::{CacheStore, EntryStatus};

/// Hook producing the value staged into the cache during the optimistic
/// apply, from the current cached value and the mutation's new value.
/// Returning `None` stages absence, which is how a delete is staged.
pub type ApplyFn = Box<dyn FnOnce(Option<&Value>, &Value) -> Option<Value> + Send>;

/// Per-invocation options for [`MutationExecutor::mutate`].
///
/// There is no `Default`: the invalidation mode applied at settlement must
/// be stated by the caller.
pub struct MutateOptions {
  apply: Option<ApplyFn>,
  related: Vec<CacheKey>,
  mode: InvalidateMode,
}

impl MutateOptions {
  pub fn new(mode: InvalidateMode) -> Self {
    Self {
      apply: None,
      related: Vec::new(),
      mode,
    }
  }

  /// Stage the optimistic value through a hook instead of using the new
  /// value as-is (e.g. merging patch fields into the cached object).
  pub fn with_apply(
    mut self,
    apply: impl FnOnce(Option<&Value>, &Value) -> Option<Value> + Send + 'static,
  ) -> Self {
    self.apply = Some(Box::new(apply));
    self
  }

  /// Declare a related key to invalidate at settlement, e.g. the listing
  /// collection containing the mutated resource.
  pub fn with_related(mut self, key: CacheKey) -> Self {
    self.related.push(key);
    self
  }
}

/// State of a single mutation invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
  Idle,
  Applying,
  Succeeded,
  Failed,
  Settled,
}

/// One optimistic write in progress, owned by the `mutate` invocation that
/// created it. Never shared across concurrent mutations of the same key.
#[derive(Debug)]
pub struct PendingMutation {
  pub key: CacheKey,
  /// Cached value captured before the optimistic apply; `None` if the key
  /// held no data
  pub previous: Option<Value>,
  /// Value staged into the cache; `None` staged absence
  pub optimistic: Option<Value>,
  pub state: MutationState,
}

impl PendingMutation {
  fn new(key: CacheKey) -> Self {
    Self {
      key,
      previous: None,
      optimistic: None,
      state: MutationState::Idle,
    }
  }

  fn advance(&mut self, next: MutationState) {
    debug_assert!(
      matches!(
        (self.state, next),
        (MutationState::Idle, MutationState::Applying)
          | (MutationState::Applying, MutationState::Succeeded)
          | (MutationState::Applying, MutationState::Failed)
          | (MutationState::Succeeded, MutationState::Settled)
          | (MutationState::Failed, MutationState::Settled)
      ),
      "illegal mutation transition {:?} -> {:?}",
      self.state,
      next
    );
    self.state = next;
  }
}

/// Result of a settled mutation.
#[derive(Debug, Clone)]
pub enum MutationOutcome {
  /// The remote write confirmed; the optimistic value stands.
  Succeeded,
  /// The remote write failed; the pre-mutation snapshot was restored.
  Failed(RemoteError),
}

impl MutationOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self, MutationOutcome::Succeeded)
  }

  pub fn error(&self) -> Option<&RemoteError> {
    match self {
      MutationOutcome::Failed(error) => Some(error),
      MutationOutcome::Succeeded => None,
    }
  }
}

/// Orchestrates optimistic writes against the store.
#[derive(Clone)]
pub struct MutationExecutor {
  store: Arc<CacheStore>,
  invalidator: Invalidator,
}

impl MutationExecutor {
  pub fn new(store: Arc<CacheStore>, invalidator: Invalidator) -> Self {
    Self { store, invalidator }
  }

  /// Apply `new_value` to `key` optimistically, confirm it with `write_fn`,
  /// and roll back if the write fails.
  ///
  /// The staged value is visible to subscribers before `write_fn` resolves.
  /// Settlement always invalidates the mutated key and the related keys
  /// declared in `options`, with the configured mode.
  pub async fn mutate<F, Fut>(
    &self,
    key: &CacheKey,
    new_value: Value,
    write_fn: F,
    options: MutateOptions,
  ) -> MutationOutcome
  where
    F: FnOnce(Value) -> Fut,
    Fut: Future<Output = Result<(), RemoteError>>,
  {
    let MutateOptions {
      apply,
      related,
      mode,
    } = options;

    let mut pending = PendingMutation::new(key.clone());

    // Applying: fence out any in-flight read, snapshot the current value,
    // and stage the optimistic one
    self.invalidator.queries().abandon(key);
    let generation = self.store.begin_operation(key);
    pending.previous = self.store.get(key).and_then(|entry| entry.data);
    pending.optimistic = match apply {
      Some(apply) => apply(pending.previous.as_ref(), &new_value),
      None => Some(new_value.clone()),
    };
    pending.advance(MutationState::Applying);
    self
      .store
      .commit_if_current(key, generation, pending.optimistic.clone(), EntryStatus::Fresh);
    debug!(key = %key, generation, "optimistic value staged");

    // The single suspend point: the remote write
    let outcome = match write_fn(new_value).await {
      Ok(()) => {
        pending.advance(MutationState::Succeeded);
        debug!(key = %key, generation, "mutation confirmed");
        MutationOutcome::Succeeded
      }
      Err(error) => {
        pending.advance(MutationState::Failed);
        // Unconditional rollback. Losing the fence here means a newer
        // operation owns the key and the stale restore is dropped.
        let restored =
          self
            .store
            .commit_if_current(key, generation, pending.previous.clone(), EntryStatus::Fresh);
        debug!(key = %key, generation, restored, %error, "mutation failed");
        MutationOutcome::Failed(error)
      }
    };

    // Settled: reconcile regardless of the write's outcome
    pending.advance(MutationState::Settled);
    self.invalidator.invalidate(key, mode);
    for related_key in &related {
      self.invalidator.invalidate(related_key, mode);
    }

    outcome
  }
}
