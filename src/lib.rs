//! Client-resident cache for remote resources with optimistic mutations.
//!
//! Inspired by TanStack Query, this crate keeps remote data in an in-memory
//! store and coordinates everything that can go wrong around it: reads that
//! dedupe in flight, writes that apply optimistically and roll back on
//! failure, and invalidation that marks whole key prefixes stale without
//! unnecessary network traffic. The application supplies the actual remote
//! operations and consumes read and mutation outcomes; transport, routing
//! and rendering stay out of this crate.
//!
//! Consistency under concurrency comes from one mechanism: a per-key
//! generation counter. Every fetch or mutation takes a generation ticket
//! when it begins, and a completion only commits if its ticket is still
//! current, so a slow response can never overwrite newer state.
//!
//! # Components
//!
//! - [`CacheStore`]: key-to-entry map with generation fencing and
//!   prefix-scoped subscriber notification
//! - [`QueryExecutor`]: cache-first reads with single-flight deduplication
//! - [`MutationExecutor`]: optimistic apply, rollback, settlement
//! - [`Invalidator`]: prefix staleness marking, optionally refetching
//!   subscribed keys
//! - [`CachedClient`]: the four wired together over a [`ResourceClient`]
//!
//! # Example
//!
//! ```ignore
//! let client = CachedClient::new(api, "events");
//!
//! // Cache-first read
//! let event = client.get("42").await;
//!
//! // Optimistic update: subscribers see the merged value immediately,
//! // and it reverts by itself if the remote rejects the write
//! let outcome = client
//!   .update("42", json!({"title": "New title"}), InvalidateMode::MarkOnly)
//!   .await;
//! ```

mod client;
mod error;
mod invalidate;
mod key;
mod mutation;
mod query;
mod store;

pub use client::{CachedClient, ResourceClient};
pub use error::RemoteError;
pub use invalidate::{InvalidateMode, Invalidator};
pub use key::{CacheKey, Segment};
pub use mutation::{
  ApplyFn, MutateOptions, MutationExecutor, MutationOutcome, MutationState, PendingMutation,
};
pub use query::{QueryExecutor, ReadOutcome};
pub use store::{CacheEntry, CacheStore, EntryStatus, Subscription};
