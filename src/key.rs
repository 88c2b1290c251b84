//! Hierarchical cache keys.
//!
//! A key is an ordered sequence of segments, e.g. `["events", 42]` for a
//! single resource and `["events"]` for the collection listing it. Two keys
//! match exactly when their segments are equal element-wise; a key
//! prefix-matches another when it is an initial subsequence, which is what
//! lets an invalidation of `["events"]` reach `["events", 42]`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One element of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segment {
  /// String segment (collection names, string ids)
  Str(String),
  /// Integer segment (numeric ids)
  Int(i64),
}

impl fmt::Display for Segment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Segment::Str(s) => write!(f, "{}", s),
      Segment::Int(n) => write!(f, "{}", n),
    }
  }
}

impl From<&str> for Segment {
  fn from(s: &str) -> Self {
    Segment::Str(s.to_string())
  }
}

impl From<String> for Segment {
  fn from(s: String) -> Self {
    Segment::Str(s)
  }
}

impl From<i64> for Segment {
  fn from(n: i64) -> Self {
    Segment::Int(n)
  }
}

impl From<u32> for Segment {
  fn from(n: u32) -> Self {
    Segment::Int(n as i64)
  }
}

/// Hierarchical identifier for a cached resource or resource collection.
///
/// Keys are built head-first:
///
/// ```
/// use requery::CacheKey;
///
/// let listing = CacheKey::new("events");
/// let detail = CacheKey::new("events").join(42_i64);
/// assert!(detail.starts_with(&listing));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(Vec<Segment>);

impl CacheKey {
  /// Create a single-segment key.
  pub fn new(head: impl Into<Segment>) -> Self {
    Self(vec![head.into()])
  }

  /// Append a segment, consuming and returning the key.
  pub fn join(mut self, segment: impl Into<Segment>) -> Self {
    self.0.push(segment.into());
    self
  }

  /// The segments of this key, in order.
  pub fn segments(&self) -> &[Segment] {
    &self.0
  }

  /// Whether `prefix` is an initial subsequence of this key.
  ///
  /// Every key starts with itself.
  pub fn starts_with(&self, prefix: &CacheKey) -> bool {
    self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, segment) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, "/")?;
      }
      write!(f, "{}", segment)?;
    }
    Ok(())
  }
}

impl<S: Into<Segment>> FromIterator<S> for CacheKey {
  fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
    Self(iter.into_iter().map(Into::into).collect())
  }
}
