//! Error types surfaced by cache reads and mutations.

use thiserror::Error;

/// Failure reported by an external fetch or write operation.
///
/// Errors are values carried in read and mutation outcomes, never panics:
/// the consuming layer has to be able to render a retry affordance. `Clone`
/// is required because a deduplicated fetch fans its result out to every
/// waiting reader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
  /// The requested resource does not exist remotely.
  #[error("not found: {0}")]
  NotFound(String),

  /// The remote rejected the content of a write.
  #[error("validation failed: {0}")]
  Validation(String),

  /// Network or remote failure.
  #[error("transport error: {0}")]
  Transport(String),
}

impl RemoteError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, RemoteError::NotFound(_))
  }

  pub fn is_validation(&self) -> bool {
    matches!(self, RemoteError::Validation(_))
  }

  pub fn is_transport(&self) -> bool {
    matches!(self, RemoteError::Transport(_))
  }

  /// The human-readable detail message.
  pub fn message(&self) -> &str {
    match self {
      RemoteError::NotFound(m) | RemoteError::Validation(m) | RemoteError::Transport(m) => m,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_display_includes_message() {
    let err = RemoteError::Transport("connection reset".to_string());
    assert_eq!(err.to_string(), "transport error: connection reset");
    assert_eq!(err.message(), "connection reset");
    assert!(err.is_transport());
  }
}
