//! Error taxonomy shared by every operation.
//!
//! All error types are `Clone`: a failed fetch is handed to every reader that
//! attached to the same in-flight request.

use std::fmt;

use thiserror::Error;

use crate::mutation::Mutation;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a transport call failed.
///
/// Callers treat every reason the same way; the tag exists for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportReason {
  /// No response was received
  Network,
  /// A response arrived with a non-success status
  Status(u16),
  /// A success response whose body could not be decoded
  Decode,
}

impl fmt::Display for TransportReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Network => f.write_str("network"),
      Self::Status(status) => write!(f, "status {}", status),
      Self::Decode => f.write_str("decode"),
    }
  }
}

/// Failure of a single HTTP call against the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
  pub reason: TransportReason,
  /// Application error code from the `{code, message}` body, when present
  pub code: Option<i64>,
  pub message: String,
}

impl TransportError {
  pub fn network(message: impl Into<String>) -> Self {
    Self {
      reason: TransportReason::Network,
      code: None,
      message: message.into(),
    }
  }

  pub fn status(status: u16, code: Option<i64>, message: impl Into<String>) -> Self {
    Self {
      reason: TransportReason::Status(status),
      code,
      message: message.into(),
    }
  }

  pub fn decode(message: impl Into<String>) -> Self {
    Self {
      reason: TransportReason::Decode,
      code: None,
      message: message.into(),
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self.reason, TransportReason::Status(404))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
  #[error(transparent)]
  Transport(#[from] TransportError),

  /// Logical absence of a requested id. Callers render an empty state.
  #[error("{resource} {id} not found")]
  NotFound { resource: &'static str, id: String },

  /// Two call sites shared a key but disagree on the cached type.
  #[error("cache entry {key} holds a value of a different type")]
  CacheType { key: String },

  /// The entry a reader was waiting on was evicted or the cache shut down.
  #[error("fetch for {key} was cancelled")]
  Cancelled { key: String },

  #[error("invalid configuration: {0}")]
  Config(String),
}

impl Error {
  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound { .. })
  }
}

/// A failed write, tagged with the operation that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {description}", .mutation.failure_title())]
pub struct MutationError {
  pub mutation: Mutation,
  /// Human-readable description derived from the failure's message
  pub description: String,
  #[source]
  pub source: Error,
}

impl MutationError {
  pub fn new(mutation: Mutation, source: Error) -> Self {
    Self {
      mutation,
      description: source.to_string(),
      source,
    }
  }

  pub fn title(&self) -> &'static str {
    self.mutation.failure_title()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_mutation_error_description_comes_from_source() {
    let err = MutationError::new(
      Mutation::DeleteJob {
        job_id: "J1".into(),
      },
      TransportError::status(500, Some(17), "job is locked").into(),
    );

    assert_eq!(err.description, "job is locked");
    assert_eq!(err.to_string(), "Failed to delete job: job is locked");
  }

  #[test]
  fn test_not_found_is_distinct_from_transport_404() {
    let transport: Error = TransportError::status(404, None, "missing").into();
    assert!(!transport.is_not_found());

    let logical = Error::NotFound {
      resource: "job",
      id: "J9".into(),
    };
    assert!(logical.is_not_found());
    assert_eq!(logical.to_string(), "job J9 not found");
  }
}
