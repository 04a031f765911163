//! Error taxonomy shared by the store, the remote client and the sync engine.

use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// Local durable storage could not be read or written.
  #[error("local storage unavailable: {0}")]
  StorageUnavailable(String),

  /// A network call failed (timeout, DNS, connection reset, 5xx).
  #[error("remote unreachable: {0}")]
  RemoteUnreachable(String),

  /// The requested document or payload is not in the cache.
  #[error("not found: {0}")]
  NotFound(String),

  /// The remote service answered and explicitly refused the request.
  #[error("remote rejected request (HTTP {status}): {message}")]
  Rejected { status: u16, message: String },

  #[error("configuration error: {0}")]
  Config(String),
}

impl SyncError {
  /// Whether this is a network-level failure that goes away on its own.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::RemoteUnreachable(_))
  }

  pub fn is_rejection(&self) -> bool {
    matches!(self, Self::Rejected { .. })
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    Self::StorageUnavailable(e.to_string())
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    match e.status() {
      Some(status) if status.is_client_error() => Self::Rejected {
        status: status.as_u16(),
        message: e.to_string(),
      },
      _ => Self::RemoteUnreachable(e.to_string()),
    }
  }
}
