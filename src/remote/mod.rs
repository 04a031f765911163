//! The remote document service, consumed through a narrow trait.

pub mod api_types;
pub mod client;
#[cfg(test)]
pub mod fake;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;

pub use client::HttpRemote;
pub use types::{DocumentMeta, ProgressAck, ProgressState};

/// Endpoints of the document service the offline engine depends on.
///
/// Every call is subject to the implementation's request timeout; a timed-out
/// call reports `SyncError::RemoteUnreachable`.
#[async_trait]
pub trait RemoteService: Send + Sync {
  /// Raw content of a document.
  async fn fetch_binary(&self, document_id: &str) -> Result<Vec<u8>>;

  /// Push a reading position for a document.
  async fn write_progress(&self, document_id: &str, state: ProgressState) -> Result<ProgressAck>;

  /// Current metadata of a document.
  async fn fetch_document_metadata(&self, document_id: &str) -> Result<DocumentMeta>;

  /// Last reading position the server knows for a document, if any.
  async fn fetch_progress(&self, document_id: &str) -> Result<Option<ProgressAck>>;

  /// Cheap reachability check.
  async fn probe(&self) -> Result<()>;
}
