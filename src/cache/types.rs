//! Records held by the local store.

use chrono::{DateTime, SubsecRound, Utc};
use sha2::{Digest, Sha256};

use crate::remote::{DocumentMeta, ProgressState};

/// A remote document saved for offline use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDocument {
  pub meta: DocumentMeta,
  /// When the document was (last) saved locally
  pub cached_at: DateTime<Utc>,
}

impl CachedDocument {
  pub fn new(meta: DocumentMeta, cached_at: DateTime<Utc>) -> Self {
    Self { meta, cached_at }
  }

  pub fn id(&self) -> &str {
    &self.meta.id
  }
}

/// Raw content of a cached document, keyed by the document id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPayload {
  pub document_id: String,
  pub data: Vec<u8>,
}

impl CachedPayload {
  /// Hex SHA-256 of the content, stored alongside it for integrity checks.
  pub fn digest(&self) -> String {
    content_digest(&self.data)
  }
}

pub(crate) fn content_digest(data: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data);
  hex::encode(hasher.finalize())
}

/// Current time at the millisecond precision the store persists.
pub fn now_millis() -> DateTime<Utc> {
  Utc::now().trunc_subsecs(3)
}

/// A queued state change not yet acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
  /// Auto-assigned, strictly increasing, never reused
  pub seq: i64,
  /// Document the change applies to
  pub entity_id: String,
  pub state: ProgressState,
  pub updated_at: DateTime<Utc>,
  /// Explicit rejections seen during replay
  pub attempts: u32,
}

/// Count and declared size of everything cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSummary {
  pub document_count: u64,
  pub total_bytes: u64,
}

/// Collections of the store, named in change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
  /// Documents and their payloads changed
  Documents,
  /// The pending-mutation queue changed
  Mutations,
}

/// Indicates where an opened document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Network unavailable, serving the offline copy
  Offline,
}

/// A document ready for the reading surface.
#[derive(Debug, Clone)]
pub struct OpenedDocument {
  pub meta: DocumentMeta,
  pub content: Vec<u8>,
  pub source: CacheSource,
  /// When the offline copy was saved (if served from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Reading position to resume from, if one is known
  pub progress: Option<ProgressState>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_digest_is_hex_sha256() {
    let payload = CachedPayload {
      document_id: "d1".into(),
      data: b"abc".to_vec(),
    };
    assert_eq!(
      payload.digest(),
      "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
  }
}
