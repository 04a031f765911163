//! Local persistence for offline reading.
//!
//! This module provides:
//! - A durable store for cached documents, their payloads and queued mutations
//! - A coalescing mutation queue (at most one entry per document)
//! - The [`OfflineCache`] façade the reading surface talks to

mod cursor;
mod layer;
mod queue;
mod storage;
mod types;

pub use cursor::{Cursor, DocumentKey, MutationKey, Paged};
pub use layer::{OfflineCache, ProgressRoute};
pub use queue::{MutationQueue, ReplayGuard, ReplayMark, DEFAULT_MAX_REJECTIONS};
pub use storage::{LocalStore, SqliteStore};
pub use types::{
  now_millis, CacheSource, CachedDocument, CachedPayload, OpenedDocument, PendingMutation,
  StoreEvent, UsageSummary,
};
