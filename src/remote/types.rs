use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata of a document as the remote service describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
  pub id: String,
  pub filename: String,
  pub original_name: String,
  pub content_type: String,
  pub size_bytes: u64,
  pub storage_backend: String,
  pub is_public: bool,
  pub download_count: u64,
  pub created_at: DateTime<Utc>,
  pub owner_id: String,
}

/// Reading position within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
  pub current_page: u32,
  pub total_pages: u32,
}

impl ProgressState {
  pub fn new(current_page: u32, total_pages: u32) -> Self {
    Self {
      current_page,
      total_pages,
    }
  }
}

/// Progress as acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressAck {
  pub document_id: String,
  pub state: ProgressState,
  pub last_read_at: DateTime<Utc>,
}
