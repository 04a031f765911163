//! Serde types matching the document service's JSON.
//!
//! Kept apart from the domain types so wire renames never leak into storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{DocumentMeta, ProgressAck, ProgressState};

#[derive(Debug, Deserialize)]
pub struct ApiDocument {
  pub id: String,
  pub filename: String,
  pub original_name: String,
  pub content_type: String,
  pub size_bytes: u64,
  #[serde(default)]
  pub storage_backend: String,
  #[serde(default)]
  pub is_public: bool,
  #[serde(default)]
  pub download_count: u64,
  pub created_at: ApiTimestamp,
  pub owner_id: String,
}

/// Request body for `PUT /api/reading-progress/{id}`.
#[derive(Debug, Serialize)]
pub struct ApiProgressUpdate {
  pub current_page: u32,
  pub total_pages: u32,
}

#[derive(Debug, Deserialize)]
pub struct ApiProgress {
  pub document_id: String,
  pub current_page: u32,
  pub total_pages: u32,
  pub last_read_at: ApiTimestamp,
}

/// The backend serializes naive datetimes (no offset) for some rows; both
/// forms are accepted and treated as UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiTimestamp(pub DateTime<Utc>);

impl<'de> Deserialize<'de> for ApiTimestamp {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
      .map(ApiTimestamp)
      .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw)))
  }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
  if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
    return Some(dt.with_timezone(&Utc));
  }
  chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
    .ok()
    .map(|dt| dt.and_utc())
}

impl From<ApiDocument> for DocumentMeta {
  fn from(doc: ApiDocument) -> Self {
    Self {
      id: doc.id,
      filename: doc.filename,
      original_name: doc.original_name,
      content_type: doc.content_type,
      size_bytes: doc.size_bytes,
      storage_backend: doc.storage_backend,
      is_public: doc.is_public,
      download_count: doc.download_count,
      created_at: doc.created_at.0,
      owner_id: doc.owner_id,
    }
  }
}

impl From<ProgressState> for ApiProgressUpdate {
  fn from(state: ProgressState) -> Self {
    Self {
      current_page: state.current_page,
      total_pages: state.total_pages,
    }
  }
}

impl From<ApiProgress> for ProgressAck {
  fn from(p: ApiProgress) -> Self {
    Self {
      document_id: p.document_id,
      state: ProgressState::new(p.current_page, p.total_pages),
      last_read_at: p.last_read_at.0,
    }
  }
}
