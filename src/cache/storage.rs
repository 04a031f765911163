//! Local store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::remote::{DocumentMeta, ProgressState};

use super::cursor::{Cursor, DocumentKey, MutationKey};
use super::types::{
  content_digest, now_millis, CachedDocument, CachedPayload, PendingMutation, StoreEvent,
  UsageSummary,
};

/// Durable storage for cached documents, their payloads and the pending
/// mutation queue.
///
/// Writes that touch a document and its payload are atomic: after a call
/// returns either both records changed or neither did. Every committed write
/// is announced on the channel returned by [`LocalStore::subscribe`].
pub trait LocalStore: Send + Sync {
  /// Write a document and its payload, replacing any previous entry.
  fn put_document(&self, doc: &CachedDocument, payload: &[u8]) -> Result<()>;

  /// Document and payload, or `None` unless both are present.
  fn get_document(&self, id: &str) -> Result<Option<(CachedDocument, CachedPayload)>>;

  /// Cached metadata only, without reading the payload.
  fn get_metadata(&self, id: &str) -> Result<Option<CachedDocument>>;

  fn contains_document(&self, id: &str) -> Result<bool>;

  /// Overwrite display fields of a cached document, keeping payload and
  /// `cached_at`. Returns false if the document is not cached.
  fn update_metadata(&self, meta: &DocumentMeta) -> Result<bool>;

  /// Delete a document and its payload. Absent ids are not an error.
  fn remove_document(&self, id: &str) -> Result<()>;

  /// Documents ordered by `cached_at` descending, starting after `after`.
  fn documents_page(&self, after: Option<&DocumentKey>, limit: usize)
    -> Result<Vec<CachedDocument>>;

  fn document_ids(&self) -> Result<Vec<String>>;

  /// Count and declared byte size of the cached documents.
  fn usage_summary(&self) -> Result<UsageSummary>;

  /// Insert a mutation for `entity_id`, replacing any queued one.
  fn enqueue_mutation(&self, entity_id: &str, state: ProgressState) -> Result<PendingMutation>;

  /// Mutations ordered by `updated_at` ascending, starting after `after`.
  fn mutations_page(
    &self,
    after: Option<&MutationKey>,
    limit: usize,
  ) -> Result<Vec<PendingMutation>>;

  /// Whether the entry with this sequence id is still queued. False once it
  /// was replaced, discarded or removed.
  fn mutation_exists(&self, seq: i64) -> Result<bool>;

  /// Delete queue entries by sequence id. Returns how many existed.
  fn remove_mutations(&self, seqs: &[i64]) -> Result<usize>;

  /// Count an explicit rejection against an entry. Returns the new attempt
  /// count, or `None` if the entry is gone (replaced or removed).
  fn record_rejection(&self, seq: i64) -> Result<Option<u32>>;

  /// Drop whatever is queued for `entity_id`.
  fn discard_mutation(&self, entity_id: &str) -> Result<bool>;

  /// Change notifications, sent after each committed write.
  fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

  /// Lazy, restartable listing of cached documents, most recent first.
  fn list_documents(&self) -> Cursor<'_, Self, CachedDocument>
  where
    Self: Sized,
  {
    Cursor::new(self)
  }

  /// Lazy, restartable listing of the queue, oldest first.
  fn list_mutations(&self) -> Cursor<'_, Self, PendingMutation>
  where
    Self: Sized,
  {
    Cursor::new(self)
  }
}

/// SQLite-based local store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  events: broadcast::Sender<StoreEvent>,
}

/// Schema for the three collections.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    filename TEXT NOT NULL,
    original_name TEXT NOT NULL,
    content_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    storage_backend TEXT NOT NULL,
    is_public INTEGER NOT NULL,
    download_count INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    cached_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_cached_at ON documents(cached_at, id);
CREATE INDEX IF NOT EXISTS idx_documents_original_name ON documents(original_name);

CREATE TABLE IF NOT EXISTS payloads (
    document_id TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    sha256 TEXT NOT NULL
);

-- AUTOINCREMENT keeps sequence ids strictly increasing even after deletes
CREATE TABLE IF NOT EXISTS pending_mutations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id TEXT NOT NULL UNIQUE,
    current_page INTEGER NOT NULL,
    total_pages INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_pending_mutations_updated
    ON pending_mutations(updated_at, seq);
"#;

const DOCUMENT_COLUMNS: &str = "d.id, d.filename, d.original_name, d.content_type, d.size_bytes, \
   d.storage_backend, d.is_public, d.download_count, d.created_at, d.owner_id, d.cached_at";

const MUTATION_COLUMNS: &str = "seq, entity_id, current_page, total_pages, updated_at, attempts";

impl SqliteStore {
  /// Open or create the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::StorageUnavailable(format!("Failed to create store directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::StorageUnavailable(format!(
        "Failed to open store at {}: {}",
        path.display(),
        e
      ))
    })?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;

    debug!(path = %path.display(), "opened offline store");
    Self::with_connection(conn)
  }

  /// A store that lives only as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let (events, _) = broadcast::channel(64);
    let store = Self {
      conn: Mutex::new(conn),
      events,
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::Config("Could not determine data directory".into()))?;

    Ok(data_dir.join("sheaf-offline").join("offline.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| SyncError::StorageUnavailable(format!("Failed to run migrations: {}", e)))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }

  /// Run raw SQL against the connection, for tests that break a table.
  #[cfg(test)]
  pub(crate) fn execute_raw(&self, sql: &str) {
    self.conn().unwrap().execute_batch(sql).unwrap();
  }

  fn notify(&self, event: StoreEvent) {
    // No receivers is fine
    let _ = self.events.send(event);
  }
}

impl LocalStore for SqliteStore {
  fn put_document(&self, doc: &CachedDocument, payload: &[u8]) -> Result<()> {
    let mut conn = self.conn()?;
    let meta = &doc.meta;

    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR REPLACE INTO documents (id, filename, original_name, content_type, size_bytes,
         storage_backend, is_public, download_count, created_at, owner_id, cached_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
      params![
        meta.id,
        meta.filename,
        meta.original_name,
        meta.content_type,
        meta.size_bytes as i64,
        meta.storage_backend,
        meta.is_public,
        meta.download_count as i64,
        meta.created_at.to_rfc3339(),
        meta.owner_id,
        doc.cached_at.timestamp_millis(),
      ],
    )?;
    tx.execute(
      "INSERT OR REPLACE INTO payloads (document_id, data, sha256) VALUES (?1, ?2, ?3)",
      params![doc.id(), payload, content_digest(payload)],
    )?;
    tx.commit()?;
    drop(conn);

    self.notify(StoreEvent::Documents);
    Ok(())
  }

  fn get_document(&self, id: &str) -> Result<Option<(CachedDocument, CachedPayload)>> {
    let conn = self.conn()?;

    let sql = format!(
      "SELECT {}, p.data, p.sha256 FROM documents d
       INNER JOIN payloads p ON p.document_id = d.id
       WHERE d.id = ?1",
      DOCUMENT_COLUMNS
    );
    let found = conn
      .query_row(&sql, params![id], |row| {
        let doc = document_from_row(row)?;
        let data: Vec<u8> = row.get(11)?;
        let digest: String = row.get(12)?;
        Ok((doc, data, digest))
      })
      .optional()?;

    let Some((doc, data, digest)) = found else {
      return Ok(None);
    };

    let payload = CachedPayload {
      document_id: doc.meta.id.clone(),
      data,
    };
    if payload.digest() != digest {
      warn!(document_id = %id, "cached payload failed integrity check");
      return Err(SyncError::StorageUnavailable(format!(
        "Cached payload for {} is corrupt",
        id
      )));
    }

    Ok(Some((doc, payload)))
  }

  fn get_metadata(&self, id: &str) -> Result<Option<CachedDocument>> {
    let conn = self.conn()?;
    let sql = format!(
      "SELECT {} FROM documents d
       INNER JOIN payloads p ON p.document_id = d.id
       WHERE d.id = ?1",
      DOCUMENT_COLUMNS
    );
    Ok(conn.query_row(&sql, params![id], document_from_row).optional()?)
  }

  fn contains_document(&self, id: &str) -> Result<bool> {
    let conn = self.conn()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM documents WHERE id = ?1",
        params![id],
        |row| row.get(0),
      )
      .optional()?;
    Ok(found.is_some())
  }

  fn update_metadata(&self, meta: &DocumentMeta) -> Result<bool> {
    let conn = self.conn()?;
    let changed = conn.execute(
      "UPDATE documents SET filename = ?2, original_name = ?3, content_type = ?4,
         size_bytes = ?5, storage_backend = ?6, is_public = ?7, download_count = ?8,
         created_at = ?9, owner_id = ?10
       WHERE id = ?1",
      params![
        meta.id,
        meta.filename,
        meta.original_name,
        meta.content_type,
        meta.size_bytes as i64,
        meta.storage_backend,
        meta.is_public,
        meta.download_count as i64,
        meta.created_at.to_rfc3339(),
        meta.owner_id,
      ],
    )?;
    drop(conn);

    if changed > 0 {
      self.notify(StoreEvent::Documents);
    }
    Ok(changed > 0)
  }

  fn remove_document(&self, id: &str) -> Result<()> {
    let mut conn = self.conn()?;

    let tx = conn.transaction()?;
    let removed = tx.execute("DELETE FROM documents WHERE id = ?1", params![id])?
      + tx.execute("DELETE FROM payloads WHERE document_id = ?1", params![id])?;
    tx.commit()?;
    drop(conn);

    if removed > 0 {
      self.notify(StoreEvent::Documents);
    }
    Ok(())
  }

  fn documents_page(
    &self,
    after: Option<&DocumentKey>,
    limit: usize,
  ) -> Result<Vec<CachedDocument>> {
    let conn = self.conn()?;
    let (after_cached, after_id) = match after {
      Some(key) => (Some(key.cached_at_ms), Some(key.id.as_str())),
      None => (None, None),
    };

    let sql = format!(
      "SELECT {} FROM documents d
       WHERE ?1 IS NULL OR d.cached_at < ?1 OR (d.cached_at = ?1 AND d.id > ?2)
       ORDER BY d.cached_at DESC, d.id ASC
       LIMIT ?3",
      DOCUMENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let docs = stmt
      .query_map(
        params![after_cached, after_id, limit as i64],
        document_from_row,
      )?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(docs)
  }

  fn document_ids(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT id FROM documents ORDER BY cached_at DESC, id ASC")?;
    let ids = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
  }

  fn usage_summary(&self) -> Result<UsageSummary> {
    let conn = self.conn()?;
    let (count, bytes): (i64, i64) = conn.query_row(
      "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM documents",
      [],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(UsageSummary {
      document_count: count as u64,
      total_bytes: bytes as u64,
    })
  }

  fn enqueue_mutation(&self, entity_id: &str, state: ProgressState) -> Result<PendingMutation> {
    let mut conn = self.conn()?;
    let updated_at = now_millis();

    // Delete + insert rather than update: the replacement gets a fresh
    // sequence id, so an in-flight pass holding the old one cannot remove it.
    let tx = conn.transaction()?;
    tx.execute(
      "DELETE FROM pending_mutations WHERE entity_id = ?1",
      params![entity_id],
    )?;
    tx.execute(
      "INSERT INTO pending_mutations (entity_id, current_page, total_pages, updated_at, attempts)
       VALUES (?1, ?2, ?3, ?4, 0)",
      params![
        entity_id,
        state.current_page,
        state.total_pages,
        updated_at.timestamp_millis()
      ],
    )?;
    let seq = tx.last_insert_rowid();
    tx.commit()?;
    drop(conn);

    self.notify(StoreEvent::Mutations);
    Ok(PendingMutation {
      seq,
      entity_id: entity_id.to_string(),
      state,
      updated_at,
      attempts: 0,
    })
  }

  fn mutations_page(
    &self,
    after: Option<&MutationKey>,
    limit: usize,
  ) -> Result<Vec<PendingMutation>> {
    let conn = self.conn()?;
    let (after_updated, after_seq) = match after {
      Some(key) => (Some(key.updated_at_ms), Some(key.seq)),
      None => (None, None),
    };

    let sql = format!(
      "SELECT {} FROM pending_mutations
       WHERE ?1 IS NULL OR updated_at > ?1 OR (updated_at = ?1 AND seq > ?2)
       ORDER BY updated_at ASC, seq ASC
       LIMIT ?3",
      MUTATION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mutations = stmt
      .query_map(
        params![after_updated, after_seq, limit as i64],
        mutation_from_row,
      )?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(mutations)
  }

  fn mutation_exists(&self, seq: i64) -> Result<bool> {
    let conn = self.conn()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM pending_mutations WHERE seq = ?1",
        params![seq],
        |row| row.get(0),
      )
      .optional()?;
    Ok(found.is_some())
  }

  fn remove_mutations(&self, seqs: &[i64]) -> Result<usize> {
    if seqs.is_empty() {
      return Ok(0);
    }

    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    let mut removed = 0;
    {
      let mut stmt = tx.prepare("DELETE FROM pending_mutations WHERE seq = ?1")?;
      for seq in seqs {
        removed += stmt.execute(params![seq])?;
      }
    }
    tx.commit()?;
    drop(conn);

    if removed > 0 {
      self.notify(StoreEvent::Mutations);
    }
    Ok(removed)
  }

  fn record_rejection(&self, seq: i64) -> Result<Option<u32>> {
    let conn = self.conn()?;
    let attempts = conn
      .query_row(
        "UPDATE pending_mutations SET attempts = attempts + 1 WHERE seq = ?1 RETURNING attempts",
        params![seq],
        |row| row.get(0),
      )
      .optional()?;
    drop(conn);

    if attempts.is_some() {
      self.notify(StoreEvent::Mutations);
    }
    Ok(attempts)
  }

  fn discard_mutation(&self, entity_id: &str) -> Result<bool> {
    let conn = self.conn()?;
    let removed = conn.execute(
      "DELETE FROM pending_mutations WHERE entity_id = ?1",
      params![entity_id],
    )?;
    drop(conn);

    if removed > 0 {
      self.notify(StoreEvent::Mutations);
    }
    Ok(removed > 0)
  }

  fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
    self.events.subscribe()
  }
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<CachedDocument> {
  let created_at: String = row.get(8)?;
  let meta = DocumentMeta {
    id: row.get(0)?,
    filename: row.get(1)?,
    original_name: row.get(2)?,
    content_type: row.get(3)?,
    size_bytes: row.get::<_, i64>(4)? as u64,
    storage_backend: row.get(5)?,
    is_public: row.get(6)?,
    download_count: row.get::<_, i64>(7)? as u64,
    created_at: parse_rfc3339(8, &created_at)?,
    owner_id: row.get(9)?,
  };
  let cached_at = from_millis(10, row.get(10)?)?;
  Ok(CachedDocument::new(meta, cached_at))
}

fn mutation_from_row(row: &Row<'_>) -> rusqlite::Result<PendingMutation> {
  Ok(PendingMutation {
    seq: row.get(0)?,
    entity_id: row.get(1)?,
    state: ProgressState::new(row.get(2)?, row.get(3)?),
    updated_at: from_millis(4, row.get(4)?)?,
    attempts: row.get(5)?,
  })
}

fn parse_rfc3339(column: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| {
      rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn from_millis(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, ms))
}
