//! Scriptable in-memory remote used by the unit tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::error::{Result, SyncError};

use super::types::{DocumentMeta, ProgressAck, ProgressState};
use super::RemoteService;

/// How the fake answers progress writes for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
  Accept,
  Reject(u16),
  Unreachable,
}

#[derive(Default)]
pub struct FakeRemote {
  replies: Mutex<HashMap<String, Reply>>,
  binaries: Mutex<HashMap<String, Vec<u8>>>,
  metadata: Mutex<HashMap<String, DocumentMeta>>,
  progress: Mutex<HashMap<String, ProgressAck>>,
  writes: Mutex<Vec<(String, ProgressState)>>,
  down: AtomicBool,
  hold: Option<(Notify, Semaphore)>,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// A remote whose progress writes block until `release` is called.
  pub fn held() -> Self {
    Self {
      hold: Some((Notify::new(), Semaphore::new(0))),
      ..Self::default()
    }
  }

  pub fn reply(&self, document_id: &str, reply: Reply) {
    self
      .replies
      .lock()
      .unwrap()
      .insert(document_id.to_string(), reply);
  }

  pub fn serve(&self, meta: DocumentMeta, content: &[u8]) {
    self
      .binaries
      .lock()
      .unwrap()
      .insert(meta.id.clone(), content.to_vec());
    self.metadata.lock().unwrap().insert(meta.id.clone(), meta);
  }

  pub fn set_down(&self, down: bool) {
    self.down.store(down, Ordering::SeqCst);
  }

  /// Progress writes the fake accepted or refused, in call order.
  pub fn writes(&self) -> Vec<(String, ProgressState)> {
    self.writes.lock().unwrap().clone()
  }

  /// Wait until a progress write is blocked on the hold.
  pub async fn entered(&self) {
    if let Some((entered, _)) = &self.hold {
      entered.notified().await;
    }
  }

  pub fn release(&self, writes: usize) {
    if let Some((_, gate)) = &self.hold {
      gate.add_permits(writes);
    }
  }

  fn check_up(&self) -> Result<()> {
    if self.down.load(Ordering::SeqCst) {
      Err(SyncError::RemoteUnreachable("connection refused".into()))
    } else {
      Ok(())
    }
  }
}

#[async_trait]
impl RemoteService for FakeRemote {
  async fn fetch_binary(&self, document_id: &str) -> Result<Vec<u8>> {
    self.check_up()?;
    self
      .binaries
      .lock()
      .unwrap()
      .get(document_id)
      .cloned()
      .ok_or_else(|| SyncError::Rejected {
        status: 404,
        message: "Document not found".into(),
      })
  }

  async fn write_progress(&self, document_id: &str, state: ProgressState) -> Result<ProgressAck> {
    self
      .writes
      .lock()
      .unwrap()
      .push((document_id.to_string(), state));

    if let Some((entered, gate)) = &self.hold {
      entered.notify_one();
      let permit = gate.acquire().await.map_err(|e| SyncError::RemoteUnreachable(e.to_string()))?;
      permit.forget();
    }

    self.check_up()?;
    let reply = self
      .replies
      .lock()
      .unwrap()
      .get(document_id)
      .copied()
      .unwrap_or(Reply::Accept);

    match reply {
      Reply::Accept => {
        let ack = ProgressAck {
          document_id: document_id.to_string(),
          state,
          last_read_at: Utc::now(),
        };
        self
          .progress
          .lock()
          .unwrap()
          .insert(document_id.to_string(), ack.clone());
        Ok(ack)
      }
      Reply::Reject(status) => Err(SyncError::Rejected {
        status,
        message: "rejected".into(),
      }),
      Reply::Unreachable => Err(SyncError::RemoteUnreachable("timed out".into())),
    }
  }

  async fn fetch_document_metadata(&self, document_id: &str) -> Result<DocumentMeta> {
    self.check_up()?;
    self
      .metadata
      .lock()
      .unwrap()
      .get(document_id)
      .cloned()
      .ok_or_else(|| SyncError::Rejected {
        status: 404,
        message: "Document not found".into(),
      })
  }

  async fn fetch_progress(&self, document_id: &str) -> Result<Option<ProgressAck>> {
    self.check_up()?;
    Ok(self.progress.lock().unwrap().get(document_id).cloned())
  }

  async fn probe(&self) -> Result<()> {
    self.check_up()
  }
}

/// Metadata for a test document of the given size.
pub fn document(id: &str, name: &str, size_bytes: u64) -> DocumentMeta {
  DocumentMeta {
    id: id.to_string(),
    filename: format!("{}.pdf", id),
    original_name: name.to_string(),
    content_type: "application/pdf".to_string(),
    size_bytes,
    storage_backend: "local".to_string(),
    is_public: false,
    download_count: 0,
    created_at: Utc::now(),
    owner_id: "u1".to_string(),
  }
}
