//! Offline cache façade: the single entry point for the reading surface.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::remote::{DocumentMeta, ProgressAck, ProgressState, RemoteService};
use crate::sync::{Connectivity, SyncStatus};

use super::queue::MutationQueue;
use super::storage::LocalStore;
use super::types::{now_millis, CacheSource, CachedDocument, OpenedDocument, UsageSummary};

/// Where a progress update ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressRoute {
  /// Accepted by the server directly
  Direct,
  /// Queued for the next reconciliation pass
  Queued,
}

/// Next step for a progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteStep {
  AttemptDirect,
  Done,
  Enqueue,
}

/// Decide the next step from connectivity, whether a pass is draining the
/// queue, and the direct attempt so far. Any failed direct attempt falls back
/// to the queue, and so does any write made while a pass is in flight.
pub(crate) fn next_write_step<T>(
  connectivity: Connectivity,
  replaying: bool,
  attempt: Option<&Result<T>>,
) -> WriteStep {
  match attempt {
    Some(Ok(_)) => WriteStep::Done,
    Some(Err(_)) => WriteStep::Enqueue,
    None if connectivity.is_online() && !replaying => WriteStep::AttemptDirect,
    None => WriteStep::Enqueue,
  }
}

/// Composes the local store, the mutation queue and the remote service.
pub struct OfflineCache<S: LocalStore, R: RemoteService> {
  store: Arc<S>,
  queue: Arc<MutationQueue<S>>,
  remote: Arc<R>,
  status: watch::Receiver<SyncStatus>,
}

impl<S: LocalStore, R: RemoteService> OfflineCache<S, R> {
  /// `status` is the coordinator's status feed; it supplies the current
  /// connectivity for progress routing.
  pub fn new(
    store: Arc<S>,
    queue: Arc<MutationQueue<S>>,
    remote: Arc<R>,
    status: watch::Receiver<SyncStatus>,
  ) -> Self {
    Self {
      store,
      queue,
      remote,
      status,
    }
  }

  fn connectivity(&self) -> Connectivity {
    self.status.borrow().connectivity
  }

  pub fn is_cached(&self, id: &str) -> Result<bool> {
    self.store.contains_document(id)
  }

  /// Download a document's content and store it with its metadata.
  /// Nothing is written if the download fails.
  pub async fn save_for_offline(&self, document: DocumentMeta) -> Result<CachedDocument> {
    let content = self.remote.fetch_binary(&document.id).await?;
    let cached = CachedDocument::new(document, now_millis());
    self.store.put_document(&cached, &content)?;

    info!(
      document_id = %cached.id(),
      bytes = content.len(),
      "saved document for offline use"
    );
    Ok(cached)
  }

  /// Fetch metadata and content by id, then cache them.
  pub async fn save_by_id(&self, id: &str) -> Result<CachedDocument> {
    let meta = self.remote.fetch_document_metadata(id).await?;
    self.save_for_offline(meta).await
  }

  pub fn remove_from_cache(&self, id: &str) -> Result<()> {
    self.store.remove_document(id)?;
    debug!(document_id = %id, "removed from offline cache");
    Ok(())
  }

  pub fn read_cached_payload(&self, id: &str) -> Result<Vec<u8>> {
    self
      .store
      .get_document(id)?
      .map(|(_, payload)| payload.data)
      .ok_or_else(|| SyncError::NotFound(id.to_string()))
  }

  pub fn cached_metadata(&self, id: &str) -> Result<CachedDocument> {
    self
      .store
      .get_metadata(id)?
      .ok_or_else(|| SyncError::NotFound(id.to_string()))
  }

  /// Cached documents, most recently saved first.
  pub fn list_cached(&self) -> Result<Vec<CachedDocument>> {
    self.store.list_documents().collect()
  }

  pub fn cached_ids(&self) -> Result<Vec<String>> {
    self.store.document_ids()
  }

  /// Cached documents whose original name contains `query`, ignoring case.
  pub fn search_cached(&self, query: &str) -> Result<Vec<CachedDocument>> {
    let needle = query.to_lowercase();
    self
      .store
      .list_documents()
      .filter(|doc| {
        doc
          .as_ref()
          .map_or(true, |d| d.meta.original_name.to_lowercase().contains(&needle))
      })
      .collect()
  }

  pub fn usage_summary(&self) -> Result<UsageSummary> {
    self.store.usage_summary()
  }

  /// Pull fresh display fields for a cached document from the server.
  pub async fn refresh_metadata(&self, id: &str) -> Result<CachedDocument> {
    if !self.store.contains_document(id)? {
      return Err(SyncError::NotFound(id.to_string()));
    }

    let meta = self.remote.fetch_document_metadata(id).await?;
    if !self.store.update_metadata(&meta)? {
      // Removed while the request was in flight
      return Err(SyncError::NotFound(id.to_string()));
    }
    self.cached_metadata(id)
  }

  /// Load a document for reading: from the server when online, otherwise
  /// (or when the server cannot be reached) from the offline copy.
  ///
  /// The reading position to resume from is the locally queued one when
  /// there is one, since it has not reached the server yet; otherwise the
  /// server's last known position when online.
  pub async fn open_document(&self, id: &str) -> Result<OpenedDocument> {
    let queued = self.queue.queued_state(id)?;

    if self.connectivity().is_online() {
      match self.fetch_remote(id).await {
        Ok(mut opened) => {
          opened.progress = match queued {
            Some(state) => Some(state),
            None => self.remote_progress(id).await,
          };
          return Ok(opened);
        }
        Err(e) if e.is_transient() => {
          warn!(document_id = %id, error = %e, "server unreachable, trying offline copy");
        }
        Err(e) => return Err(e),
      }
    }

    let (doc, payload) = self
      .store
      .get_document(id)?
      .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
    Ok(OpenedDocument {
      meta: doc.meta,
      content: payload.data,
      source: CacheSource::Offline,
      cached_at: Some(doc.cached_at),
      progress: queued,
    })
  }

  /// Server-side position; a failure here never blocks opening the document.
  async fn remote_progress(&self, id: &str) -> Option<ProgressState> {
    match self.remote.fetch_progress(id).await {
      Ok(ack) => ack.map(|ack| ack.state),
      Err(e) => {
        warn!(document_id = %id, error = %e, "could not load reading position");
        None
      }
    }
  }

  async fn fetch_remote(&self, id: &str) -> Result<OpenedDocument> {
    let meta = self.remote.fetch_document_metadata(id).await?;
    let content = self.remote.fetch_binary(id).await?;
    Ok(OpenedDocument {
      meta,
      content,
      source: CacheSource::Network,
      cached_at: None,
      progress: None,
    })
  }

  /// Record a reading position. Written straight to the server when online;
  /// queued when offline, while a pass is draining the queue, or when the
  /// direct write fails. Storage failures while queueing are returned.
  pub async fn record_progress(&self, entity_id: &str, state: ProgressState) -> Result<ProgressRoute> {
    let mark = self.queue.replay_mark();
    let mut attempt: Option<Result<ProgressAck>> = None;

    loop {
      match next_write_step(self.connectivity(), mark.replaying, attempt.as_ref()) {
        WriteStep::AttemptDirect => {
          attempt = Some(self.remote.write_progress(entity_id, state).await);
        }
        WriteStep::Done => {
          if self.queue.replay_overlapped(mark) {
            // A pass may have sent an older state after this one landed;
            // queue this one so it is the last to reach the server.
            self.queue.record_state_change(entity_id, state)?;
            debug!(entity_id, "pass overlapped direct write, queued again");
          } else if self.queue.discard(entity_id)? {
            // Anything still queued is older than what the server now holds
            debug!(entity_id, "dropped superseded queued progress");
          }
          return Ok(ProgressRoute::Direct);
        }
        WriteStep::Enqueue => {
          if let Some(Err(e)) = &attempt {
            warn!(entity_id, error = %e, "direct progress write failed, queueing");
          }
          self.queue.record_state_change(entity_id, state)?;
          return Ok(ProgressRoute::Queued);
        }
      }
    }
  }
}

impl<S: LocalStore, R: RemoteService> Clone for OfflineCache<S, R> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      queue: Arc::clone(&self.queue),
      remote: Arc::clone(&self.remote),
      status: self.status.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStore;
  use crate::remote::fake::{document, FakeRemote, Reply};
  use crate::sync::{Coordinator, Reconciler};

  struct Fixture {
    store: Arc<SqliteStore>,
    cache: OfflineCache<SqliteStore, FakeRemote>,
    queue: Arc<MutationQueue<SqliteStore>>,
    remote: Arc<FakeRemote>,
    status: watch::Sender<SyncStatus>,
  }

  fn fixture(connectivity: Connectivity) -> Fixture {
    fixture_with(FakeRemote::new(), connectivity)
  }

  fn fixture_with(remote: FakeRemote, connectivity: Connectivity) -> Fixture {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let queue = Arc::new(MutationQueue::new(Arc::clone(&store)));
    let remote = Arc::new(remote);
    let (status, rx) = watch::channel(SyncStatus::new(connectivity));
    let cache = OfflineCache::new(
      Arc::clone(&store),
      Arc::clone(&queue),
      Arc::clone(&remote),
      rx,
    );
    Fixture {
      store,
      cache,
      queue,
      remote,
      status,
    }
  }

  #[test]
  fn test_write_policy() {
    let ok: Result<()> = Ok(());
    let failed: Result<()> = Err(SyncError::RemoteUnreachable("reset".into()));
    let rejected: Result<()> = Err(SyncError::Rejected {
      status: 403,
      message: "no".into(),
    });

    assert_eq!(
      next_write_step::<()>(Connectivity::Online, false, None),
      WriteStep::AttemptDirect
    );
    assert_eq!(
      next_write_step::<()>(Connectivity::Online, true, None),
      WriteStep::Enqueue
    );
    assert_eq!(
      next_write_step::<()>(Connectivity::Offline, false, None),
      WriteStep::Enqueue
    );
    assert_eq!(
      next_write_step(Connectivity::Online, false, Some(&ok)),
      WriteStep::Done
    );
    assert_eq!(
      next_write_step(Connectivity::Online, false, Some(&failed)),
      WriteStep::Enqueue
    );
    assert_eq!(
      next_write_step(Connectivity::Online, false, Some(&rejected)),
      WriteStep::Enqueue
    );
  }

  #[tokio::test]
  async fn test_save_then_remove_keeps_pair_together() {
    let f = fixture(Connectivity::Online);
    let meta = document("d1", "Moby Dick.pdf", 500_000);
    f.remote.serve(meta.clone(), b"%PDF-1.7 whale");

    f.cache.save_for_offline(meta).await.unwrap();
    assert!(f.cache.is_cached("d1").unwrap());
    assert_eq!(f.cache.read_cached_payload("d1").unwrap(), b"%PDF-1.7 whale");

    f.cache.remove_from_cache("d1").unwrap();
    assert!(!f.cache.is_cached("d1").unwrap());
    assert!(matches!(
      f.cache.read_cached_payload("d1"),
      Err(SyncError::NotFound(_))
    ));
  }

  #[tokio::test]
  async fn test_failed_download_writes_nothing() {
    let f = fixture(Connectivity::Online);
    let meta = document("d1", "x", 10);
    f.remote.set_down(true);

    let err = f.cache.save_for_offline(meta).await.unwrap_err();
    assert!(err.is_transient());
    assert!(!f.cache.is_cached("d1").unwrap());
    assert_eq!(f.cache.usage_summary().unwrap(), UsageSummary::default());
  }

  #[tokio::test]
  async fn test_progress_goes_direct_when_online() {
    let f = fixture(Connectivity::Online);
    let route = f
      .cache
      .record_progress("d1", ProgressState::new(5, 42))
      .await
      .unwrap();
    assert_eq!(route, ProgressRoute::Direct);
    assert_eq!(f.queue.pending_count().unwrap(), 0);
    assert_eq!(f.remote.writes().len(), 1);
  }

  #[tokio::test]
  async fn test_progress_queued_when_offline_without_network_call() {
    let f = fixture(Connectivity::Offline);
    let route = f
      .cache
      .record_progress("d1", ProgressState::new(5, 42))
      .await
      .unwrap();
    assert_eq!(route, ProgressRoute::Queued);
    assert!(f.remote.writes().is_empty());
    assert_eq!(f.queue.pending_count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_failed_direct_write_falls_back_to_queue() {
    let f = fixture(Connectivity::Online);
    f.remote.reply("d1", Reply::Unreachable);

    let route = f
      .cache
      .record_progress("d1", ProgressState::new(5, 42))
      .await
      .unwrap();
    assert_eq!(route, ProgressRoute::Queued);
    assert_eq!(f.queue.pending().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_direct_success_supersedes_queued_state() {
    let f = fixture(Connectivity::Offline);
    f.cache
      .record_progress("d1", ProgressState::new(3, 42))
      .await
      .unwrap();

    f.status.send_modify(|s| s.connectivity = Connectivity::Online);
    f.cache
      .record_progress("d1", ProgressState::new(9, 42))
      .await
      .unwrap();
    assert_eq!(f.queue.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_progress_during_pass_is_not_overwritten() {
    let f = fixture_with(FakeRemote::held(), Connectivity::Online);
    let reconciler = Reconciler::new(
      Arc::clone(&f.store),
      Arc::clone(&f.queue),
      Arc::clone(&f.remote),
    );
    f.queue.record_state_change("a", ProgressState::new(1, 10)).unwrap();
    f.queue.record_state_change("d1", ProgressState::new(3, 42)).unwrap();

    let (first, route) = tokio::join!(reconciler.run_pass(), async {
      f.remote.entered().await;
      let route = f
        .cache
        .record_progress("d1", ProgressState::new(9, 42))
        .await;
      f.remote.release(3);
      route
    });
    assert_eq!(route.unwrap(), ProgressRoute::Queued);
    assert_eq!(first.unwrap().synced, 1);

    // The stale 3/42 was never sent; the next pass delivers 9/42
    let second = reconciler.run_pass().await.unwrap();
    assert_eq!(second.synced, 1);
    assert_eq!(
      f.remote.writes(),
      vec![
        ("a".to_string(), ProgressState::new(1, 10)),
        ("d1".to_string(), ProgressState::new(9, 42)),
      ]
    );
    let server = f.remote.fetch_progress("d1").await.unwrap().unwrap();
    assert_eq!(server.state, ProgressState::new(9, 42));
    assert_eq!(f.queue.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_pass_overlapping_direct_write_requeues_it() {
    let f = fixture_with(FakeRemote::held(), Connectivity::Online);

    let (route, _) = tokio::join!(
      f.cache.record_progress("d1", ProgressState::new(9, 42)),
      async {
        f.remote.entered().await;
        // A pass starts and ends while the direct write is on the wire
        let pass = f.queue.begin_replay().unwrap();
        drop(pass);
        f.remote.release(1);
      }
    );

    assert_eq!(route.unwrap(), ProgressRoute::Direct);
    let left = f.queue.pending().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].state, ProgressState::new(9, 42));
  }

  #[tokio::test]
  async fn test_offline_progress_propagates_storage_failure() {
    let f = fixture(Connectivity::Offline);
    f.store.execute_raw(
      "CREATE TRIGGER queue_full BEFORE INSERT ON pending_mutations
       BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
    );

    let err = f
      .cache
      .record_progress("d1", ProgressState::new(5, 42))
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::StorageUnavailable(_)));
    assert!(f.remote.writes().is_empty());
  }

  #[tokio::test]
  async fn test_open_document_restores_reading_position() {
    let f = fixture(Connectivity::Online);
    let meta = document("d1", "Book.pdf", 3);
    f.remote.serve(meta.clone(), b"abc");
    f.cache.save_for_offline(meta).await.unwrap();

    let fresh = f.cache.open_document("d1").await.unwrap();
    assert_eq!(fresh.progress, None);

    // Online: the server's last position
    f.cache
      .record_progress("d1", ProgressState::new(7, 42))
      .await
      .unwrap();
    let online = f.cache.open_document("d1").await.unwrap();
    assert_eq!(online.source, CacheSource::Network);
    assert_eq!(online.progress, Some(ProgressState::new(7, 42)));

    // Offline: the queued position, which the server has not seen yet
    f.status.send_modify(|s| s.connectivity = Connectivity::Offline);
    f.cache
      .record_progress("d1", ProgressState::new(8, 42))
      .await
      .unwrap();
    let offline = f.cache.open_document("d1").await.unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.progress, Some(ProgressState::new(8, 42)));

    // Back online with the update still queued: the local one wins
    f.status.send_modify(|s| s.connectivity = Connectivity::Online);
    let resumed = f.cache.open_document("d1").await.unwrap();
    assert_eq!(resumed.progress, Some(ProgressState::new(8, 42)));
  }

  #[tokio::test]
  async fn test_open_document_prefers_network_then_cache() {
    let f = fixture(Connectivity::Online);
    let meta = document("d1", "Book.pdf", 3);
    f.remote.serve(meta.clone(), b"abc");
    f.cache.save_for_offline(meta).await.unwrap();

    let online = f.cache.open_document("d1").await.unwrap();
    assert_eq!(online.source, CacheSource::Network);

    // Server gone while we still think we're online
    f.remote.set_down(true);
    let fallback = f.cache.open_document("d1").await.unwrap();
    assert_eq!(fallback.source, CacheSource::Offline);
    assert_eq!(fallback.content, b"abc");

    f.status.send_modify(|s| s.connectivity = Connectivity::Offline);
    assert!(matches!(
      f.cache.open_document("other").await,
      Err(SyncError::NotFound(_))
    ));
  }

  #[tokio::test]
  async fn test_refresh_metadata_updates_display_fields() {
    let f = fixture(Connectivity::Online);
    let meta = document("d1", "Draft.pdf", 3);
    f.remote.serve(meta.clone(), b"abc");
    let saved = f.cache.save_for_offline(meta.clone()).await.unwrap();

    let mut renamed = meta;
    renamed.original_name = "Final.pdf".into();
    renamed.download_count = 12;
    f.remote.serve(renamed, b"abc");

    let refreshed = f.cache.refresh_metadata("d1").await.unwrap();
    assert_eq!(refreshed.meta.original_name, "Final.pdf");
    assert_eq!(refreshed.meta.download_count, 12);
    assert_eq!(refreshed.cached_at, saved.cached_at);

    assert!(matches!(
      f.cache.refresh_metadata("missing").await,
      Err(SyncError::NotFound(_))
    ));
  }

  #[tokio::test]
  async fn test_search_and_ids() {
    let f = fixture(Connectivity::Online);
    for (id, name) in [("a", "Rust in Action.pdf"), ("b", "Dune.pdf")] {
      let meta = document(id, name, 1);
      f.remote.serve(meta.clone(), b"x");
      f.cache.save_for_offline(meta).await.unwrap();
    }

    let hits = f.cache.search_cached("rust").unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].meta.id, "a");

    let mut ids = f.cache.cached_ids().unwrap();
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);
  }

  #[tokio::test]
  async fn test_offline_reading_scenario() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let queue = Arc::new(MutationQueue::new(Arc::clone(&store)));
    let remote = Arc::new(FakeRemote::new());
    let reconciler = Arc::new(Reconciler::new(
      Arc::clone(&store),
      Arc::clone(&queue),
      Arc::clone(&remote),
    ));
    let coordinator = Coordinator::new(
      Arc::clone(&queue),
      reconciler,
      Arc::clone(&remote),
      Connectivity::Online,
    );
    let cache = OfflineCache::new(
      Arc::clone(&store),
      Arc::clone(&queue),
      Arc::clone(&remote),
      coordinator.subscribe(),
    );

    let meta = document("D1", "Sheaf.pdf", 500_000);
    remote.serve(meta.clone(), &[7u8; 1024]);
    cache.save_for_offline(meta).await.unwrap();

    coordinator
      .set_connectivity(Connectivity::Offline)
      .await
      .unwrap();
    for page in [10, 11, 12] {
      let route = cache
        .record_progress("D1", ProgressState::new(page, 42))
        .await
        .unwrap();
      assert_eq!(route, ProgressRoute::Queued);
    }
    let queued = queue.pending().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].state, ProgressState::new(12, 42));
    assert!(remote.writes().is_empty());

    let pass = coordinator
      .set_connectivity(Connectivity::Online)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(pass.synced, 1);
    assert_eq!(
      remote.writes(),
      vec![("D1".to_string(), ProgressState::new(12, 42))]
    );
    assert_eq!(queue.pending_count().unwrap(), 0);
    assert_eq!(
      cache.usage_summary().unwrap(),
      UsageSummary {
        document_count: 1,
        total_bytes: 500_000
      }
    );
  }
}
