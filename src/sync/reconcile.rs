//! Replays the pending-mutation queue against the remote service.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{LocalStore, MutationQueue};
use crate::error::{Result, SyncError};
use crate::remote::RemoteService;

/// One entry that did not make it to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
  pub entity_id: String,
  pub error: SyncError,
  /// The entry hit the rejection cap during this pass
  pub parked: bool,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassResult {
  pub synced: usize,
  pub failed: usize,
  pub failures: Vec<EntryFailure>,
}

impl PassResult {
  pub fn is_empty(&self) -> bool {
    self.synced == 0 && self.failed == 0
  }

  /// Entries parked by this pass.
  pub fn parked(&self) -> usize {
    self.failures.iter().filter(|f| f.parked).count()
  }

  pub fn reasons(&self) -> Vec<String> {
    self
      .failures
      .iter()
      .map(|f| format!("{}: {}", f.entity_id, f.error))
      .collect()
  }
}

/// Drains the queue one entry at a time with continue-on-failure semantics.
pub struct Reconciler<S: LocalStore, R: RemoteService> {
  store: Arc<S>,
  queue: Arc<MutationQueue<S>>,
  remote: Arc<R>,
}

impl<S: LocalStore, R: RemoteService> Reconciler<S, R> {
  pub fn new(store: Arc<S>, queue: Arc<MutationQueue<S>>, remote: Arc<R>) -> Self {
    Self {
      store,
      queue,
      remote,
    }
  }

  pub fn in_progress(&self) -> bool {
    self.queue.is_replaying()
  }

  /// Run one pass over a snapshot of the queue.
  ///
  /// Returns an empty result without touching the network when another pass
  /// is running or the queue is empty. Entries queued while the pass runs are
  /// left for the next one, and snapshot entries replaced or discarded in the
  /// meantime are skipped. Only storage failures are returned as errors;
  /// per-entry remote failures are counted in the result.
  pub async fn run_pass(&self) -> Result<PassResult> {
    Ok(self.try_run_pass().await?.unwrap_or_default())
  }

  /// Like [`Reconciler::run_pass`], but `None` when refused because another
  /// pass is in flight.
  pub async fn try_run_pass(&self) -> Result<Option<PassResult>> {
    // Check-and-set happens before the first await point.
    let Some(_guard) = self.queue.begin_replay() else {
      debug!("reconciliation already in progress, skipping");
      return Ok(None);
    };

    let snapshot = self.queue.pending()?;
    if snapshot.is_empty() {
      return Ok(Some(PassResult::default()));
    }

    info!(entries = snapshot.len(), "starting reconciliation pass");

    let mut synced = Vec::new();
    let mut rejected = Vec::new();
    let mut failures = Vec::new();

    for mutation in &snapshot {
      // A newer state superseded this one while earlier entries were on the wire
      if !self.store.mutation_exists(mutation.seq)? {
        debug!(entity_id = %mutation.entity_id, seq = mutation.seq, "superseded, skipping");
        continue;
      }

      match self
        .remote
        .write_progress(&mutation.entity_id, mutation.state)
        .await
      {
        Ok(_) => {
          debug!(entity_id = %mutation.entity_id, seq = mutation.seq, "replayed");
          synced.push(mutation.seq);
        }
        Err(error) => {
          warn!(entity_id = %mutation.entity_id, %error, "replay failed, leaving queued");
          if error.is_rejection() {
            rejected.push((mutation.seq, failures.len()));
          }
          failures.push(EntryFailure {
            entity_id: mutation.entity_id.clone(),
            error,
            parked: false,
          });
        }
      }
    }

    // Acknowledged entries go first so a storage error below cannot cause
    // them to be replayed needlessly.
    self.store.remove_mutations(&synced)?;

    for (seq, index) in rejected {
      if let Some(attempts) = self.store.record_rejection(seq)? {
        if attempts >= self.queue.max_rejections() {
          warn!(
            entity_id = %failures[index].entity_id,
            attempts,
            "server keeps rejecting entry, parking it"
          );
          failures[index].parked = true;
        }
      }
    }

    let result = PassResult {
      synced: synced.len(),
      failed: failures.len(),
      failures,
    };
    info!(
      synced = result.synced,
      failed = result.failed,
      "reconciliation pass finished"
    );
    Ok(Some(result))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStore;
  use crate::remote::fake::{FakeRemote, Reply};
  use crate::remote::ProgressState;

  struct Fixture {
    store: Arc<SqliteStore>,
    queue: Arc<MutationQueue<SqliteStore>>,
    remote: Arc<FakeRemote>,
    reconciler: Reconciler<SqliteStore, FakeRemote>,
  }

  fn fixture(remote: FakeRemote) -> Fixture {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let queue = Arc::new(MutationQueue::new(Arc::clone(&store)).with_max_rejections(2));
    let remote = Arc::new(remote);
    let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&queue), Arc::clone(&remote));
    Fixture {
      store,
      queue,
      remote,
      reconciler,
    }
  }

  #[tokio::test]
  async fn test_empty_queue_makes_no_calls() {
    let f = fixture(FakeRemote::new());
    let result = f.reconciler.run_pass().await.unwrap();
    assert!(result.is_empty());
    assert!(f.remote.writes().is_empty());

    // Again, still nothing
    assert!(f.reconciler.run_pass().await.unwrap().is_empty());
    assert!(f.remote.writes().is_empty());
  }

  #[tokio::test]
  async fn test_partial_failure_keeps_only_failed_entry() {
    let f = fixture(FakeRemote::new());
    f.queue.record_state_change("e1", ProgressState::new(1, 10)).unwrap();
    f.queue.record_state_change("e2", ProgressState::new(2, 10)).unwrap();
    f.queue.record_state_change("e3", ProgressState::new(3, 10)).unwrap();
    f.remote.reply("e2", Reply::Reject(409));

    let result = f.reconciler.run_pass().await.unwrap();
    assert_eq!(result.synced, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.failures[0].entity_id, "e2");
    assert_eq!(result.reasons().len(), 1);

    let left = f.queue.pending().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].entity_id, "e2");
    assert_eq!(f.remote.writes().len(), 3);
  }

  #[tokio::test]
  async fn test_unreachable_entries_never_park() {
    let f = fixture(FakeRemote::new());
    f.queue.record_state_change("e1", ProgressState::new(1, 10)).unwrap();
    f.remote.reply("e1", Reply::Unreachable);

    for _ in 0..5 {
      let result = f.reconciler.run_pass().await.unwrap();
      assert_eq!(result.failed, 1);
      assert_eq!(result.parked(), 0);
    }
    assert_eq!(f.queue.pending_count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_repeated_rejection_parks_entry() {
    let f = fixture(FakeRemote::new());
    f.queue.record_state_change("gone", ProgressState::new(1, 10)).unwrap();
    f.remote.reply("gone", Reply::Reject(404));

    let first = f.reconciler.run_pass().await.unwrap();
    assert_eq!(first.parked(), 0);
    let second = f.reconciler.run_pass().await.unwrap();
    assert_eq!(second.parked(), 1);

    // Parked entries are skipped entirely
    let third = f.reconciler.run_pass().await.unwrap();
    assert!(third.is_empty());
    assert_eq!(f.remote.writes().len(), 2);
    assert_eq!(f.queue.parked().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_overlapping_pass_is_refused() {
    let f = fixture(FakeRemote::held());
    f.queue.record_state_change("e1", ProgressState::new(1, 10)).unwrap();

    let (first, second) = tokio::join!(f.reconciler.run_pass(), async {
      f.remote.entered().await;
      assert!(f.reconciler.in_progress());
      let second = f.reconciler.run_pass().await;
      f.remote.release(1);
      second
    });

    assert_eq!(first.unwrap().synced, 1);
    assert!(second.unwrap().is_empty());
    assert_eq!(f.remote.writes().len(), 1);
    assert!(!f.reconciler.in_progress());
  }

  #[tokio::test]
  async fn test_entry_replaced_mid_pass_is_not_replayed() {
    let f = fixture(FakeRemote::held());
    f.queue.record_state_change("a", ProgressState::new(1, 10)).unwrap();
    f.queue.record_state_change("d1", ProgressState::new(3, 42)).unwrap();

    let (result, _) = tokio::join!(f.reconciler.run_pass(), async {
      f.remote.entered().await;
      // d1 moves on while "a" is still on the wire
      f.queue.record_state_change("d1", ProgressState::new(9, 42)).unwrap();
      f.remote.release(2);
    });

    let result = result.unwrap();
    assert_eq!(result.synced, 1);
    assert_eq!(result.failed, 0);
    assert_eq!(f.remote.writes(), vec![("a".to_string(), ProgressState::new(1, 10))]);
    let left = f.queue.pending().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].state, ProgressState::new(9, 42));
  }

  #[tokio::test]
  async fn test_storage_failure_after_replay_is_returned() {
    let f = fixture(FakeRemote::new());
    f.queue.record_state_change("e1", ProgressState::new(1, 10)).unwrap();
    f.store.execute_raw(
      "CREATE TRIGGER queue_locked BEFORE DELETE ON pending_mutations
       BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
    );

    let err = f.reconciler.run_pass().await.unwrap_err();
    assert!(matches!(err, SyncError::StorageUnavailable(_)));
    assert_eq!(f.remote.writes().len(), 1);
    // Still queued, and the gate is open again
    assert_eq!(f.queue.pending_count().unwrap(), 1);
    assert!(!f.reconciler.in_progress());
  }

  #[tokio::test]
  async fn test_state_queued_mid_pass_survives() {
    let f = fixture(FakeRemote::held());
    f.queue.record_state_change("e1", ProgressState::new(1, 10)).unwrap();

    let (result, _) = tokio::join!(f.reconciler.run_pass(), async {
      f.remote.entered().await;
      // A newer position arrives while the old one is on the wire
      f.queue.record_state_change("e1", ProgressState::new(2, 10)).unwrap();
      f.remote.release(1);
    });

    assert_eq!(result.unwrap().synced, 1);
    let left = f.queue.pending().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].state, ProgressState::new(2, 10));
    assert!(f.store.list_mutations().count() == 1);
  }
}
