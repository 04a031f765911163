//! Pending-mutation queue policy on top of the local store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::remote::ProgressState;

use super::storage::LocalStore;
use super::types::PendingMutation;

/// Default number of explicit rejections before an entry is parked.
pub const DEFAULT_MAX_REJECTIONS: u32 = 3;

/// Coalescing queue of state changes waiting for the server.
///
/// There is at most one entry per entity. Entries the server has rejected
/// `max_rejections` times are *parked*: kept, but no longer replayed or
/// counted as pending until they are replaced or discarded.
///
/// The queue also owns the replay gate: at most one reconciliation pass
/// drains it at a time, and writers can tell whether a pass overlapped them.
pub struct MutationQueue<S: LocalStore> {
  store: Arc<S>,
  max_rejections: u32,
  replaying: AtomicBool,
  /// Bumped each time a pass starts
  generation: AtomicU64,
}

/// Replay state observed by a writer before it goes to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayMark {
  pub replaying: bool,
  pub generation: u64,
}

/// Held for the length of a pass; reopens the gate on drop.
pub struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl<S: LocalStore> MutationQueue<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self {
      store,
      max_rejections: DEFAULT_MAX_REJECTIONS,
      replaying: AtomicBool::new(false),
      generation: AtomicU64::new(0),
    }
  }

  pub fn with_max_rejections(mut self, max_rejections: u32) -> Self {
    self.max_rejections = max_rejections.max(1);
    self
  }

  pub fn max_rejections(&self) -> u32 {
    self.max_rejections
  }

  /// Close the replay gate. `None` if a pass already holds it.
  pub fn begin_replay(&self) -> Option<ReplayGuard<'_>> {
    self
      .replaying
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()?;
    self.generation.fetch_add(1, Ordering::AcqRel);
    Some(ReplayGuard(&self.replaying))
  }

  pub fn is_replaying(&self) -> bool {
    self.replaying.load(Ordering::Acquire)
  }

  pub fn replay_mark(&self) -> ReplayMark {
    ReplayMark {
      replaying: self.is_replaying(),
      generation: self.generation.load(Ordering::Acquire),
    }
  }

  /// Whether a pass was running at `mark`, is running now, or ran since.
  pub fn replay_overlapped(&self, mark: ReplayMark) -> bool {
    let now = self.replay_mark();
    mark.replaying || now.replaying || now.generation != mark.generation
  }

  /// Queue the latest state for an entity, replacing anything queued for it.
  pub fn record_state_change(&self, entity_id: &str, state: ProgressState) -> Result<()> {
    let queued = self.store.enqueue_mutation(entity_id, state)?;
    debug!(
      entity_id,
      seq = queued.seq,
      page = state.current_page,
      "queued state change"
    );
    Ok(())
  }

  pub fn is_parked(&self, mutation: &PendingMutation) -> bool {
    mutation.attempts >= self.max_rejections
  }

  /// Entries eligible for replay, oldest first.
  pub fn pending(&self) -> Result<Vec<PendingMutation>> {
    self
      .store
      .list_mutations()
      .filter(|m| m.as_ref().map_or(true, |m| !self.is_parked(m)))
      .collect()
  }

  pub fn pending_count(&self) -> Result<usize> {
    Ok(self.pending()?.len())
  }

  pub fn has_pending(&self) -> Result<bool> {
    Ok(self.pending_count()? > 0)
  }

  /// Entries the server kept rejecting.
  pub fn parked(&self) -> Result<Vec<PendingMutation>> {
    self
      .store
      .list_mutations()
      .filter(|m| m.as_ref().map_or(true, |m| self.is_parked(m)))
      .collect()
  }

  /// State queued for an entity, parked or not.
  pub fn queued_state(&self, entity_id: &str) -> Result<Option<ProgressState>> {
    for mutation in self.store.list_mutations() {
      let mutation = mutation?;
      if mutation.entity_id == entity_id {
        return Ok(Some(mutation.state));
      }
    }
    Ok(None)
  }

  /// Drop the queued entry for an entity, parked or not.
  pub fn discard(&self, entity_id: &str) -> Result<bool> {
    self.store.discard_mutation(entity_id)
  }
}
