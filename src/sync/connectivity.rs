//! Online/offline tracking and reconciliation timing.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::{LocalStore, MutationQueue};
use crate::error::Result;
use crate::remote::RemoteService;

use super::reconcile::{PassResult, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

impl Connectivity {
  pub fn is_online(self) -> bool {
    self == Self::Online
  }
}

impl std::fmt::Display for Connectivity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Online => write!(f, "online"),
      Self::Offline => write!(f, "offline"),
    }
  }
}

/// Aggregate status published to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
  pub connectivity: Connectivity,
  /// Queue entries eligible for replay
  pub pending: usize,
  /// Queue entries the server kept rejecting
  pub parked: usize,
  pub in_progress: bool,
  /// Outcome of the most recent pass that actually ran
  pub last_result: Option<PassResult>,
}

impl SyncStatus {
  pub fn new(connectivity: Connectivity) -> Self {
    Self {
      connectivity,
      pending: 0,
      parked: 0,
      in_progress: false,
      last_result: None,
    }
  }
}

/// Owns the connectivity state and decides when reconciliation happens.
///
/// An offline→online transition triggers one pass. The reconnect latch is
/// cleared on that edge and set once a triggered pass has actually run, so
/// further "online" signals during the same online period do nothing, while
/// a triggered attempt that was refused (another pass in flight) is retried
/// on the next signal.
pub struct Coordinator<S: LocalStore, R: RemoteService> {
  queue: Arc<MutationQueue<S>>,
  reconciler: Arc<Reconciler<S, R>>,
  remote: Arc<R>,
  status: watch::Sender<SyncStatus>,
  reconnect_latch: AtomicBool,
  poll_interval: Duration,
  probe_interval: Duration,
}

impl<S: LocalStore, R: RemoteService> Coordinator<S, R> {
  pub fn new(
    queue: Arc<MutationQueue<S>>,
    reconciler: Arc<Reconciler<S, R>>,
    remote: Arc<R>,
    initial: Connectivity,
  ) -> Self {
    let (status, _) = watch::channel(SyncStatus::new(initial));
    Self {
      queue,
      reconciler,
      remote,
      status,
      // Starting online is not an edge
      reconnect_latch: AtomicBool::new(initial.is_online()),
      poll_interval: Duration::from_secs(5),
      probe_interval: Duration::from_secs(15),
    }
  }

  pub fn with_intervals(mut self, poll_interval: Duration, probe_interval: Duration) -> Self {
    self.poll_interval = poll_interval;
    self.probe_interval = probe_interval;
    self
  }

  pub fn connectivity(&self) -> Connectivity {
    self.status.borrow().connectivity
  }

  /// Pending count as of the last refresh.
  pub fn pending_count(&self) -> usize {
    self.status.borrow().pending
  }

  pub fn sync_in_progress(&self) -> bool {
    self.reconciler.in_progress()
  }

  pub fn status(&self) -> SyncStatus {
    self.status.borrow().clone()
  }

  /// Live status updates.
  pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
    self.status.subscribe()
  }

  /// Feed a reachability signal. Returns the result of the pass it
  /// triggered, if any.
  pub async fn set_connectivity(&self, connectivity: Connectivity) -> Result<Option<PassResult>> {
    let changed = self.status.send_if_modified(|s| {
      if s.connectivity == connectivity {
        false
      } else {
        s.connectivity = connectivity;
        true
      }
    });

    match connectivity {
      Connectivity::Offline => {
        if changed {
          warn!("went offline, progress will be queued");
        }
        Ok(None)
      }
      Connectivity::Online => {
        if changed {
          info!(pending = self.pending_count(), "back online");
          self.reconnect_latch.store(false, Ordering::Release);
        }
        if self.reconnect_latch.load(Ordering::Acquire) {
          return Ok(None);
        }

        let ran = self.run_pass().await?;
        if ran.is_some() {
          self.reconnect_latch.store(true, Ordering::Release);
        }
        Ok(ran)
      }
    }
  }

  /// Force a pass. Offline or already syncing yields an empty result.
  pub async fn sync_now(&self) -> Result<PassResult> {
    if !self.connectivity().is_online() {
      debug!("offline, not syncing");
      return Ok(PassResult::default());
    }
    Ok(self.run_pass().await?.unwrap_or_default())
  }

  async fn run_pass(&self) -> Result<Option<PassResult>> {
    if self.reconciler.in_progress() {
      return Ok(None);
    }

    self.status.send_modify(|s| s.in_progress = true);
    let outcome = self.reconciler.try_run_pass().await;
    self.status.send_modify(|s| {
      s.in_progress = self.reconciler.in_progress();
      if let Ok(Some(result)) = &outcome {
        s.last_result = Some(result.clone());
      }
    });

    self.refresh_pending()?;
    outcome
  }

  /// Recompute queue depth for display. Reads only.
  pub fn refresh_pending(&self) -> Result<usize> {
    let pending = self.queue.pending_count()?;
    let parked = self.queue.parked()?.len();
    self.status.send_if_modified(|s| {
      let changed = s.pending != pending || s.parked != parked;
      s.pending = pending;
      s.parked = parked;
      changed
    });
    Ok(pending)
  }

  async fn probe(&self) -> Connectivity {
    match self.remote.probe().await {
      Ok(()) => Connectivity::Online,
      Err(e) => {
        debug!(error = %e, "reachability probe failed");
        Connectivity::Offline
      }
    }
  }

  /// Drive the timers until `shutdown` resolves: queue depth is refreshed
  /// every poll interval and reachability probed every probe interval.
  pub async fn run<F: Future<Output = ()>>(&self, shutdown: F) {
    tokio::pin!(shutdown);

    let mut poll = tokio::time::interval(self.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut probe = tokio::time::interval(self.probe_interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = &mut shutdown => break,
        _ = poll.tick() => {
          if let Err(e) = self.refresh_pending() {
            warn!(error = %e, "failed to read pending queue");
          }
        }
        _ = probe.tick() => {
          let connectivity = self.probe().await;
          if let Err(e) = self.set_connectivity(connectivity).await {
            warn!(error = %e, "reconciliation failed");
          }
        }
      }
    }

    debug!("coordinator stopped");
  }
}
