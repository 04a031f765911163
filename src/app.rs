use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cache::{
  LocalStore, MutationQueue, OfflineCache, PendingMutation, ProgressRoute, SqliteStore,
};
use crate::commands::Command;
use crate::config::{Config, SyncConfig};
use crate::format::{format_age, format_bytes, truncate};
use crate::remote::{HttpRemote, ProgressState, RemoteService};
use crate::sync::{Connectivity, Coordinator, PassResult, Reconciler, SyncStatus};

/// Wired-up engine: one store, one remote, one coordinator.
pub struct App<S: LocalStore, R: RemoteService> {
  store: Arc<S>,
  queue: Arc<MutationQueue<S>>,
  remote: Arc<R>,
  coordinator: Arc<Coordinator<S, R>>,
  cache: OfflineCache<S, R>,
}

impl App<SqliteStore, HttpRemote> {
  /// Open the store from configuration and connect to the configured server.
  pub fn open(config: &Config, initial: Connectivity) -> Result<Self> {
    let store = SqliteStore::open(&config.database_path()?)?;
    let remote = HttpRemote::new(config)?;
    Ok(Self::with_parts(&config.sync, store, remote, initial))
  }

  /// Like [`App::open`], starting from a live reachability check.
  pub async fn connect(config: &Config) -> Result<Self> {
    let remote = HttpRemote::new(config)?;
    let initial = probe_remote(&remote).await;
    let store = SqliteStore::open(&config.database_path()?)?;
    Ok(Self::with_parts(&config.sync, store, remote, initial))
  }
}

async fn probe_remote<R: RemoteService>(remote: &R) -> Connectivity {
  match remote.probe().await {
    Ok(()) => Connectivity::Online,
    Err(e) => {
      info!(error = %e, "server unreachable, working offline");
      Connectivity::Offline
    }
  }
}

impl<S: LocalStore + 'static, R: RemoteService + 'static> App<S, R> {
  pub fn with_parts(sync: &SyncConfig, store: S, remote: R, initial: Connectivity) -> Self {
    let store = Arc::new(store);
    let remote = Arc::new(remote);
    let queue =
      Arc::new(MutationQueue::new(Arc::clone(&store)).with_max_rejections(sync.max_rejections));
    let reconciler = Arc::new(Reconciler::new(
      Arc::clone(&store),
      Arc::clone(&queue),
      Arc::clone(&remote),
    ));
    let coordinator = Arc::new(
      Coordinator::new(Arc::clone(&queue), reconciler, Arc::clone(&remote), initial)
        .with_intervals(sync.poll_interval(), sync.probe_interval()),
    );
    let cache = OfflineCache::new(
      Arc::clone(&store),
      Arc::clone(&queue),
      Arc::clone(&remote),
      coordinator.subscribe(),
    );

    Self {
      store,
      queue,
      remote,
      coordinator,
      cache,
    }
  }

  pub fn cache(&self) -> &OfflineCache<S, R> {
    &self.cache
  }

  pub fn coordinator(&self) -> &Arc<Coordinator<S, R>> {
    &self.coordinator
  }

  /// Ask the server whether it is reachable.
  pub async fn probe(&self) -> Connectivity {
    probe_remote(self.remote.as_ref()).await
  }

  /// Run one command, writing human-readable output to `out`.
  pub async fn execute(&self, command: Command, out: &mut impl Write) -> Result<()> {
    match command {
      Command::Save { id } => {
        let doc = self.cache.save_by_id(&id).await?;
        writeln!(
          out,
          "saved {} ({})",
          doc.meta.original_name,
          format_bytes(doc.meta.size_bytes)
        )?;
      }
      Command::Remove { id } => {
        self.cache.remove_from_cache(&id)?;
        writeln!(out, "removed {}", id)?;
      }
      Command::List { search } => {
        let docs = match search {
          Some(q) => self.cache.search_cached(&q)?,
          None => self.cache.list_cached()?,
        };
        let now = Utc::now();
        for doc in &docs {
          writeln!(
            out,
            "{:<36}  {:<40}  {:>10}  {}",
            doc.meta.id,
            truncate(&doc.meta.original_name, 40),
            format_bytes(doc.meta.size_bytes),
            format_age(doc.cached_at, now)
          )?;
        }
        if docs.is_empty() {
          writeln!(out, "no cached documents")?;
        }
      }
      Command::Usage => {
        let usage = self.cache.usage_summary()?;
        writeln!(
          out,
          "{} documents, {}",
          usage.document_count,
          format_bytes(usage.total_bytes)
        )?;
      }
      Command::Read { id, out: path } => {
        let opened = self.cache.open_document(&id).await?;
        std::fs::write(&path, &opened.content)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
        writeln!(
          out,
          "wrote {} to {} ({:?})",
          opened.meta.original_name,
          path.display(),
          opened.source
        )?;
        if let Some(progress) = opened.progress {
          writeln!(
            out,
            "resume at page {}/{}",
            progress.current_page, progress.total_pages
          )?;
        }
      }
      Command::Progress { id, page, total } => {
        if page > total {
          return Err(eyre!("page {} is past the end ({} pages)", page, total));
        }
        let route = self
          .cache
          .record_progress(&id, ProgressState::new(page, total))
          .await?;
        match route {
          ProgressRoute::Direct => writeln!(out, "saved page {}/{}", page, total)?,
          ProgressRoute::Queued => writeln!(out, "queued page {}/{} for sync", page, total)?,
        }
      }
      Command::Refresh { id } => {
        let doc = self.cache.refresh_metadata(&id).await?;
        writeln!(out, "refreshed {}", doc.meta.original_name)?;
      }
      Command::Pending => {
        let pending = self.queue.pending()?;
        write_mutations(out, &pending)?;
      }
      Command::Parked => {
        let parked = self.queue.parked()?;
        write_mutations(out, &parked)?;
      }
      Command::Discard { id } => {
        if self.queue.discard(&id)? {
          writeln!(out, "discarded queued update for {}", id)?;
        } else {
          writeln!(out, "nothing queued for {}", id)?;
        }
      }
      Command::Sync => {
        let result = self.coordinator.sync_now().await?;
        write_pass(out, &result)?;
      }
      Command::Status => {
        self.coordinator.refresh_pending()?;
        write_status(out, &self.coordinator.status())?;
      }
      Command::Watch => self.watch(out).await?,
    }
    Ok(())
  }

  /// Run the coordinator until Ctrl-C, reporting status changes.
  async fn watch(&self, out: &mut impl Write) -> Result<()> {
    let mut status = self.coordinator.subscribe();
    let mut store_events = self.store.subscribe();

    let coordinator = Arc::clone(&self.coordinator);
    let runner = tokio::spawn(async move {
      coordinator
        .run(async {
          if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
          }
        })
        .await
    });

    writeln!(out, "watching (Ctrl-C to stop)")?;
    loop {
      tokio::select! {
        changed = status.changed() => {
          if changed.is_err() {
            break;
          }
          let snapshot = status.borrow_and_update().clone();
          write_status(out, &snapshot)?;
        }
        event = store_events.recv() => match event {
          Ok(event) => info!(?event, "store changed"),
          Err(RecvError::Lagged(missed)) => warn!(missed, "store notifications lagged"),
          Err(RecvError::Closed) => break,
        },
        _ = tokio::signal::ctrl_c() => break,
      }
      out.flush()?;
    }

    runner.abort();
    Ok(())
  }
}

fn write_mutations(out: &mut impl Write, mutations: &[PendingMutation]) -> Result<()> {
  let now = Utc::now();
  for m in mutations {
    writeln!(
      out,
      "{:<36}  page {}/{}  {}  rejected {}x",
      m.entity_id,
      m.state.current_page,
      m.state.total_pages,
      format_age(m.updated_at, now),
      m.attempts
    )?;
  }
  if mutations.is_empty() {
    writeln!(out, "queue empty")?;
  }
  Ok(())
}

fn write_pass(out: &mut impl Write, result: &PassResult) -> Result<()> {
  writeln!(out, "{} synced, {} failed", result.synced, result.failed)?;
  for reason in result.reasons() {
    writeln!(out, "  {}", reason)?;
  }
  Ok(())
}

fn write_status(out: &mut impl Write, status: &SyncStatus) -> Result<()> {
  write!(
    out,
    "{}: {} pending, {} parked",
    status.connectivity, status.pending, status.parked
  )?;
  if status.in_progress {
    write!(out, ", syncing")?;
  }
  if let Some(last) = &status.last_result {
    write!(out, " (last sync: {} synced, {} failed)", last.synced, last.failed)?;
  }
  writeln!(out)?;
  Ok(())
}
