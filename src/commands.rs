//! Command-line surface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sheaf-offline")]
#[command(about = "Keep sheaf documents and reading progress usable offline")]
#[command(version)]
pub struct Cli {
  /// Path to config file (default: $XDG_CONFIG_HOME/sheaf-offline/config.yaml)
  #[arg(short, long, global = true)]
  pub config: Option<PathBuf>,

  /// Treat the server as unreachable for this invocation
  #[arg(long, global = true)]
  pub offline: bool,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
  /// Download a document for offline reading
  Save { id: String },
  /// Drop a document from the offline cache
  #[command(alias = "rm")]
  Remove { id: String },
  /// List cached documents, most recently saved first
  #[command(alias = "ls")]
  List {
    /// Only documents whose name contains this text
    #[arg(short, long)]
    search: Option<String>,
  },
  /// Show how much is cached
  Usage,
  /// Write a document's content to a file, from the server or the cache
  Read {
    id: String,
    #[arg(short, long)]
    out: PathBuf,
  },
  /// Record a reading position
  Progress { id: String, page: u32, total: u32 },
  /// Update cached metadata from the server
  Refresh { id: String },
  /// Show queued progress updates
  Pending,
  /// Show queued updates the server keeps rejecting
  Parked,
  /// Drop the queued update for a document
  Discard { id: String },
  /// Replay queued updates now
  Sync,
  /// Show connectivity and queue status
  Status,
  /// Stay running: sync on reconnect and report status changes
  Watch,
}

impl Command {
  /// Commands that may start a reconciliation pass on their own.
  pub fn runs_coordinator(&self) -> bool {
    matches!(self, Self::Watch)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_progress() {
    let cli = Cli::try_parse_from(["sheaf-offline", "progress", "d1", "12", "42"]).unwrap();
    assert_eq!(
      cli.command,
      Command::Progress {
        id: "d1".into(),
        page: 12,
        total: 42
      }
    );
    assert!(!cli.offline);
  }

  #[test]
  fn test_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from(["sheaf-offline", "sync", "--offline", "-c", "x.yaml"]).unwrap();
    assert!(cli.offline);
    assert_eq!(cli.config, Some(PathBuf::from("x.yaml")));
  }

  #[test]
  fn test_alias() {
    let cli = Cli::try_parse_from(["sheaf-offline", "ls", "--search", "dune"]).unwrap();
    assert_eq!(
      cli.command,
      Command::List {
        search: Some("dune".into())
      }
    );
  }

  #[test]
  fn test_rejects_non_numeric_page() {
    assert!(Cli::try_parse_from(["sheaf-offline", "progress", "d1", "ten", "42"]).is_err());
  }

  #[test]
  fn test_only_watch_runs_coordinator() {
    assert!(Command::Watch.runs_coordinator());
    assert!(!Command::Sync.runs_coordinator());
  }
}
