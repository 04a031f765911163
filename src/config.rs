use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::DEFAULT_MAX_REJECTIONS;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Base URL of the sheaf server (e.g. "https://sheaf.example.com/")
  #[serde(deserialize_with = "deserialize_base_url")]
  pub url: Url,
  /// Per-request timeout; a timed-out replay counts as a failed entry
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// How often the pending count is recomputed
  #[serde(default = "default_poll_interval_secs")]
  pub poll_interval_secs: u64,
  /// How often reachability of the server is checked
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
  /// Explicit rejections before a queued entry is parked
  #[serde(default = "default_max_rejections")]
  pub max_rejections: u32,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      poll_interval_secs: default_poll_interval_secs(),
      probe_interval_secs: default_probe_interval_secs(),
      max_rejections: default_max_rejections(),
    }
  }
}

impl SyncConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs.max(1))
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database file; defaults to $XDG_DATA_HOME/sheaf-offline/offline.db
  pub path: Option<PathBuf>,
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_poll_interval_secs() -> u64 {
  5
}

fn default_probe_interval_secs() -> u64 {
  15
}

fn default_max_rejections() -> u32 {
  DEFAULT_MAX_REJECTIONS
}

/// Parse the server URL, forcing a trailing slash so relative endpoints
/// resolve below any path prefix.
fn deserialize_base_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let mut raw = String::deserialize(deserializer)?;
  if !raw.ends_with('/') {
    raw.push('/');
  }
  Url::parse(&raw).map_err(serde::de::Error::custom)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./sheaf-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/sheaf-offline/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(SyncError::Config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(SyncError::Config(
        "No configuration file found. Create one at ~/.config/sheaf-offline/config.yaml".into(),
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("sheaf-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("sheaf-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      SyncError::Config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::parse(&contents).map_err(|e| match e {
      SyncError::Config(msg) => {
        SyncError::Config(format!("Failed to parse config file {}: {}", path.display(), msg))
      }
      other => other,
    })
  }

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| SyncError::Config(e.to_string()))
  }

  /// Directory holding the database and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    let db = self.database_path()?;
    Ok(
      db.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")),
    )
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => crate::cache::SqliteStore::default_path(),
    }
  }

  /// Get the API token from the environment.
  ///
  /// Checks SHEAF_TOKEN. Public documents work without one.
  pub fn get_api_token() -> Option<String> {
    std::env::var("SHEAF_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
