//! Plain-text formatting helpers for command output.

use chrono::{DateTime, Utc};

/// Truncate a string to a maximum number of characters, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}

/// Human-readable byte size with binary units
pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

  if bytes < 1024 {
    return format!("{} B", bytes);
  }
  let mut value = bytes as f64;
  let mut unit = "B";
  for u in UNITS {
    if value < 1024.0 {
      break;
    }
    value /= 1024.0;
    unit = u;
  }
  format!("{:.1} {}", value, unit)
}

/// Coarse "time ago" for cache timestamps
pub fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
  let secs = (now - at).num_seconds().max(0);
  match secs {
    0..=59 => "just now".to_string(),
    60..=3599 => format!("{}m ago", secs / 60),
    3600..=86_399 => format!("{}h ago", secs / 3600),
    _ => format!("{}d ago", secs / 86_400),
  }
}
