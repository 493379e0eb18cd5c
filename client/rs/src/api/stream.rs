//! Query types accepted by the streaming websocket endpoints.

use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use typeshare::typeshare;

/// Wire encoding of a log stream.
#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogStreamFormat {
  #[default]
  Text,
  Json,
}

/// Query params common to the container / project log endpoints.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogStreamQuery {
  /// Keep streaming new lines after history is sent.
  #[serde(default = "default_follow")]
  pub follow: bool,
  /// Number of historical lines, or "all".
  #[serde(default = "default_tail")]
  pub tail: String,
  /// RFC3339 timestamp or unix seconds, passed to the engine.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub since: Option<String>,
  /// Ask the engine to prefix lines with timestamps.
  #[serde(default)]
  pub timestamps: bool,
  #[serde(default)]
  pub format: LogStreamFormat,
  /// JSON mode only: batch up to 50 messages / 400 ms per frame.
  #[serde(default)]
  pub batched: bool,
}

impl Default for LogStreamQuery {
  fn default() -> Self {
    LogStreamQuery {
      follow: default_follow(),
      tail: default_tail(),
      since: None,
      timestamps: false,
      format: Default::default(),
      batched: false,
    }
  }
}

fn default_follow() -> bool {
  true
}

fn default_tail() -> String {
  "100".to_string()
}

/// Query params of the system stats endpoint.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsStreamQuery {
  /// Snapshot interval in seconds. Minimum 1.
  #[serde(default = "default_interval")]
  pub interval: u32,
  /// Bool-ish opt in (`1` | `true` | `yes`) to the raw runtime
  /// metrics array.
  #[serde(default, rename = "runtimeMetrics")]
  pub runtime_metrics: String,
}

impl StatsStreamQuery {
  pub fn interval_secs(&self) -> u64 {
    self.interval.max(1) as u64
  }

  pub fn runtime_metrics_enabled(&self) -> bool {
    matches!(
      self.runtime_metrics.to_lowercase().as_str(),
      "1" | "true" | "yes"
    )
  }
}

impl Default for StatsStreamQuery {
  fn default() -> Self {
    StatsStreamQuery {
      interval: default_interval(),
      runtime_metrics: String::new(),
    }
  }
}

fn default_interval() -> u32 {
  2
}

/// Query params of the interactive exec endpoint.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecQuery {
  #[serde(default = "default_shell")]
  pub shell: String,
}

impl Default for ExecQuery {
  fn default() -> Self {
    ExecQuery {
      shell: default_shell(),
    }
  }
}

fn default_shell() -> String {
  "/bin/sh".to_string()
}
