use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use typeshare::typeshare;

use crate::entities::U64;

/// Severity attached to a normalized log line.
#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
  Info,
  Warn,
  Error,
  Debug,
  #[default]
  Unknown,
}

/// One normalized log line as sent to JSON-mode subscribers.
///
/// `seq` is strictly increasing and contiguous within a single
/// stream pipeline. Sequences are independent across pipelines.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
  pub seq: U64,
  pub level: LogLevel,
  pub message: String,
  /// Compose service name. Only set on project log streams.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub service: Option<String>,
  /// RFC3339. Filled with the current wall clock when the
  /// source line carried no timestamp.
  pub timestamp: String,
}
