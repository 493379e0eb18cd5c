use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use typeshare::typeshare;

use crate::entities::{U64, Usize};

/// A point-in-time system resource snapshot, sent as one JSON
/// object per stats tick. Pure value, holds no cache references.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
  /// Total CPU usage percentage, 0 to 100 * cpu_count.
  pub cpu_percent: f64,
  /// Effective core count. Cgroup cpu quota lowers this below
  /// the host core count when set.
  pub cpu_count: U64,
  pub memory_used_bytes: U64,
  pub memory_total_bytes: U64,
  pub disk_used_bytes: U64,
  pub disk_total_bytes: U64,
  /// The path disk usage is reported for.
  pub disk_path: String,
  pub arch: String,
  pub platform: String,
  pub hostname: String,
  pub gpu_count: Usize,
  pub gpus: Vec<GpuInfo>,
  pub runtime: RuntimeStats,
  /// Raw named runtime gauges. Only present when the client
  /// opted in with `runtimeMetrics`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub runtime_metrics: Option<Vec<RuntimeMetric>>,
}

#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
  pub index: Usize,
  pub name: String,
  pub memory_used_bytes: U64,
  pub memory_total_bytes: U64,
}

/// Async runtime / process level counters.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStats {
  /// Runtime worker threads.
  pub worker_threads: Usize,
  /// Tasks currently alive on the runtime.
  pub alive_tasks: Usize,
  /// OS threads of the process.
  pub thread_count: Usize,
  /// Resident memory of the process in bytes.
  pub process_memory_bytes: U64,
}

#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMetric {
  pub name: String,
  pub value: f64,
}

/// Vendor of a detected GPU, also usable as a config override to
/// skip autodetection.
#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum GpuType {
  Nvidia,
  Amd,
  Intel,
}
