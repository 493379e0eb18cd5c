use std::{
  path::{Path, PathBuf},
  time::{Duration, Instant},
};

use dockhand_client::entities::stats::{
  GpuInfo, RuntimeMetric, RuntimeStats, StatsSnapshot,
};
use sysinfo::{Disks, ProcessesToUpdate, System};

use crate::{config::dockhand_config, state::stats_client};

pub mod gpu;

/// Cached CPU usage is refreshed this often. The first sample
/// primes the measurement basis, later samples read the delta
/// since the previous tick.
pub const CPU_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// How long the resolved disk usage path is reused.
pub const DISK_PATH_TTL: Duration = Duration::from_secs(300);
/// Per-snapshot websocket write deadline.
pub const STATS_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the sysinfo handles and the cpu / disk-path caches.
/// Lives behind the [stats_client] rwlock.
pub struct StatsClient {
  system: System,
  disks: Disks,
  cpu_percent: f32,
  disk_path: PathBuf,
  disk_path_refreshed: Option<Instant>,
}

impl Default for StatsClient {
  fn default() -> StatsClient {
    StatsClient {
      system: System::new(),
      disks: Disks::new_with_refreshed_list(),
      cpu_percent: 0.0,
      disk_path: PathBuf::from("/"),
      disk_path_refreshed: None,
    }
  }
}

/// Background CPU sampler.
pub fn spawn_polling_thread() {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(CPU_SAMPLE_INTERVAL);
    loop {
      interval.tick().await;
      stats_client().write().await.refresh_cpu();
    }
  });
}

/// Assemble a full snapshot. GPU collection happens before the
/// stats lock is taken, it can block on subprocess timeouts.
pub async fn snapshot(
  include_runtime_metrics: bool,
) -> StatsSnapshot {
  let gpus = gpu::detector().gpus().await;
  let mut client = stats_client().write().await;
  client.snapshot(gpus, include_runtime_metrics)
}

impl StatsClient {
  fn refresh_cpu(&mut self) {
    self.system.refresh_cpu_usage();
    self.cpu_percent = self.system.global_cpu_usage();
  }

  /// The path disk usage is reported for: the configured
  /// override, falling back to the root filesystem. Re-resolved
  /// every [DISK_PATH_TTL].
  fn disk_usage_path(&mut self) -> PathBuf {
    let fresh = self
      .disk_path_refreshed
      .is_some_and(|at| at.elapsed() < DISK_PATH_TTL);
    if !fresh {
      self.disk_path = dockhand_config()
        .disk_usage_path
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"));
      self.disk_path_refreshed = Some(Instant::now());
    }
    self.disk_path.clone()
  }

  fn snapshot(
    &mut self,
    gpus: Vec<GpuInfo>,
    include_runtime_metrics: bool,
  ) -> StatsSnapshot {
    self.system.refresh_memory();
    self.disks.refresh(true);

    let mut memory_total = self.system.total_memory();
    let mut memory_used = self.system.used_memory();
    // A memory cgroup limit below the host total replaces it.
    if let Some(limits) = self.system.cgroup_limits()
      && limits.total_memory > 0
      && limits.total_memory < memory_total
    {
      memory_total = limits.total_memory;
      memory_used =
        memory_total.saturating_sub(limits.free_memory);
    }

    let mut cpu_count = self.system.cpus().len().max(1);
    if let Some(effective) = cgroup_effective_cpus() {
      let effective = effective.ceil() as usize;
      if effective > 0 && effective < cpu_count {
        cpu_count = effective;
      }
    }

    let disk_path = self.disk_usage_path();
    let (disk_used, disk_total) =
      disk_usage_for_path(&self.disks, &disk_path);

    let process_memory = self.refresh_process_memory();
    let runtime = runtime_stats(process_memory);
    let runtime_metrics =
      include_runtime_metrics.then(|| runtime_metrics(&runtime));

    StatsSnapshot {
      cpu_percent: self.cpu_percent as f64,
      cpu_count: cpu_count as u64,
      memory_used_bytes: memory_used.min(memory_total),
      memory_total_bytes: memory_total,
      disk_used_bytes: disk_used.min(disk_total),
      disk_total_bytes: disk_total,
      disk_path: disk_path.to_string_lossy().to_string(),
      arch: std::env::consts::ARCH.to_string(),
      platform: System::name()
        .unwrap_or_else(|| std::env::consts::OS.to_string()),
      hostname: System::host_name().unwrap_or_default(),
      gpu_count: gpus.len(),
      gpus,
      runtime,
      runtime_metrics,
    }
  }

  fn refresh_process_memory(&mut self) -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
      return 0;
    };
    self
      .system
      .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    self
      .system
      .process(pid)
      .map(|process| process.memory())
      .unwrap_or_default()
  }
}

/// Disk usage at the longest mount point containing `path`.
fn disk_usage_for_path(disks: &Disks, path: &Path) -> (u64, u64) {
  let disk = disks
    .list()
    .iter()
    .filter(|disk| path.starts_with(disk.mount_point()))
    .max_by_key(|disk| disk.mount_point().as_os_str().len());
  match disk {
    Some(disk) => {
      let total = disk.total_space();
      (total.saturating_sub(disk.available_space()), total)
    }
    None => (0, 0),
  }
}

fn runtime_stats(process_memory: u64) -> RuntimeStats {
  let handle = tokio::runtime::Handle::try_current();
  let (worker_threads, alive_tasks) = match &handle {
    Ok(handle) => {
      let metrics = handle.metrics();
      (metrics.num_workers(), metrics.num_alive_tasks())
    }
    Err(_) => (0, 0),
  };
  RuntimeStats {
    worker_threads,
    alive_tasks,
    thread_count: process_thread_count(),
    process_memory_bytes: process_memory,
  }
}

fn runtime_metrics(runtime: &RuntimeStats) -> Vec<RuntimeMetric> {
  let mut metrics = vec![
    RuntimeMetric {
      name: "runtime.worker_threads".to_string(),
      value: runtime.worker_threads as f64,
    },
    RuntimeMetric {
      name: "runtime.alive_tasks".to_string(),
      value: runtime.alive_tasks as f64,
    },
    RuntimeMetric {
      name: "process.threads".to_string(),
      value: runtime.thread_count as f64,
    },
    RuntimeMetric {
      name: "process.memory_bytes".to_string(),
      value: runtime.process_memory_bytes as f64,
    },
  ];
  if let Ok(handle) = tokio::runtime::Handle::try_current() {
    metrics.push(RuntimeMetric {
      name: "runtime.global_queue_depth".to_string(),
      value: handle.metrics().global_queue_depth() as f64,
    });
  }
  metrics
}

fn process_thread_count() -> usize {
  std::fs::read_to_string("/proc/self/status")
    .ok()
    .and_then(|status| parse_thread_count(&status))
    .unwrap_or(0)
}

fn parse_thread_count(status: &str) -> Option<usize> {
  status
    .lines()
    .find_map(|line| line.strip_prefix("Threads:"))
    .and_then(|count| count.trim().parse().ok())
}

/// Effective core count from the cpu cgroup, v2 then v1.
fn cgroup_effective_cpus() -> Option<f64> {
  if let Ok(cpu_max) =
    std::fs::read_to_string("/sys/fs/cgroup/cpu.max")
  {
    return parse_cpu_max(&cpu_max);
  }
  let quota = std::fs::read_to_string(
    "/sys/fs/cgroup/cpu/cpu.cfs_quota_us",
  )
  .ok()?;
  let period = std::fs::read_to_string(
    "/sys/fs/cgroup/cpu/cpu.cfs_period_us",
  )
  .ok()?;
  parse_cpu_quota_period(&quota, &period)
}

/// cgroup v2 `cpu.max`: `"<quota|max> <period>"`.
fn parse_cpu_max(content: &str) -> Option<f64> {
  let mut parts = content.split_whitespace();
  let quota = parts.next()?;
  let period: f64 = parts.next()?.parse().ok()?;
  if quota == "max" || period <= 0.0 {
    return None;
  }
  let quota: f64 = quota.parse().ok()?;
  (quota > 0.0).then(|| quota / period)
}

/// cgroup v1 quota / period pair. Quota -1 means unlimited.
fn parse_cpu_quota_period(
  quota: &str,
  period: &str,
) -> Option<f64> {
  let quota: f64 = quota.trim().parse().ok()?;
  let period: f64 = period.trim().parse().ok()?;
  (quota > 0.0 && period > 0.0).then(|| quota / period)
}
