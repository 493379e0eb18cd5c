use std::{
  path::{Path, PathBuf},
  sync::OnceLock,
  time::{Duration, Instant},
};

use anyhow::Context;
use dockhand_client::entities::stats::{GpuInfo, GpuType};
use tokio::{process::Command, sync::Mutex};

use crate::config::dockhand_config;

/// Detection result is reused for this long.
pub const GPU_DETECT_TTL: Duration = Duration::from_secs(30);
/// Vendor tool invocations are cut off after this long.
pub const GPU_TOOL_TIMEOUT: Duration = Duration::from_secs(3);

const DRM_ROOT: &str = "/sys/class/drm";

pub fn detector() -> &'static GpuDetector {
  static DETECTOR: OnceLock<GpuDetector> = OnceLock::new();
  DETECTOR.get_or_init(GpuDetector::default)
}

/// Process-wide lazy GPU detection with TTL invalidation.
/// Detection runs one-shot under the mutex, collection is
/// sequential per stats tick.
#[derive(Default)]
pub struct GpuDetector {
  cached: Mutex<Option<CachedDetection>>,
}

struct CachedDetection {
  gpu_type: Option<GpuType>,
  at: Instant,
}

impl GpuDetector {
  /// Collect the current GPU list. Any probe failure yields an
  /// empty list, stats continue without GPU data.
  pub async fn gpus(&self) -> Vec<GpuInfo> {
    let config = dockhand_config();
    if !config.gpu_monitoring_enabled {
      return Vec::new();
    }
    match self.detect(config.gpu_type).await {
      Some(GpuType::Nvidia) => collect_nvidia()
        .await
        .inspect_err(|e| debug!("nvidia gpu collection | {e:#}"))
        .unwrap_or_default(),
      Some(GpuType::Amd) => collect_amd(Path::new(DRM_ROOT))
        .inspect_err(|e| debug!("amd gpu collection | {e:#}"))
        .unwrap_or_default(),
      Some(GpuType::Intel) => vec![GpuInfo {
        index: 0,
        name: "Intel GPU".to_string(),
        memory_used_bytes: 0,
        memory_total_bytes: 0,
      }],
      None => Vec::new(),
    }
  }

  async fn detect(
    &self,
    forced: Option<GpuType>,
  ) -> Option<GpuType> {
    let mut cached = self.cached.lock().await;
    if let Some(detection) = &*cached
      && detection.at.elapsed() < GPU_DETECT_TTL
    {
      return detection.gpu_type;
    }
    let gpu_type = forced.or_else(autodetect);
    *cached = Some(CachedDetection {
      gpu_type,
      at: Instant::now(),
    });
    gpu_type
  }
}

fn autodetect() -> Option<GpuType> {
  if executable_on_path("nvidia-smi") {
    Some(GpuType::Nvidia)
  } else if amd_card_present(Path::new(DRM_ROOT)) {
    Some(GpuType::Amd)
  } else if executable_on_path("intel_gpu_top") {
    Some(GpuType::Intel)
  } else {
    None
  }
}

fn executable_on_path(name: &str) -> bool {
  let Some(path) = std::env::var_os("PATH") else {
    return false;
  };
  std::env::split_paths(&path)
    .any(|dir| dir.join(name).is_file())
}

async fn collect_nvidia() -> anyhow::Result<Vec<GpuInfo>> {
  let output = tokio::time::timeout(
    GPU_TOOL_TIMEOUT,
    Command::new("nvidia-smi")
      .args([
        "--query-gpu=index,name,memory.used,memory.total",
        "--format=csv,noheader,nounits",
      ])
      .kill_on_drop(true)
      .output(),
  )
  .await
  .context("nvidia-smi timed out")?
  .context("Failed to run nvidia-smi")?;
  if !output.status.success() {
    anyhow::bail!(
      "nvidia-smi exited with {}",
      output.status.code().unwrap_or(-1)
    );
  }
  Ok(parse_nvidia_csv(&String::from_utf8_lossy(&output.stdout)))
}

/// `index, name, memory.used [MiB], memory.total [MiB]` rows.
/// Memory values are MiB and are emitted in bytes.
fn parse_nvidia_csv(stdout: &str) -> Vec<GpuInfo> {
  stdout
    .lines()
    .filter_map(|line| {
      let mut fields = line.split(',').map(str::trim);
      let index = fields.next()?.parse().ok()?;
      let name = fields.next()?.to_string();
      let used_mib: u64 = fields.next()?.parse().ok()?;
      let total_mib: u64 = fields.next()?.parse().ok()?;
      Some(GpuInfo {
        index,
        name,
        memory_used_bytes: used_mib * 1024 * 1024,
        memory_total_bytes: total_mib * 1024 * 1024,
      })
    })
    .collect()
}

fn amd_card_present(root: &Path) -> bool {
  amd_card_paths(root).next().is_some()
}

/// `card*` entries under the drm root. Entries containing `-`
/// are display connectors, not devices.
fn amd_card_paths(
  root: &Path,
) -> impl Iterator<Item = (usize, PathBuf)> {
  root
    .read_dir()
    .into_iter()
    .flatten()
    .flatten()
    .filter_map(|entry| {
      let name = entry.file_name().to_string_lossy().to_string();
      let index = name
        .strip_prefix("card")
        .filter(|rest| !rest.contains('-'))?
        .parse()
        .ok()?;
      let path = entry.path();
      path
        .join("device/mem_info_vram_total")
        .is_file()
        .then_some((index, path))
    })
}

fn collect_amd(root: &Path) -> anyhow::Result<Vec<GpuInfo>> {
  let mut gpus = amd_card_paths(root)
    .filter_map(|(index, path)| {
      let total = read_sysfs_u64(
        &path.join("device/mem_info_vram_total"),
      )?;
      let used = read_sysfs_u64(
        &path.join("device/mem_info_vram_used"),
      )
      .unwrap_or(0);
      Some(GpuInfo {
        index,
        name: format!("AMD GPU card{index}"),
        memory_used_bytes: used,
        memory_total_bytes: total,
      })
    })
    .collect::<Vec<_>>();
  gpus.sort_by_key(|gpu| gpu.index);
  Ok(gpus)
}

fn read_sysfs_u64(path: &Path) -> Option<u64> {
  std::fs::read_to_string(path)
    .ok()?
    .trim()
    .parse()
    .ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn nvidia_csv_parses_and_scales_to_bytes() {
    let stdout =
      "0, NVIDIA GeForce RTX 3090, 512, 24576\n1, NVIDIA T4, 0, 15360\n";
    let gpus = parse_nvidia_csv(stdout);
    assert_eq!(gpus.len(), 2);
    assert_eq!(gpus[0].index, 0);
    assert_eq!(gpus[0].name, "NVIDIA GeForce RTX 3090");
    assert_eq!(gpus[0].memory_used_bytes, 512 * 1024 * 1024);
    assert_eq!(
      gpus[0].memory_total_bytes,
      24576 * 1024 * 1024
    );
    assert_eq!(gpus[1].name, "NVIDIA T4");
  }

  #[test]
  fn nvidia_csv_skips_malformed_rows() {
    let gpus = parse_nvidia_csv("garbage\n0, Name, 1, notanum\n");
    assert!(gpus.is_empty());
  }

  #[test]
  fn amd_collection_reads_sysfs_layout() {
    let root = tempfile::tempdir().unwrap();
    for (card, total, used) in
      [("card0", "8589934592", "1073741824")]
    {
      let device = root.path().join(card).join("device");
      std::fs::create_dir_all(&device).unwrap();
      std::fs::write(device.join("mem_info_vram_total"), total)
        .unwrap();
      std::fs::write(device.join("mem_info_vram_used"), used)
        .unwrap();
    }
    // Connector entries are skipped.
    std::fs::create_dir_all(root.path().join("card0-DP-1"))
      .unwrap();

    let gpus = collect_amd(root.path()).unwrap();
    assert_eq!(gpus.len(), 1);
    assert_eq!(gpus[0].index, 0);
    assert_eq!(gpus[0].memory_total_bytes, 8589934592);
    assert_eq!(gpus[0].memory_used_bytes, 1073741824);
  }

  #[test]
  fn missing_root_yields_empty_list() {
    let gpus =
      collect_amd(Path::new("/definitely/not/a/real/path"))
        .unwrap();
    assert!(gpus.is_empty());
  }
}
