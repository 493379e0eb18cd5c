use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use typeshare::typeshare;

use crate::entities::stats::GpuType;

/// Top level configuration of the dockhand server.
/// Assembled in the binary from environment variables, CLI args
/// and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockhandConfig {
  /// The externally reachable app URL. Used to validate the
  /// Origin header on websocket upgrades. Wildcards are not
  /// supported.
  pub app_url: String,
  /// Port the server binds.
  pub port: u16,
  /// IP the server binds.
  pub bind_ip: String,
  /// The Docker environments managed by this server.
  /// An empty address connects to the local engine.
  pub environments: Vec<EnvironmentConfig>,
  /// Report disk usage for this path instead of asking the
  /// system service.
  pub disk_usage_path: Option<String>,
  /// Enable GPU detection / collection in system stats.
  pub gpu_monitoring_enabled: bool,
  /// Skip GPU autodetection and force a vendor.
  pub gpu_type: Option<GpuType>,
  /// Use the `docker-compose` binary instead of `docker compose`.
  pub legacy_compose_cli: bool,
  /// Registry accounts used to authenticate image pulls.
  pub registries: Vec<RegistryConfig>,
  pub logging: LogConfig,
}

impl Default for DockhandConfig {
  fn default() -> DockhandConfig {
    DockhandConfig {
      app_url: format!("http://localhost:{DEFAULT_PORT}"),
      port: DEFAULT_PORT,
      bind_ip: "0.0.0.0".to_string(),
      environments: vec![EnvironmentConfig::default()],
      disk_usage_path: None,
      gpu_monitoring_enabled: true,
      gpu_type: None,
      legacy_compose_cli: false,
      registries: Vec::new(),
      logging: Default::default(),
    }
  }
}

impl DockhandConfig {
  /// Copy for startup logging with registry secrets redacted.
  pub fn sanitized(&self) -> DockhandConfig {
    let mut config = self.clone();
    for registry in &mut config.registries {
      if !registry.password.is_empty() {
        registry.password = "##############".to_string();
      }
    }
    config
  }
}

/// Credentials for one image registry. An empty domain matches
/// Docker Hub images (no registry prefix).
#[derive(
  Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(default)]
pub struct RegistryConfig {
  pub domain: String,
  pub username: String,
  pub password: String,
}

pub const DEFAULT_PORT: u16 = 9120;

/// A managed Docker endpoint: the local socket, or a remote
/// engine at an http(s) address.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
  pub name: String,
  /// Empty for the local engine, otherwise an http(s) address.
  #[serde(default)]
  pub address: String,
}

impl Default for EnvironmentConfig {
  fn default() -> EnvironmentConfig {
    EnvironmentConfig {
      name: "local".to_string(),
      address: String::new(),
    }
  }
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(default)]
pub struct LogConfig {
  pub level: LogLevel,
  pub stdio: StdioLogMode,
  /// Pretty (multi-line) stdio formatting.
  pub pretty: bool,
}

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
  Error,
  Warn,
  #[default]
  Info,
  Debug,
  Trace,
}

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
pub enum StdioLogMode {
  #[default]
  Standard,
  Json,
  None,
}
