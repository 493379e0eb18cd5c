use std::sync::OnceLock;

use axum::http::HeaderValue;
use clap::Parser;
use colored::Colorize;
use dockhand_client::entities::{
  config::{
    DockhandConfig, EnvironmentConfig, LogConfig, LogLevel,
    RegistryConfig, StdioLogMode,
  },
  stats::GpuType,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

#[derive(Parser)]
#[command(name = "dockhand", about = "dockhand server", version)]
pub struct CliArgs {
  /// Override the configured log level.
  #[arg(long)]
  pub log_level: Option<tracing::Level>,
}

pub fn dockhand_args() -> &'static CliArgs {
  static DOCKHAND_ARGS: OnceLock<CliArgs> = OnceLock::new();
  DOCKHAND_ARGS.get_or_init(CliArgs::parse)
}

/// `DOCKHAND_` prefixed environment variables layered over the
/// defaults.
#[derive(Deserialize)]
struct Env {
  dockhand_app_url: Option<String>,
  dockhand_port: Option<u16>,
  dockhand_bind_ip: Option<String>,
  /// `name=address` pairs, comma separated. `name` alone means
  /// the local engine.
  dockhand_environments: Option<String>,
  dockhand_disk_usage_path: Option<String>,
  dockhand_gpu_monitoring_enabled: Option<bool>,
  dockhand_gpu_type: Option<GpuType>,
  dockhand_legacy_compose_cli: Option<bool>,
  dockhand_registry_domain: Option<String>,
  dockhand_registry_username: Option<String>,
  dockhand_registry_password: Option<String>,
  dockhand_logging_level: Option<LogLevel>,
  dockhand_logging_stdio: Option<StdioLogMode>,
  dockhand_logging_pretty: Option<bool>,
}

pub fn dockhand_config() -> &'static DockhandConfig {
  static DOCKHAND_CONFIG: OnceLock<DockhandConfig> =
    OnceLock::new();
  DOCKHAND_CONFIG.get_or_init(|| {
    let env: Env = envy::from_env()
      .expect("failed to parse dockhand environment");
    let default = DockhandConfig::default();

    let port = env.dockhand_port.unwrap_or(default.port);
    DockhandConfig {
      app_url: env
        .dockhand_app_url
        .unwrap_or_else(|| format!("http://localhost:{port}")),
      port,
      bind_ip: env.dockhand_bind_ip.unwrap_or(default.bind_ip),
      environments: env
        .dockhand_environments
        .as_deref()
        .map(parse_environments)
        .unwrap_or(default.environments),
      disk_usage_path: env.dockhand_disk_usage_path,
      gpu_monitoring_enabled: env
        .dockhand_gpu_monitoring_enabled
        .unwrap_or(default.gpu_monitoring_enabled),
      gpu_type: env.dockhand_gpu_type,
      legacy_compose_cli: env
        .dockhand_legacy_compose_cli
        .unwrap_or(default.legacy_compose_cli),
      registries: match env.dockhand_registry_username {
        Some(username) => vec![RegistryConfig {
          domain: env.dockhand_registry_domain.unwrap_or_default(),
          username,
          password: env
            .dockhand_registry_password
            .unwrap_or_default(),
        }],
        None => default.registries,
      },
      logging: LogConfig {
        level: env
          .dockhand_logging_level
          .unwrap_or(default.logging.level),
        stdio: env
          .dockhand_logging_stdio
          .unwrap_or(default.logging.stdio),
        pretty: env
          .dockhand_logging_pretty
          .unwrap_or(default.logging.pretty),
      },
    }
  })
}

fn parse_environments(raw: &str) -> Vec<EnvironmentConfig> {
  let environments = raw
    .split(',')
    .map(str::trim)
    .filter(|entry| !entry.is_empty())
    .map(|entry| match entry.split_once('=') {
      Some((name, address)) => EnvironmentConfig {
        name: name.trim().to_string(),
        address: address.trim().to_string(),
      },
      None => EnvironmentConfig {
        name: entry.to_string(),
        address: String::new(),
      },
    })
    .collect::<Vec<_>>();
  if environments.is_empty() {
    println!(
      "{}: no valid environments configured, using local engine",
      "WARN".yellow(),
    );
    return vec![EnvironmentConfig::default()];
  }
  environments
}

/// The logging config with the CLI level override applied.
pub fn log_config() -> LogConfig {
  let mut config = dockhand_config().logging;
  if let Some(level) = dockhand_args().log_level {
    config.level = log_level_from_tracing(level);
  }
  config
}

fn log_level_from_tracing(level: tracing::Level) -> LogLevel {
  match level {
    tracing::Level::ERROR => LogLevel::Error,
    tracing::Level::WARN => LogLevel::Warn,
    tracing::Level::INFO => LogLevel::Info,
    tracing::Level::DEBUG => LogLevel::Debug,
    tracing::Level::TRACE => LogLevel::Trace,
  }
}

/// Cors restricted to the configured app url.
pub fn cors_layer() -> CorsLayer {
  let app_url = dockhand_config().app_url.trim_end_matches('/');
  match app_url.parse::<HeaderValue>() {
    Ok(origin) => CorsLayer::new()
      .allow_origin(origin)
      .allow_methods(tower_http::cors::Any)
      .allow_headers(tower_http::cors::Any),
    Err(_) => CorsLayer::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn environments_parse_names_and_addresses() {
    let environments = parse_environments(
      "local, staging=https://10.0.0.5:2376 ,prod=http://prod:2375",
    );
    assert_eq!(environments.len(), 3);
    assert_eq!(environments[0].name, "local");
    assert_eq!(environments[0].address, "");
    assert_eq!(environments[1].name, "staging");
    assert_eq!(environments[1].address, "https://10.0.0.5:2376");
    assert_eq!(environments[2].name, "prod");
  }

  #[test]
  fn empty_environment_spec_falls_back_to_local() {
    let environments = parse_environments(" , ");
    assert_eq!(environments.len(), 1);
    assert_eq!(environments[0].name, "local");
  }
}
