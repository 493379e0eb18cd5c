use anyhow::Context;
use bollard::{API_DEFAULT_VERSION, Docker};
use dockhand_client::entities::config::EnvironmentConfig;

pub mod compose;
pub mod exec;
pub mod logs;
pub mod pull;
pub mod stats;

/// Handle on one managed Docker engine. The underlying bollard
/// client is safe to share across requests.
pub struct DockerClient {
  docker: Docker,
  environment: String,
  /// Empty for the local engine.
  address: String,
}

impl DockerClient {
  pub fn connect(
    config: &EnvironmentConfig,
  ) -> anyhow::Result<DockerClient> {
    let docker = if config.address.is_empty() {
      Docker::connect_with_defaults().with_context(|| {
        format!(
          "Failed to connect to local docker engine for environment {}",
          config.name
        )
      })?
    } else {
      Docker::connect_with_http(
        &config.address,
        120,
        API_DEFAULT_VERSION,
      )
      .with_context(|| {
        format!(
          "Failed to connect to docker engine at {} for environment {}",
          config.address, config.name
        )
      })?
    };
    Ok(DockerClient {
      docker,
      environment: config.name.clone(),
      address: config.address.clone(),
    })
  }

  pub fn environment(&self) -> &str {
    &self.environment
  }
}
