use std::{
  collections::HashMap,
  sync::{Arc, OnceLock},
};

use anyhow::Context;
use cache::CloneCache;
use rate_limit::ConnectionLimiter;
use tokio::sync::RwLock;

use crate::{
  config::dockhand_config,
  docker::DockerClient,
  stats::StatsClient,
  ws::logs::{LogStream, LogStreamKey},
};

/// Max simultaneous system-stats subscriptions per client ip.
pub const STATS_MAX_CONNECTIONS_PER_IP: usize = 5;

/// The configured Docker environments, connected at startup.
/// Environments whose engine is unreachable at startup are kept
/// out of the map and produce client faults on access.
pub fn environments() -> &'static Environments {
  static ENVIRONMENTS: OnceLock<Environments> = OnceLock::new();
  ENVIRONMENTS.get_or_init(Environments::init)
}

pub struct Environments {
  clients: HashMap<String, Arc<DockerClient>>,
}

impl Environments {
  fn init() -> Environments {
    let mut clients = HashMap::new();
    for config in &dockhand_config().environments {
      match DockerClient::connect(config) {
        Ok(client) => {
          clients.insert(config.name.clone(), Arc::new(client));
        }
        Err(e) => {
          warn!("{e:#}");
        }
      }
    }
    Environments { clients }
  }

  pub fn get(
    &self,
    name: &str,
  ) -> anyhow::Result<Arc<DockerClient>> {
    self
      .clients
      .get(name)
      .cloned()
      .with_context(|| format!("No environment named {name}"))
  }

  pub fn names(&self) -> Vec<&str> {
    self.clients.keys().map(String::as_str).collect()
  }
}

/// Live log pipelines, keyed by (environment, target, options).
pub fn log_streams()
-> &'static CloneCache<LogStreamKey, Arc<LogStream>> {
  static LOG_STREAMS: OnceLock<
    CloneCache<LogStreamKey, Arc<LogStream>>,
  > = OnceLock::new();
  LOG_STREAMS.get_or_init(Default::default)
}

pub fn stats_limiter() -> &'static Arc<ConnectionLimiter> {
  static STATS_LIMITER: OnceLock<Arc<ConnectionLimiter>> =
    OnceLock::new();
  STATS_LIMITER.get_or_init(|| {
    ConnectionLimiter::new(STATS_MAX_CONNECTIONS_PER_IP)
  })
}

pub fn stats_client() -> &'static RwLock<StatsClient> {
  static STATS_CLIENT: OnceLock<RwLock<StatsClient>> =
    OnceLock::new();
  STATS_CLIENT.get_or_init(|| RwLock::new(StatsClient::default()))
}
