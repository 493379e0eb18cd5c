use anyhow::Context;
use dockhand_client::entities::config::{
  LogConfig, LogLevel, StdioLogMode,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
  Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let registry = Registry::default()
    .with(LevelFilter::from(tracing_level(config.level)));

  match (config.stdio, config.pretty) {
    (StdioLogMode::Standard, true) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .pretty()
          .with_file(false)
          .with_line_number(false),
      )
      .try_init(),
    (StdioLogMode::Standard, false) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .with_file(false)
          .with_line_number(false),
      )
      .try_init(),
    (StdioLogMode::Json, _) => registry
      .with(tracing_subscriber::fmt::layer().json())
      .try_init(),
    (StdioLogMode::None, _) => Ok(()),
  }
  .context("failed to init logger")
}

pub fn tracing_level(level: LogLevel) -> tracing::Level {
  match level {
    LogLevel::Error => tracing::Level::ERROR,
    LogLevel::Warn => tracing::Level::WARN,
    LogLevel::Info => tracing::Level::INFO,
    LogLevel::Debug => tracing::Level::DEBUG,
    LogLevel::Trace => tracing::Level::TRACE,
  }
}
