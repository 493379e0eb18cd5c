use std::net::SocketAddr;

#[macro_use]
extern crate tracing;

mod api;
mod config;
mod docker;
mod state;
mod stats;
mod ws;

async fn app() -> anyhow::Result<()> {
  let config = config::dockhand_config();
  logger::init(&config::log_config())?;

  info!("Dockhand version: v{}", env!("CARGO_PKG_VERSION"));
  info!("{:?}", config.sanitized());

  // Connect configured engines up front.
  let environments = state::environments();
  info!("environments: {:?}", environments.names());

  stats::spawn_polling_thread();

  let socket_addr: SocketAddr =
    format!("{}:{}", config.bind_ip, config.port)
      .parse()
      .map_err(|e| {
        anyhow::anyhow!(
          "invalid bind address {}:{} | {e:?}",
          config.bind_ip,
          config.port
        )
      })?;
  info!("dockhand listening on {socket_addr}");

  axum_server::bind(socket_addr)
    .serve(
      api::app()
        .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

  Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  // Parse args early so invalid flags fail fast.
  config::dockhand_args();

  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;

  let app = tokio::spawn(app());

  tokio::select! {
    res = app => return res?,
    _ = term_signal.recv() => {
      info!("terminate signal received, shutting down");
    },
  }

  Ok(())
}
