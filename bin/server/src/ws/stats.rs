use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
  extract::{
    ConnectInfo, Path, Query, WebSocketUpgrade, ws::WebSocket,
  },
  http::{HeaderMap, StatusCode},
  response::{IntoResponse, Response},
};
use dockhand_client::api::stream::StatsStreamQuery;
use hub::{Hub, STATS_QUEUE_CAPACITY};
use rate_limit::ConnectionPermit;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
  api::bad_request,
  docker::DockerClient,
  state::{environments, stats_limiter},
  stats::STATS_WRITE_TIMEOUT,
};

/// System stats over websocket: rate limited per client ip, one
/// snapshot per interval tick.
pub async fn system(
  Query(query): Query<StatsStreamQuery>,
  headers: HeaderMap,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  ws: WebSocketUpgrade,
) -> Response {
  if !super::origin_allowed(&headers) {
    return StatusCode::FORBIDDEN.into_response();
  }
  let ip = super::client_ip(&headers, addr);
  // 429 before the upgrade when the ip is at its cap.
  let permit = match stats_limiter().acquire(ip) {
    Ok(permit) => permit,
    Err(e) => return e.into_response(),
  };
  ws.write_buffer_size(super::WS_WRITE_BUFFER_SIZE)
    .on_upgrade(async move |socket| {
      run_system_stats(socket, query, permit).await
    })
}

async fn run_system_stats(
  socket: WebSocket,
  query: StatsStreamQuery,
  permit: ConnectionPermit,
) {
  // Held for the lifetime of the subscription.
  let _permit = permit;

  let (hub, runner) = Hub::new(STATS_QUEUE_CAPACITY);
  let cancel = CancellationToken::new();
  let on_empty_cancel = cancel.clone();
  hub.set_on_empty(move || on_empty_cancel.cancel());
  runner.spawn(cancel.clone());

  let Some((id, receiver)) = super::try_subscribe(&hub) else {
    return;
  };

  let producer_hub = hub.clone();
  let producer_cancel = cancel.clone();
  let interval_secs = query.interval_secs();
  let include_runtime_metrics = query.runtime_metrics_enabled();
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(
      Duration::from_secs(interval_secs),
    );
    loop {
      tokio::select! {
        _ = producer_cancel.cancelled() => break,
        _ = interval.tick() => {}
      }
      let snapshot =
        crate::stats::snapshot(include_runtime_metrics).await;
      match serde_json::to_vec(&snapshot) {
        Ok(frame) => producer_hub.broadcast(frame.into()),
        Err(e) => {
          error!("failed to serialize stats snapshot | {e:#}");
          break;
        }
      }
    }
  });

  super::serve(socket, hub, id, receiver, Some(STATS_WRITE_TIMEOUT))
    .await;
}

/// Engine-side container stats stream, forwarded verbatim.
pub async fn container(
  Path((environment, container)): Path<(String, String)>,
  headers: HeaderMap,
  ws: WebSocketUpgrade,
) -> Response {
  if !super::origin_allowed(&headers) {
    return StatusCode::FORBIDDEN.into_response();
  }
  if environment.trim().is_empty() || container.trim().is_empty() {
    return bad_request("environment and container are required");
  }
  let client = match environments().get(&environment) {
    Ok(client) => client,
    Err(e) => return bad_request(format!("{e:#}")),
  };
  ws.write_buffer_size(super::WS_WRITE_BUFFER_SIZE)
    .on_upgrade(async move |socket| {
      run_container_stats(socket, client, container).await
    })
}

async fn run_container_stats(
  socket: WebSocket,
  client: Arc<DockerClient>,
  container: String,
) {
  let (hub, runner) = Hub::new(STATS_QUEUE_CAPACITY);
  let cancel = CancellationToken::new();
  let on_empty_cancel = cancel.clone();
  hub.set_on_empty(move || on_empty_cancel.cancel());
  runner.spawn(cancel.clone());

  let Some((id, receiver)) = super::try_subscribe(&hub) else {
    return;
  };

  let (frame_sender, mut frame_receiver) =
    mpsc::unbounded_channel();
  let source_cancel = cancel.clone();
  tokio::spawn(async move {
    if let Err(e) = client
      .stream_container_stats(
        &container,
        &frame_sender,
        &source_cancel,
      )
      .await
    {
      debug!("container stats source ended | {e:#}");
    }
  });
  let forward_hub = hub.clone();
  tokio::spawn(async move {
    while let Some(frame) = frame_receiver.recv().await {
      forward_hub.broadcast(frame);
    }
  });

  super::serve(socket, hub, id, receiver, Some(STATS_WRITE_TIMEOUT))
    .await;
}
