use std::{
  net::{IpAddr, SocketAddr},
  sync::{Arc, Mutex},
  time::{Duration, Instant},
};

use axum::{
  Router,
  extract::ws::{Message, WebSocket},
  http::{HeaderMap, header},
  routing::get,
};
use bytes::Bytes;
use futures_util::{
  SinkExt, StreamExt, stream::SplitSink,
};
use hub::Hub;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::config::dockhand_config;

pub mod exec;
pub mod logs;
pub mod stats;

pub fn router() -> Router {
  Router::new()
    .route(
      "/environments/{environment}/containers/{container}/logs",
      get(logs::container),
    )
    .route(
      "/environments/{environment}/projects/{project}/logs",
      get(logs::project),
    )
    .route(
      "/environments/{environment}/containers/{container}/exec",
      get(exec::container),
    )
    .route(
      "/environments/{environment}/containers/{container}/stats",
      get(stats::container),
    )
    .route("/stats", get(stats::system))
}

/// Application pings are sent this often.
pub const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
/// The peer must have answered a ping within this window.
pub const WS_PONG_TIMEOUT: Duration = Duration::from_secs(60);
/// Socket write buffer for the streaming endpoints.
pub const WS_WRITE_BUFFER_SIZE: usize = 32 * 1024;

/// Validate the Origin header against the configured app url.
/// Absent or relative origins are treated as same-origin.
pub fn origin_allowed(headers: &HeaderMap) -> bool {
  let Some(origin) = headers.get(header::ORIGIN) else {
    return true;
  };
  let Ok(origin) = origin.to_str() else {
    return false;
  };
  let Ok(origin) = Url::parse(origin) else {
    // Not an absolute url, treat as same-origin.
    return true;
  };
  let Ok(app_url) = Url::parse(&dockhand_config().app_url) else {
    return false;
  };
  origin.scheme() == app_url.scheme()
    && origin.host_str() == app_url.host_str()
    && origin.port_or_known_default()
      == app_url.port_or_known_default()
}

/// The client ip used for rate limiting: proxy headers when
/// present, the socket address otherwise.
pub fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
  rate_limit::get_ip_from_headers(headers)
    .unwrap_or_else(|_| addr.ip())
}

/// Register a fresh subscriber on `hub`. None when the hub is no
/// longer running.
pub fn try_subscribe(
  hub: &Hub,
) -> Option<(Uuid, mpsc::Receiver<Bytes>)> {
  let (subscriber, receiver) = hub.subscriber();
  let id = subscriber.id();
  hub.register(subscriber).then_some((id, receiver))
}

/// Serve one subscriber socket: a read pump that watches for the
/// peer going away, and a write pump draining the subscriber
/// queue with pings every [WS_PING_INTERVAL]. Unregisters from
/// the hub on every exit path.
pub async fn serve(
  socket: WebSocket,
  hub: Hub,
  id: Uuid,
  mut receiver: mpsc::Receiver<Bytes>,
  write_timeout: Option<Duration>,
) {
  let (mut sink, mut stream) = socket.split();
  let cancel = CancellationToken::new();
  let last_pong = Arc::new(Mutex::new(Instant::now()));

  // Client pump. Pings from the peer are answered by the
  // websocket layer, pongs feed the liveness check.
  let read_cancel = cancel.clone();
  let read_pong = last_pong.clone();
  let read_pump = tokio::spawn(async move {
    loop {
      let message = tokio::select! {
        _ = read_cancel.cancelled() => break,
        message = stream.next() => message,
      };
      match message {
        Some(Ok(Message::Pong(_))) => {
          *read_pong.lock().unwrap() = Instant::now();
        }
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
        Some(Ok(_)) => {}
      }
    }
    read_cancel.cancel();
  });

  // Server pump.
  let mut ping = tokio::time::interval(WS_PING_INTERVAL);
  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      frame = receiver.recv() => {
        let Some(frame) = frame else {
          // Hub dropped the subscriber.
          break;
        };
        if send_frame(&mut sink, frame, write_timeout)
          .await
          .is_err()
        {
          break;
        }
      }
      _ = ping.tick() => {
        let stale = last_pong.lock().unwrap().elapsed();
        if stale > WS_PONG_TIMEOUT {
          debug!(subscriber = %id, "peer missed pong deadline");
          break;
        }
        if sink.send(Message::Ping(Bytes::new())).await.is_err() {
          break;
        }
      }
    }
  }

  cancel.cancel();
  let _ = sink.close().await;
  hub.unregister(id);
  let _ = read_pump.await;
}

async fn send_frame(
  sink: &mut SplitSink<WebSocket, Message>,
  frame: Bytes,
  write_timeout: Option<Duration>,
) -> Result<(), ()> {
  let message = match String::from_utf8(frame.to_vec()) {
    Ok(text) => Message::text(text),
    Err(_) => Message::Binary(frame),
  };
  let send = sink.send(message);
  match write_timeout {
    Some(deadline) => tokio::time::timeout(deadline, send)
      .await
      .map_err(drop)
      .and_then(|result| result.map_err(drop)),
    None => send.await.map_err(drop),
  }
}
