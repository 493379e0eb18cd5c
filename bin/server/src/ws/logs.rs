use std::sync::Arc;

use axum::{
  extract::{Path, Query, WebSocketUpgrade, ws::WebSocket},
  http::{HeaderMap, StatusCode},
  response::{IntoResponse, Response},
};
use bytes::Bytes;
use dockhand_client::{
  api::stream::{LogStreamFormat, LogStreamQuery},
  entities::{logs::LogMessage, rfc3339_now},
};
use hub::{Hub, LOG_QUEUE_CAPACITY};
use logline::NormalizeOptions;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
  api::bad_request,
  docker::{
    DockerClient,
    logs::{LogParams, SourceLine},
  },
  state::{environments, log_streams},
};

/// JSON batched mode flushes at this many messages or after
/// [BATCH_WINDOW], whichever comes first.
const BATCH_MAX_MESSAGES: usize = 50;
const BATCH_WINDOW: std::time::Duration =
  std::time::Duration::from_millis(400);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogTarget {
  Container(String),
  Project(String),
}

/// Subscribers sharing a hub always share identical frames, so
/// the wire options are part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogStreamKey {
  pub environment: String,
  pub target: LogTarget,
  pub query: LogStreamQuery,
}

/// A live pipeline, addressed through its hub. Teardown is owned
/// by the hub's on-empty callback.
pub struct LogStream {
  pub hub: Hub,
}

pub async fn container(
  Path((environment, container)): Path<(String, String)>,
  Query(query): Query<LogStreamQuery>,
  headers: HeaderMap,
  ws: WebSocketUpgrade,
) -> Response {
  subscribe(
    environment,
    LogTarget::Container(container),
    query,
    headers,
    ws,
  )
  .await
}

pub async fn project(
  Path((environment, project)): Path<(String, String)>,
  Query(query): Query<LogStreamQuery>,
  headers: HeaderMap,
  ws: WebSocketUpgrade,
) -> Response {
  subscribe(
    environment,
    LogTarget::Project(project),
    query,
    headers,
    ws,
  )
  .await
}

async fn subscribe(
  environment: String,
  target: LogTarget,
  query: LogStreamQuery,
  headers: HeaderMap,
  ws: WebSocketUpgrade,
) -> Response {
  if !super::origin_allowed(&headers) {
    return StatusCode::FORBIDDEN.into_response();
  }
  let (LogTarget::Container(id) | LogTarget::Project(id)) = &target;
  if environment.trim().is_empty() || id.trim().is_empty() {
    return bad_request("environment and target ids are required");
  }
  let client = match environments().get(&environment) {
    Ok(client) => client,
    Err(e) => return bad_request(format!("{e:#}")),
  };
  let key = LogStreamKey {
    environment,
    target,
    query,
  };
  ws.write_buffer_size(super::WS_WRITE_BUFFER_SIZE)
    .on_upgrade(async move |socket| {
      bind_subscriber(socket, client, key).await
    })
}

/// Attach the socket to the pipeline for `key`, creating it on
/// first subscriber. A stale registry entry (pipeline already
/// terminated) is replaced once.
async fn bind_subscriber(
  socket: WebSocket,
  client: Arc<DockerClient>,
  key: LogStreamKey,
) {
  for _ in 0..2 {
    let stream = log_streams()
      .get_or_insert_with(&key, || {
        spawn_pipeline(client.clone(), key.clone())
      })
      .await;
    if let Some((id, receiver)) = super::try_subscribe(&stream.hub)
    {
      super::serve(socket, stream.hub.clone(), id, receiver, None)
        .await;
      return;
    }
    log_streams().remove(&key).await;
  }
  debug!("could not register log subscriber, dropping socket");
}

/// First subscriber arrived: spawn the hub runner, the source
/// task following the engine, and the forwarder. The hub's
/// on-empty callback owns only the cancel token and key, which
/// breaks the hub / closure cycle.
fn spawn_pipeline(
  client: Arc<DockerClient>,
  key: LogStreamKey,
) -> Arc<LogStream> {
  let (hub, runner) = Hub::new(LOG_QUEUE_CAPACITY);
  let cancel = CancellationToken::new();

  let on_empty_cancel = cancel.clone();
  let on_empty_key = key.clone();
  hub.set_on_empty(move || {
    on_empty_cancel.cancel();
    let key = on_empty_key.clone();
    tokio::spawn(async move {
      log_streams().remove(&key).await;
    });
  });
  runner.spawn(cancel.clone());

  let (line_sender, line_receiver) = mpsc::unbounded_channel();
  let params = LogParams::from(&key.query);
  let target = key.target.clone();
  tokio::spawn(async move {
    let result = match &target {
      LogTarget::Container(name) => {
        client
          .stream_container_logs(name, &params, &line_sender, &cancel)
          .await
      }
      LogTarget::Project(name) => {
        client
          .stream_project_logs(name, &params, &line_sender, &cancel)
          .await
      }
    };
    if let Err(e) = result {
      debug!("log source ended | {e:#}");
    }
    // line_sender drops here, the forwarder drains then exits.
  });

  let project = matches!(key.target, LogTarget::Project(_));
  tokio::spawn(forward_lines(
    line_receiver,
    hub.clone(),
    project,
    key.query.format,
    key.query.batched,
  ));

  Arc::new(LogStream { hub })
}

/// Normalize, frame and publish source lines until the source
/// channel closes. Owns the sequence counter and batch buffer.
async fn forward_lines(
  mut lines: mpsc::UnboundedReceiver<SourceLine>,
  hub: Hub,
  project: bool,
  format: LogStreamFormat,
  batched: bool,
) {
  let mut seq: u64 = 0;
  match (format, batched) {
    (LogStreamFormat::Text, _) => {
      while let Some(line) = lines.recv().await {
        let normalized = logline::normalize(
          &line.text,
          NormalizeOptions {
            project,
            stderr: line.stderr,
          },
        );
        hub.broadcast(Bytes::from(normalized.message));
      }
    }
    (LogStreamFormat::Json, false) => {
      while let Some(line) = lines.recv().await {
        let message = to_log_message(&mut seq, line, project);
        if let Ok(frame) = serde_json::to_vec(&message) {
          hub.broadcast(frame.into());
        }
      }
    }
    (LogStreamFormat::Json, true) => {
      forward_batched(lines, hub, project, &mut seq).await;
    }
  }
}

async fn forward_batched(
  mut lines: mpsc::UnboundedReceiver<SourceLine>,
  hub: Hub,
  project: bool,
  seq: &mut u64,
) {
  let mut batch: Vec<LogMessage> =
    Vec::with_capacity(BATCH_MAX_MESSAGES);
  let mut deadline: Option<tokio::time::Instant> = None;

  loop {
    let next = match deadline {
      Some(at) => tokio::select! {
        line = lines.recv() => Some(line),
        _ = tokio::time::sleep_until(at) => None,
      },
      None => Some(lines.recv().await),
    };
    match next {
      // Window elapsed.
      None => {
        flush_batch(&hub, &mut batch);
        deadline = None;
      }
      Some(Some(line)) => {
        batch.push(to_log_message(seq, line, project));
        if batch.len() == 1 {
          deadline =
            Some(tokio::time::Instant::now() + BATCH_WINDOW);
        }
        if batch.len() >= BATCH_MAX_MESSAGES {
          flush_batch(&hub, &mut batch);
          deadline = None;
        }
      }
      // Source closed: drain and exit.
      Some(None) => {
        flush_batch(&hub, &mut batch);
        return;
      }
    }
  }
}

fn flush_batch(hub: &Hub, batch: &mut Vec<LogMessage>) {
  if batch.is_empty() {
    return;
  }
  if let Ok(frame) = serde_json::to_vec(&batch) {
    hub.broadcast(frame.into());
  }
  batch.clear();
}

fn to_log_message(
  seq: &mut u64,
  line: SourceLine,
  project: bool,
) -> LogMessage {
  let normalized = logline::normalize(
    &line.text,
    NormalizeOptions {
      project,
      stderr: line.stderr,
    },
  );
  *seq += 1;
  LogMessage {
    seq: *seq,
    level: normalized.level,
    message: normalized.message,
    service: normalized.service,
    timestamp: if normalized.timestamp.is_empty() {
      rfc3339_now()
    } else {
      normalized.timestamp
    },
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  fn source_line(text: &str) -> SourceLine {
    SourceLine {
      stderr: false,
      text: text.to_string(),
    }
  }

  fn spawn_hub() -> (Hub, CancellationToken) {
    let (hub, runner) = Hub::new(LOG_QUEUE_CAPACITY);
    let cancel = CancellationToken::new();
    runner.spawn(cancel.clone());
    (hub, cancel)
  }

  async fn recv_frame(
    receiver: &mut mpsc::Receiver<Bytes>,
  ) -> Bytes {
    tokio::time::timeout(Duration::from_secs(1), receiver.recv())
      .await
      .expect("timed out waiting for frame")
      .expect("hub closed the subscriber")
  }

  #[tokio::test]
  async fn json_mode_fans_out_contiguous_sequences() {
    let (hub, _cancel) = spawn_hub();
    let (_id_a, mut rx_a) =
      super::super::try_subscribe(&hub).unwrap();
    let (_id_b, mut rx_b) =
      super::super::try_subscribe(&hub).unwrap();

    let (sender, receiver) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(forward_lines(
      receiver,
      hub.clone(),
      false,
      LogStreamFormat::Json,
      false,
    ));

    for text in ["A\n", "B\n", "C\n"] {
      sender.send(source_line(text)).unwrap();
    }
    drop(sender);
    forwarder.await.unwrap();

    for rx in [&mut rx_a, &mut rx_b] {
      for (seq, text) in [(1, "A"), (2, "B"), (3, "C")] {
        let frame = recv_frame(rx).await;
        let message: LogMessage =
          serde_json::from_slice(&frame).unwrap();
        assert_eq!(message.seq, seq);
        assert_eq!(message.message, text);
        assert!(!message.timestamp.is_empty());
      }
    }
  }

  #[tokio::test]
  async fn text_mode_forwards_message_only() {
    let (hub, _cancel) = spawn_hub();
    let (_id, mut rx) = super::super::try_subscribe(&hub).unwrap();

    let (sender, receiver) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(forward_lines(
      receiver,
      hub.clone(),
      true,
      LogStreamFormat::Text,
      false,
    ));
    sender
      .send(source_line("web  | hello world\n"))
      .unwrap();
    drop(sender);
    forwarder.await.unwrap();

    let frame = recv_frame(&mut rx).await;
    // Service prefix is split off, only the message is framed.
    assert_eq!(frame, Bytes::from_static(b"hello world"));
  }

  #[tokio::test]
  async fn batched_mode_flushes_at_message_cap() {
    let (hub, _cancel) = spawn_hub();
    let (_id, mut rx) = super::super::try_subscribe(&hub).unwrap();

    let (sender, receiver) = mpsc::unbounded_channel();
    let _forwarder = tokio::spawn(forward_lines(
      receiver,
      hub.clone(),
      false,
      LogStreamFormat::Json,
      true,
    ));

    for i in 0..BATCH_MAX_MESSAGES {
      sender.send(source_line(&format!("line {i}\n"))).unwrap();
    }

    let frame = recv_frame(&mut rx).await;
    let batch: Vec<LogMessage> =
      serde_json::from_slice(&frame).unwrap();
    assert_eq!(batch.len(), BATCH_MAX_MESSAGES);
    assert_eq!(batch[0].seq, 1);
    assert_eq!(
      batch[BATCH_MAX_MESSAGES - 1].seq,
      BATCH_MAX_MESSAGES as u64
    );
  }

  #[tokio::test]
  async fn batched_mode_flushes_on_window_elapse() {
    let (hub, _cancel) = spawn_hub();
    let (_id, mut rx) = super::super::try_subscribe(&hub).unwrap();

    let (sender, receiver) = mpsc::unbounded_channel();
    let _forwarder = tokio::spawn(forward_lines(
      receiver,
      hub.clone(),
      false,
      LogStreamFormat::Json,
      true,
    ));

    sender.send(source_line("only one\n")).unwrap();
    let started = std::time::Instant::now();
    let frame = recv_frame(&mut rx).await;
    // Flushed by the window, not by the cap.
    assert!(started.elapsed() >= BATCH_WINDOW / 2);
    let batch: Vec<LogMessage> =
      serde_json::from_slice(&frame).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].message, "only one");
  }

  #[tokio::test]
  async fn source_timestamp_is_preserved() {
    let mut seq = 0;
    let message = to_log_message(
      &mut seq,
      source_line(
        "2024-06-01T12:00:00.000000000Z level=ERROR broke\n",
      ),
      false,
    );
    assert_eq!(
      message.timestamp,
      "2024-06-01T12:00:00.000000000Z"
    );
    assert_eq!(message.seq, 1);
  }
}
