use std::sync::Arc;

use axum::{
  extract::{
    Path, Query, WebSocketUpgrade,
    ws::{Message, WebSocket},
  },
  http::{HeaderMap, StatusCode},
  response::{IntoResponse, Response},
};
use bytes::Bytes;
use dockhand_client::api::stream::ExecQuery;
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
  api::bad_request,
  docker::{
    DockerClient,
    exec::{EXEC_CLOSE_TIMEOUT, ExecSession},
  },
  state::environments,
};

/// Stdout is relayed to the client in chunks of this size.
const EXEC_CHUNK_SIZE: usize = 4096;

pub async fn container(
  Path((environment, container)): Path<(String, String)>,
  Query(ExecQuery { shell }): Query<ExecQuery>,
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
      bridge(socket, client, container, shell).await
    })
}

/// Half-duplex bridge between the websocket and the hijacked
/// exec stream. Two tasks: stdout -> socket (the only socket
/// writer) and socket -> stdin. Either task ending for any
/// reason cancels the other; [ExecSession]'s stdin close runs on
/// every exit path and is idempotent.
async fn bridge(
  mut socket: WebSocket,
  client: Arc<DockerClient>,
  container: String,
  shell: String,
) {
  let session =
    match client.create_exec_session(&container, &shell).await {
      Ok(session) => session,
      Err(e) => {
        let _ =
          socket.send(Message::text(format!("{e:#}\r\n"))).await;
        let _ = socket.close().await;
        return;
      }
    };
  let ExecSession {
    exec_id,
    stdin,
    output,
  } = session;
  trace!(%exec_id, %container, "exec attached");

  let cancel = CancellationToken::new();
  let (mut sink, mut stream) = socket.split();

  // Exec stdout -> client, binary frames.
  let stdout_cancel = cancel.clone();
  let mut stdout_task = tokio::spawn(async move {
    let mut output = output;
    loop {
      let chunk = tokio::select! {
        _ = stdout_cancel.cancelled() => break,
        chunk = output.next() => chunk,
      };
      match chunk {
        Some(Ok(log_output)) => {
          let bytes = log_output.into_bytes();
          let mut failed = false;
          for part in bytes.chunks(EXEC_CHUNK_SIZE) {
            if sink
              .send(Message::Binary(Bytes::copy_from_slice(part)))
              .await
              .is_err()
            {
              failed = true;
              break;
            }
          }
          if failed {
            break;
          }
        }
        Some(Err(e)) => {
          // Surface the error as one text frame, then close.
          let _ =
            sink.send(Message::text(format!("{e:#}\r\n"))).await;
          break;
        }
        None => break,
      }
    }
    let _ = sink.close().await;
    stdout_cancel.cancel();
  });

  // Client input -> exec stdin.
  let stdin_cancel = cancel.clone();
  let task_stdin = stdin.clone();
  let mut stdin_task = tokio::spawn(async move {
    loop {
      let message = tokio::select! {
        _ = stdin_cancel.cancelled() => break,
        message = stream.next() => message,
      };
      match message {
        Some(Ok(Message::Binary(bytes))) => {
          if task_stdin.write_all(&bytes).await.is_err() {
            break;
          }
        }
        Some(Ok(Message::Text(text))) => {
          if task_stdin.write_all(text.as_bytes()).await.is_err() {
            break;
          }
        }
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
        Some(Ok(_)) => {}
      }
    }
    task_stdin.close().await;
    stdin_cancel.cancel();
  });

  // The stdout task signals the end of the bridge. The stdin
  // task then gets the close window before being aborted.
  if let Err(e) = (&mut stdout_task).await
    && e.is_panic()
  {
    error!(%exec_id, "exec stdout task panicked | {e:?}");
  }
  cancel.cancel();
  match tokio::time::timeout(EXEC_CLOSE_TIMEOUT, &mut stdin_task)
    .await
  {
    Ok(Err(e)) if e.is_panic() => {
      error!(%exec_id, "exec stdin task panicked | {e:?}");
    }
    Ok(_) => {}
    Err(_) => stdin_task.abort(),
  }
  // Covers exit paths where the stdin task never reached its own
  // close (eg aborted above).
  stdin.close().await;
  debug!(%exec_id, "exec bridge closed");
}
