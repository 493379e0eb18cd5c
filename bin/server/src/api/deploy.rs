use std::sync::Arc;

use axum::{
  Router,
  body::Body,
  extract::{Path, Query},
  http::header,
  response::{IntoResponse, Response},
  routing::post,
};
use futures_util::StreamExt;
use serde::Deserialize;

use crate::{
  api::bad_request,
  config::dockhand_config,
  docker::{
    DockerClient,
    pull::{LineWriter, registry_for_image},
  },
  state::environments,
};

pub fn router() -> Router {
  Router::new()
    .route(
      "/environments/{environment}/projects/{project}/pull",
      post(pull),
    )
    .route(
      "/environments/{environment}/projects/{project}/deploy",
      post(deploy),
    )
    .route(
      "/environments/{environment}/images/pull",
      post(pull_image),
    )
}

enum StreamKind {
  Pull,
  PullImage,
  Deploy,
}

#[derive(Deserialize)]
struct PullImageQuery {
  image: String,
}

async fn pull(
  Path((environment, project)): Path<(String, String)>,
) -> Response {
  stream_response(environment, project, StreamKind::Pull)
}

async fn deploy(
  Path((environment, project)): Path<(String, String)>,
) -> Response {
  stream_response(environment, project, StreamKind::Deploy)
}

async fn pull_image(
  Path(environment): Path<String>,
  Query(PullImageQuery { image }): Query<PullImageQuery>,
) -> Response {
  stream_response(environment, image, StreamKind::PullImage)
}

/// Run the pull / deploy under a writer feeding a chunked
/// `application/x-json-stream` body. Failures surface as a
/// single `{"error":"..."}` line, then the stream closes.
fn stream_response(
  environment: String,
  target: String,
  kind: StreamKind,
) -> Response {
  if environment.trim().is_empty() || target.trim().is_empty() {
    return bad_request("environment and target ids are required");
  }
  let client = match environments().get(&environment) {
    Ok(client) => client,
    Err(e) => return bad_request(format!("{e:#}")),
  };

  let (writer, stream) = LineWriter::new();
  tokio::spawn(run_stream(client, target, kind, writer));

  (
    [(
      header::CONTENT_TYPE,
      "application/x-json-stream",
    )],
    Body::from_stream(
      stream.map(Ok::<_, std::convert::Infallible>),
    ),
  )
    .into_response()
}

async fn run_stream(
  client: Arc<DockerClient>,
  target: String,
  kind: StreamKind,
  writer: LineWriter,
) {
  let registries = &dockhand_config().registries;
  let result = match kind {
    StreamKind::Pull => {
      match client.pull_images(&target, &writer, registries).await {
        Ok(()) => writer.write_status("complete").await,
        Err(e) => Err(e),
      }
    }
    StreamKind::PullImage => {
      async {
        writer.write_status("starting project image pull").await?;
        client
          .pull_image(
            &target,
            &writer,
            registry_for_image(registries, &target),
          )
          .await?;
        writer.write_status("complete").await
      }
      .await
    }
    StreamKind::Deploy => {
      client.deploy_project(&target, &writer).await
    }
  };
  if let Err(e) = result {
    debug!("progress stream ended with error | {e:#}");
    writer.write_error(&format!("{e:#}")).await;
  }
}
