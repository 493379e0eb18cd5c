use anyhow::{Context, anyhow};
use bollard::{
  auth::DockerCredentials,
  query_parameters::CreateImageOptionsBuilder,
};
use bytes::Bytes;
use dockhand_client::entities::{
  config::RegistryConfig,
  deploy::{ProgressDetail, PullEvent},
};
use futures_util::StreamExt;
use progress::PullProgress;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::DockerClient;

/// Writer half of a newline-delimited JSON progress stream
/// (`application/x-json-stream`). One object per line.
pub struct LineWriter {
  sender: mpsc::Sender<Bytes>,
}

impl LineWriter {
  pub fn new() -> (LineWriter, ReceiverStream<Bytes>) {
    let (sender, receiver) = mpsc::channel(64);
    (LineWriter { sender }, ReceiverStream::new(receiver))
  }

  /// Serialize `value` as one `\n` terminated line. Errors when
  /// the reader is gone.
  pub async fn write_json(
    &self,
    value: &impl Serialize,
  ) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(value)
      .context("Failed to serialize progress frame")?;
    line.push(b'\n');
    self
      .sender
      .send(line.into())
      .await
      .map_err(|_| anyhow!("Progress stream reader closed"))
  }

  pub async fn write_status(
    &self,
    status: &str,
  ) -> anyhow::Result<()> {
    self
      .write_json(&serde_json::json!({ "status": status }))
      .await
  }

  pub async fn write_error(&self, message: &str) {
    let _ = self
      .write_json(&serde_json::json!({ "error": message }))
      .await;
  }
}

impl DockerClient {
  /// Pull every image of a compose project, forwarding the
  /// engine's pull events verbatim as JSON lines. Each image is
  /// matched against `registries` for credentials. The terminal
  /// `{"status":"complete"}` frame is written by the caller.
  pub async fn pull_images(
    &self,
    project: &str,
    writer: &LineWriter,
    registries: &[RegistryConfig],
  ) -> anyhow::Result<()> {
    writer.write_status("starting project image pull").await?;
    let images = self.project_images(project).await?;
    for image in &images {
      self
        .pull_image(image, writer, registry_for_image(registries, image))
        .await?;
    }
    Ok(())
  }

  /// Pull a single image, forwarding engine events verbatim and
  /// folding them into an aggregate for the debug trace.
  pub async fn pull_image(
    &self,
    image: &str,
    writer: &LineWriter,
    creds: Option<&RegistryConfig>,
  ) -> anyhow::Result<()> {
    let options =
      CreateImageOptionsBuilder::default().from_image(image).build();
    let mut stream = self.docker.create_image(
      Some(options),
      None,
      creds.map(docker_credentials),
    );
    let mut progress = PullProgress::default();

    while let Some(event) = stream.next().await {
      let info = event.with_context(|| {
        format!("Engine failed pulling image {image}")
      })?;
      if let Some(error) = &info.error {
        return Err(anyhow!("{error}")
          .context(format!("Engine failed pulling image {image}")));
      }
      progress.update(&PullEvent {
        id: info.id.clone(),
        status: info.status.clone(),
        progress_detail: info.progress_detail.as_ref().map(
          |detail| ProgressDetail {
            current: detail.current.unwrap_or_default().max(0)
              as u64,
            total: detail.total.unwrap_or_default().max(0) as u64,
          },
        ),
        error: None,
      });
      // Engine frames are passed through verbatim.
      writer.write_json(&info).await?;
      trace!(
        image,
        aggregate = progress.aggregate(),
        "pull progress"
      );
    }
    debug!(image, "image pull complete");
    Ok(())
  }
}

fn docker_credentials(
  registry: &RegistryConfig,
) -> DockerCredentials {
  DockerCredentials {
    username: Some(registry.username.clone()),
    password: Some(registry.password.clone()),
    serveraddress: (!registry.domain.is_empty())
      .then(|| registry.domain.clone()),
    ..Default::default()
  }
}

/// The configured registry matching `image`'s registry host.
/// Images without a registry prefix (Docker Hub) match an
/// entry with an empty domain.
pub fn registry_for_image<'a>(
  registries: &'a [RegistryConfig],
  image: &str,
) -> Option<&'a RegistryConfig> {
  let domain = image_registry_domain(image);
  registries
    .iter()
    .find(|registry| registry.domain == domain)
}

/// The registry host of an image reference: its first `/`
/// segment when that segment looks like a host, otherwise empty
/// (Docker Hub).
fn image_registry_domain(image: &str) -> &str {
  let Some((head, _rest)) = image.split_once('/') else {
    return "";
  };
  if head.contains('.') || head.contains(':') || head == "localhost"
  {
    head
  } else {
    ""
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn registry(domain: &str) -> RegistryConfig {
    RegistryConfig {
      domain: domain.to_string(),
      username: "user".to_string(),
      password: "pass".to_string(),
    }
  }

  #[test]
  fn image_domain_extraction() {
    assert_eq!(image_registry_domain("alpine"), "");
    assert_eq!(image_registry_domain("library/alpine:3.20"), "");
    assert_eq!(
      image_registry_domain("ghcr.io/acme/tool:latest"),
      "ghcr.io"
    );
    assert_eq!(
      image_registry_domain("localhost:5000/tool"),
      "localhost:5000"
    );
    assert_eq!(image_registry_domain("localhost/tool"), "localhost");
  }

  #[test]
  fn registry_matching_prefers_exact_domain() {
    let registries =
      [registry(""), registry("ghcr.io"), registry("gitlab.com")];
    assert_eq!(
      registry_for_image(&registries, "ghcr.io/acme/tool")
        .map(|r| r.domain.as_str()),
      Some("ghcr.io")
    );
    assert_eq!(
      registry_for_image(&registries, "alpine")
        .map(|r| r.domain.as_str()),
      Some("")
    );
    assert!(
      registry_for_image(&registries, "quay.io/acme/tool").is_none()
    );
  }

  #[test]
  fn credentials_omit_empty_server_address() {
    let creds = docker_credentials(&registry(""));
    assert_eq!(creds.username.as_deref(), Some("user"));
    assert_eq!(creds.serveraddress, None);
    let creds = docker_credentials(&registry("ghcr.io"));
    assert_eq!(creds.serveraddress.as_deref(), Some("ghcr.io"));
  }
}
