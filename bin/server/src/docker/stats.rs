use anyhow::Context;
use bollard::query_parameters::StatsOptionsBuilder;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::DockerClient;

impl DockerClient {
  /// Follow the engine's once-per-second stats stream for a
  /// container, sending each sample as one serialized JSON
  /// frame. The engine's typed response is re-serialized at this
  /// boundary, subscribers never see partial frames.
  pub async fn stream_container_stats(
    &self,
    container: &str,
    out: &mpsc::UnboundedSender<Bytes>,
    cancel: &CancellationToken,
  ) -> anyhow::Result<()> {
    let options = StatsOptionsBuilder::default().stream(true).build();
    let mut stream = self.docker.stats(container, Some(options));

    loop {
      let sample = tokio::select! {
        _ = cancel.cancelled() => break,
        sample = stream.next() => sample,
      };
      let sample = match sample {
        Some(Ok(sample)) => sample,
        Some(Err(e)) => {
          return Err(e).with_context(|| {
            format!("Stats stream for {container} failed")
          });
        }
        None => break,
      };
      let frame = serde_json::to_vec(&sample).with_context(|| {
        format!("Failed to serialize stats for {container}")
      })?;
      if out.send(frame.into()).is_err() {
        break;
      }
    }
    Ok(())
  }
}
