use anyhow::Context;
use bollard::query_parameters::LogsOptionsBuilder;
use dockhand_client::api::stream::LogStreamQuery;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::DockerClient;

/// One raw line out of a log source, tagged with the stream it
/// was demultiplexed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
  pub stderr: bool,
  pub text: String,
}

/// Source parameters passed through to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogParams {
  pub follow: bool,
  pub tail: String,
  pub since: Option<String>,
  pub timestamps: bool,
}

impl From<&LogStreamQuery> for LogParams {
  fn from(query: &LogStreamQuery) -> LogParams {
    LogParams {
      follow: query.follow,
      tail: query.tail.clone(),
      since: query.since.clone(),
      timestamps: query.timestamps,
    }
  }
}

impl LogParams {
  /// The engine takes `since` as unix seconds. RFC3339 and plain
  /// integer forms are accepted, anything else is ignored.
  pub fn since_timestamp(&self) -> Option<i64> {
    let since = self.since.as_deref()?.trim();
    if since.is_empty() {
      return None;
    }
    if let Ok(timestamp) = chrono::DateTime::parse_from_rfc3339(since)
    {
      return Some(timestamp.timestamp());
    }
    since.parse().ok()
  }
}

impl DockerClient {
  /// Follow a container's log stream, sending each complete line
  /// into `out`. Returns when the engine stream ends, the
  /// receiver goes away, or `cancel` fires.
  pub async fn stream_container_logs(
    &self,
    container: &str,
    params: &LogParams,
    out: &mpsc::UnboundedSender<SourceLine>,
    cancel: &CancellationToken,
  ) -> anyhow::Result<()> {
    let mut options = LogsOptionsBuilder::default()
      .follow(params.follow)
      .stdout(true)
      .stderr(true)
      .timestamps(params.timestamps)
      .tail(&params.tail);
    if let Some(since) = params.since_timestamp() {
      options = options.since(since as i32);
    }
    let mut stream =
      self.docker.logs(container, Some(options.build()));

    let mut stdout_lines = LineBuffer::new(false);
    let mut stderr_lines = LineBuffer::new(true);

    loop {
      let chunk = tokio::select! {
        _ = cancel.cancelled() => break,
        chunk = stream.next() => chunk,
      };
      let output = match chunk {
        Some(Ok(output)) => output,
        Some(Err(e)) => {
          return Err(e).with_context(|| {
            format!("Log stream for {container} failed")
          });
        }
        None => break,
      };
      use bollard::container::LogOutput::*;
      let (buffer, message) = match output {
        StdErr { message } => (&mut stderr_lines, message),
        StdOut { message }
        | Console { message }
        | StdIn { message } => (&mut stdout_lines, message),
      };
      buffer.push(&message);
      for line in buffer.drain_lines() {
        if out.send(line).is_err() {
          // Forwarder is gone, stop reading.
          return Ok(());
        }
      }
    }

    for line in stdout_lines
      .flush()
      .into_iter()
      .chain(stderr_lines.flush())
    {
      let _ = out.send(line);
    }
    Ok(())
  }
}

/// Reassembles engine chunks into complete lines. Chunks may
/// contain several lines or end mid-line.
pub struct LineBuffer {
  stderr: bool,
  partial: String,
}

impl LineBuffer {
  pub fn new(stderr: bool) -> LineBuffer {
    LineBuffer {
      stderr,
      partial: String::new(),
    }
  }

  pub fn push(&mut self, bytes: &[u8]) {
    self
      .partial
      .push_str(&String::from_utf8_lossy(bytes));
  }

  /// Take every complete line accumulated so far, leaving any
  /// trailing partial line buffered.
  pub fn drain_lines(&mut self) -> Vec<SourceLine> {
    let mut lines = Vec::new();
    while let Some(newline) = self.partial.find('\n') {
      let rest = self.partial.split_off(newline + 1);
      let line = std::mem::replace(&mut self.partial, rest);
      lines.push(SourceLine {
        stderr: self.stderr,
        text: line,
      });
    }
    lines
  }

  /// Emit the trailing partial line, if any.
  pub fn flush(&mut self) -> Option<SourceLine> {
    if self.partial.is_empty() {
      return None;
    }
    Some(SourceLine {
      stderr: self.stderr,
      text: std::mem::take(&mut self.partial),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn line_buffer_splits_multi_line_chunks() {
    let mut buffer = LineBuffer::new(false);
    buffer.push(b"one\ntwo\nthr");
    let lines = buffer.drain_lines();
    assert_eq!(
      lines
        .iter()
        .map(|line| line.text.as_str())
        .collect::<Vec<_>>(),
      vec!["one\n", "two\n"]
    );
    // The partial line stays buffered until completed.
    assert!(buffer.drain_lines().is_empty());
    buffer.push(b"ee\n");
    let lines = buffer.drain_lines();
    assert_eq!(lines[0].text, "three\n");
    assert!(buffer.flush().is_none());
  }

  #[test]
  fn line_buffer_flushes_trailing_partial() {
    let mut buffer = LineBuffer::new(true);
    buffer.push(b"no newline");
    assert!(buffer.drain_lines().is_empty());
    let line = buffer.flush().unwrap();
    assert!(line.stderr);
    assert_eq!(line.text, "no newline");
  }

  #[test]
  fn since_accepts_rfc3339_and_seconds() {
    let mut params = LogParams {
      follow: true,
      tail: "100".to_string(),
      since: Some("2024-06-01T12:00:00Z".to_string()),
      timestamps: false,
    };
    assert_eq!(params.since_timestamp(), Some(1717243200));
    params.since = Some("1717243200".to_string());
    assert_eq!(params.since_timestamp(), Some(1717243200));
    params.since = Some("20 minutes ago".to_string());
    assert_eq!(params.since_timestamp(), None);
    params.since = None;
    assert_eq!(params.since_timestamp(), None);
  }
}
