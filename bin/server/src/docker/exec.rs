use std::{pin::Pin, sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use bollard::{
  container::LogOutput, exec::{StartExecOptions, StartExecResults},
  models::ExecConfig,
};
use futures_util::Stream;
use tokio::{
  io::{AsyncWrite, AsyncWriteExt},
  sync::Mutex,
};

use super::DockerClient;

/// Release of the hijacked stream is bounded by this window,
/// even when the request context is already cancelled.
pub const EXEC_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub type ExecStdinWriter = Pin<Box<dyn AsyncWrite + Send>>;
pub type ExecOutput = Pin<
  Box<
    dyn Stream<Item = Result<LogOutput, bollard::errors::Error>>
      + Send,
  >,
>;

/// An attached interactive exec: the hijacked stdin handle and
/// stdout stream plus the exec id for diagnostics. The engine
/// releases the hijacked connection once stdin is closed and the
/// output stream is dropped.
pub struct ExecSession {
  pub exec_id: String,
  pub stdin: Arc<ExecStdin>,
  pub output: ExecOutput,
}

/// Shared writer half of an exec session. [ExecStdin::close] is
/// idempotent and safe to call from any exit path.
pub struct ExecStdin {
  writer: Mutex<Option<ExecStdinWriter>>,
}

impl ExecStdin {
  fn new(writer: ExecStdinWriter) -> Arc<ExecStdin> {
    Arc::new(ExecStdin {
      writer: Mutex::new(Some(writer)),
    })
  }

  /// Errors once the session is closed.
  pub async fn write_all(
    &self,
    bytes: &[u8],
  ) -> std::io::Result<()> {
    let mut writer = self.writer.lock().await;
    match writer.as_mut() {
      Some(writer) => writer.write_all(bytes).await,
      None => {
        Err(std::io::Error::other("exec stdin already closed"))
      }
    }
  }

  /// Shut the writer down under a fresh [EXEC_CLOSE_TIMEOUT].
  /// The first caller wins, later calls are no-ops.
  pub async fn close(&self) {
    let writer = self.writer.lock().await.take();
    let Some(mut writer) = writer else {
      return;
    };
    let _ =
      tokio::time::timeout(EXEC_CLOSE_TIMEOUT, writer.shutdown())
        .await;
  }
}

impl DockerClient {
  /// Create and attach an interactive exec running `shell` with
  /// a TTY and stdin/stdout wired up.
  pub async fn create_exec_session(
    &self,
    container: &str,
    shell: &str,
  ) -> anyhow::Result<ExecSession> {
    let exec = self
      .docker
      .create_exec(
        container,
        ExecConfig {
          attach_stdin: Some(true),
          attach_stdout: Some(true),
          attach_stderr: Some(true),
          tty: Some(true),
          cmd: Some(vec![shell.to_string()]),
          ..Default::default()
        },
      )
      .await
      .with_context(|| {
        format!("Failed to create exec in container {container}")
      })?;

    let results = self
      .docker
      .start_exec(&exec.id, Option::<StartExecOptions>::None)
      .await
      .with_context(|| {
        format!("Failed to start exec in container {container}")
      })?;

    match results {
      StartExecResults::Attached { output, input } => {
        Ok(ExecSession {
          exec_id: exec.id,
          stdin: ExecStdin::new(input),
          output,
        })
      }
      StartExecResults::Detached => Err(anyhow!(
        "Engine started exec {} detached, no stream to bridge",
        exec.id
      )),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::Poll,
  };

  use super::*;

  /// AsyncWrite stub recording shutdowns, optionally never
  /// completing them.
  #[derive(Default)]
  struct StubWriter {
    shutdowns: Arc<AtomicUsize>,
    hang_shutdown: bool,
    hung: Arc<AtomicBool>,
  }

  impl AsyncWrite for StubWriter {
    fn poll_write(
      self: Pin<&mut Self>,
      _cx: &mut std::task::Context<'_>,
      buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
      Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
      self: Pin<&mut Self>,
      _cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
      Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
      self: Pin<&mut Self>,
      _cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
      if self.hang_shutdown {
        self.hung.store(true, Ordering::SeqCst);
        return Poll::Pending;
      }
      self.shutdowns.fetch_add(1, Ordering::SeqCst);
      Poll::Ready(Ok(()))
    }
  }

  #[tokio::test]
  async fn close_is_idempotent() {
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let stdin = ExecStdin::new(Box::pin(StubWriter {
      shutdowns: shutdowns.clone(),
      ..Default::default()
    }));

    stdin.close().await;
    stdin.close().await;
    stdin.close().await;
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn writes_fail_after_close() {
    let stdin = ExecStdin::new(Box::pin(StubWriter::default()));
    stdin.write_all(b"ls\n").await.unwrap();
    stdin.close().await;
    assert!(stdin.write_all(b"ls\n").await.is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn hung_shutdown_is_bounded_by_the_close_window() {
    let hung = Arc::new(AtomicBool::new(false));
    let stdin = ExecStdin::new(Box::pin(StubWriter {
      hang_shutdown: true,
      hung: hung.clone(),
      ..Default::default()
    }));

    // Returns once the close window elapses even though the
    // writer never completes its shutdown.
    stdin.close().await;
    assert!(hung.load(Ordering::SeqCst));

    // Still idempotent afterwards.
    stdin.close().await;
    assert!(stdin.write_all(b"x").await.is_err());
  }
}
