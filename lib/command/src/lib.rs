use std::{
  path::{Path, PathBuf},
  process::Stdio,
  sync::OnceLock,
};

mod output;

pub use output::*;
use tokio::process::{Child, Command};

/// Commands are run directly, and cannot include '&&'
pub async fn run_standard_command(
  command: &str,
  path: impl Into<Option<&Path>>,
) -> CommandOutput {
  let lexed = if let Some(lexed) = shlex::split(command)
    && !lexed.is_empty()
  {
    lexed
  } else {
    return CommandOutput::from_err(std::io::Error::other(
      "Command lexed into empty args",
    ));
  };

  let mut cmd = Command::new(&lexed[0]);

  cmd
    .args(&lexed[1..])
    .kill_on_drop(true)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

  if let Some(path) = path.into() {
    match path.canonicalize() {
      Ok(path) => {
        cmd.current_dir(path);
      }
      Err(e) => return CommandOutput::from_err(e),
    }
  }

  CommandOutput::from(cmd.output().await)
}

fn shell() -> &'static str {
  static DEFAULT_SHELL: OnceLock<String> = OnceLock::new();
  DEFAULT_SHELL.get_or_init(|| {
    if PathBuf::from("/bin/bash").exists()
      || PathBuf::from("/usr/bin/bash").exists()
    {
      String::from("bash")
    } else {
      String::from("sh")
    }
  })
}

/// Commands are wrapped in 'sh -c', and can include '&&'
pub async fn run_shell_command(
  command: &str,
  path: impl Into<Option<&Path>>,
) -> CommandOutput {
  let mut cmd = Command::new(shell());

  cmd
    .args(["-c", command])
    .kill_on_drop(true)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

  if let Some(path) = path.into() {
    match path.canonicalize() {
      Ok(path) => {
        cmd.current_dir(path);
      }
      Err(e) => return CommandOutput::from_err(e),
    }
  }

  CommandOutput::from(cmd.output().await)
}

/// Spawn a shell command with stdout / stderr piped, for callers
/// streaming the output line by line. The child is killed when
/// the handle drops.
pub fn spawn_shell_command<'a>(
  command: &str,
  path: impl Into<Option<&'a Path>>,
) -> std::io::Result<Child> {
  let mut cmd = Command::new(shell());

  cmd
    .args(["-c", command])
    .kill_on_drop(true)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

  if let Some(path) = path.into() {
    cmd.current_dir(path.canonicalize()?);
  }

  cmd.spawn()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn standard_command_captures_stdout() {
    let output = run_standard_command("echo hello", None).await;
    assert!(output.success());
    assert_eq!(output.stdout.trim(), "hello");
  }

  #[tokio::test]
  async fn shell_command_supports_chaining() {
    let output =
      run_shell_command("echo one && echo two", None).await;
    assert!(output.success());
    assert_eq!(output.stdout.trim(), "one\ntwo");
  }

  #[tokio::test]
  async fn failing_command_is_not_success() {
    let output = run_shell_command("exit 3", None).await;
    assert!(!output.success());
  }
}
