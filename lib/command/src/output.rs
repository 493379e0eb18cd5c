use std::{
  io,
  os::unix::process::ExitStatusExt,
  process::{ExitStatus, Output},
};

#[derive(Debug, Clone)]
pub struct CommandOutput {
  pub status: ExitStatus,
  pub stdout: String,
  pub stderr: String,
}

impl CommandOutput {
  pub fn from(output: io::Result<Output>) -> Self {
    match output {
      Ok(output) => Self {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
      },
      Err(e) => CommandOutput::from_err(e),
    }
  }

  pub fn from_err(e: io::Error) -> Self {
    Self {
      status: ExitStatus::from_raw(1),
      stdout: "".to_string(),
      stderr: format!("{e:#}"),
    }
  }

  pub fn success(&self) -> bool {
    self.status.success()
  }

  /// Stdout and stderr concatenated, for error reporting.
  pub fn combined(&self) -> String {
    match (self.stdout.is_empty(), self.stderr.is_empty()) {
      (false, false) => {
        format!("{}\n{}", self.stdout, self.stderr)
      }
      (false, true) => self.stdout.clone(),
      (true, false) => self.stderr.clone(),
      (true, true) => String::new(),
    }
  }
}
