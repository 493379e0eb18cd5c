use anyhow::{Context, anyhow};
use command::run_shell_command;
use dockhand_client::entities::deploy::{DeployEvent, DeployPhase};
use progress::DeployTracker;
use serde::{Deserialize, Serialize};
use tokio::{
  io::{AsyncBufReadExt, BufReader},
  sync::mpsc,
  task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::config::dockhand_config;

use super::{
  DockerClient,
  logs::{LogParams, SourceLine},
  pull::LineWriter,
};

pub fn docker_compose() -> &'static str {
  if dockhand_config().legacy_compose_cli {
    "docker-compose"
  } else {
    "docker compose"
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeProject {
  pub name: String,
  pub status: String,
  pub compose_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DockerComposeLsItem {
  #[serde(default, alias = "Name")]
  pub name: String,
  #[serde(default, alias = "Status")]
  pub status: String,
  #[serde(default, alias = "ConfigFiles")]
  pub config_files: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DockerComposePsItem {
  #[serde(default, alias = "Service")]
  pub service: String,
  #[serde(default, alias = "State")]
  pub state: String,
  #[serde(default, alias = "Health")]
  pub health: String,
  #[serde(default, alias = "Status")]
  pub status: String,
}

impl DockerClient {
  /// `DOCKER_HOST=...` prefix pointing the compose CLI at this
  /// environment's engine. Empty for the local engine.
  fn docker_host_prefix(&self) -> String {
    if self.address.is_empty() {
      String::new()
    } else {
      let host = self
        .address
        .replacen("https://", "tcp://", 1)
        .replacen("http://", "tcp://", 1);
      format!("DOCKER_HOST={host} ")
    }
  }

  pub async fn list_compose_projects(
    &self,
  ) -> anyhow::Result<Vec<ComposeProject>> {
    let docker_compose = docker_compose();
    let res = run_shell_command(
      &format!(
        "{}{docker_compose} ls --all --format json",
        self.docker_host_prefix()
      ),
      None,
    )
    .await;

    if !res.success() {
      return Err(anyhow!("{}", res.combined()).context(format!(
        "Failed to list compose projects using {docker_compose} ls"
      )));
    }

    let res =
      serde_json::from_str::<Vec<DockerComposeLsItem>>(&res.stdout)
        .with_context(|| res.stdout.clone())
        .with_context(|| {
          format!(
            "Failed to parse '{docker_compose} ls' response from json"
          )
        })?
        .into_iter()
        .filter(|item| !item.name.is_empty())
        .map(|item| ComposeProject {
          name: item.name,
          status: item.status,
          compose_files: item
            .config_files
            .split(',')
            .map(str::to_string)
            .collect(),
        })
        .collect();

    Ok(res)
  }

  pub async fn find_compose_project(
    &self,
    project: &str,
  ) -> anyhow::Result<ComposeProject> {
    self
      .list_compose_projects()
      .await?
      .into_iter()
      .find(|candidate| candidate.name == project)
      .with_context(|| {
        format!(
          "No compose project named {project} in environment {}",
          self.environment
        )
      })
  }

  /// The images of every service in the project, via
  /// `docker compose config --images`.
  pub async fn project_images(
    &self,
    project: &str,
  ) -> anyhow::Result<Vec<String>> {
    let compose_project = self.find_compose_project(project).await?;
    let res = run_shell_command(
      &format!(
        "{}{} {} config --images",
        self.docker_host_prefix(),
        docker_compose(),
        file_args(&compose_project),
      ),
      None,
    )
    .await;
    if !res.success() {
      return Err(anyhow!("{}", res.combined()).context(format!(
        "Failed to list images for compose project {project}"
      )));
    }
    Ok(
      res
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect(),
    )
  }

  /// Follow a compose project's logs, sending each line (already
  /// `service | ` prefixed by the compose CLI) into `out`.
  pub async fn stream_project_logs(
    &self,
    project: &str,
    params: &LogParams,
    out: &mpsc::UnboundedSender<SourceLine>,
    cancel: &CancellationToken,
  ) -> anyhow::Result<()> {
    let compose_project = self.find_compose_project(project).await?;

    let mut command = format!(
      "{}{} {} -p {} logs --no-color --tail {}",
      self.docker_host_prefix(),
      docker_compose(),
      file_args(&compose_project),
      compose_project.name,
      sanitize_tail(&params.tail),
    );
    if params.follow {
      command.push_str(" --follow");
    }
    if params.timestamps {
      command.push_str(" --timestamps");
    }
    // Client input, only a strict timestamp/duration shape may
    // enter the shell command.
    if let Some(since) =
      params.since.as_deref().and_then(sanitize_since)
    {
      command.push_str(&format!(" --since {since}"));
    }

    let mut child = command::spawn_shell_command(&command, None)
      .context("Failed to spawn compose logs")?;
    let stdout = child
      .stdout
      .take()
      .context("Compose logs child missing stdout")?;
    let stderr = child
      .stderr
      .take()
      .context("Compose logs child missing stderr")?;

    type Reader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;
    let mut readers = JoinSet::new();
    let streams: [(bool, Reader); 2] =
      [(false, Box::new(stdout)), (true, Box::new(stderr))];
    for (stderr_stream, reader) in streams {
      let out = out.clone();
      let cancel = cancel.clone();
      readers.spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
          let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
          };
          match line {
            Ok(Some(text)) => {
              if out
                .send(SourceLine {
                  stderr: stderr_stream,
                  text,
                })
                .is_err()
              {
                break;
              }
            }
            Ok(None) | Err(_) => break,
          }
        }
      });
    }
    while readers.join_next().await.is_some() {}

    // Killed on drop when cancelled mid-follow.
    if !cancel.is_cancelled() {
      let _ = child.wait().await;
    }
    Ok(())
  }

  /// Deploy a compose project: pull service images (engine
  /// events forwarded verbatim), run `compose up`, then report
  /// final per-service states. All frames go through `writer`
  /// as newline delimited JSON.
  pub async fn deploy_project(
    &self,
    project: &str,
    writer: &LineWriter,
  ) -> anyhow::Result<()> {
    let compose_project = self.find_compose_project(project).await?;

    writer
      .write_status(&format!("starting deploy of {project}"))
      .await?;
    writer.write_json(&DeployEvent::phase(DeployPhase::Begin)).await?;

    self
      .pull_images(project, writer, &dockhand_config().registries)
      .await?;

    let mut tracker = DeployTracker::default();
    self
      .compose_up(&compose_project, writer, &mut tracker)
      .await?;

    // Final state of every service, compose `ps`.
    for item in self.compose_ps(&compose_project).await? {
      let mut event = DeployEvent::service(
        DeployPhase::ServiceState,
        &item.service,
      );
      event.state = Some(item.state);
      if !item.health.is_empty() {
        event.health = Some(item.health);
      }
      if !item.status.is_empty() {
        event.status = Some(item.status);
      }
      tracker.update(&event);
      writer.write_json(&event).await?;
    }

    debug!(
      project,
      status = %tracker.display_status(),
      "deploy finished"
    );
    writer
      .write_json(&DeployEvent::phase(DeployPhase::Complete))
      .await?;
    Ok(())
  }

  async fn compose_up(
    &self,
    project: &ComposeProject,
    writer: &LineWriter,
    tracker: &mut DeployTracker,
  ) -> anyhow::Result<()> {
    let command = format!(
      "{}{} {} -p {} up -d --remove-orphans --progress plain",
      self.docker_host_prefix(),
      docker_compose(),
      file_args(project),
      project.name,
    );
    let mut child = command::spawn_shell_command(&command, None)
      .context("Failed to spawn compose up")?;
    // Plain progress goes to stderr, one transition per line.
    let stderr = child
      .stderr
      .take()
      .context("Compose up child missing stderr")?;
    drop(child.stdout.take());

    let mut tail = Vec::new();
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      tail.push(line.clone());
      if tail.len() > 20 {
        tail.remove(0);
      }
      if let Some(event) =
        parse_compose_progress_line(&line, &project.name)
      {
        tracker.update(&event);
        writer.write_json(&event).await?;
      }
    }

    let status = child
      .wait()
      .await
      .context("Failed to wait for compose up")?;
    if !status.success() {
      return Err(
        anyhow!("{}", tail.join("\n"))
          .context(format!("compose up failed for {}", project.name)),
      );
    }
    Ok(())
  }

  async fn compose_ps(
    &self,
    project: &ComposeProject,
  ) -> anyhow::Result<Vec<DockerComposePsItem>> {
    let res = run_shell_command(
      &format!(
        "{}{} {} -p {} ps --all --format json",
        self.docker_host_prefix(),
        docker_compose(),
        file_args(project),
        project.name,
      ),
      None,
    )
    .await;
    if !res.success() {
      return Err(anyhow!("{}", res.combined()).context(format!(
        "Failed to list services of compose project {}",
        project.name
      )));
    }
    // One JSON object per line.
    Ok(
      res
        .stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect(),
    )
  }
}

fn sanitize_tail(tail: &str) -> &str {
  if tail == "all" || tail.chars().all(|c| c.is_ascii_digit()) {
    tail
  } else {
    "100"
  }
}

fn sanitize_since(since: &str) -> Option<&str> {
  let valid = !since.is_empty()
    && since.chars().all(|c| {
      c.is_ascii_alphanumeric()
        || matches!(c, ':' | '+' | '-' | '.')
    });
  valid.then_some(since)
}

fn file_args(project: &ComposeProject) -> String {
  project
    .compose_files
    .iter()
    .map(|file| format!("-f {file}"))
    .collect::<Vec<_>>()
    .join(" ")
}

/// Parse one `--progress plain` transition line, eg
/// ` Container myproj-web-1  Waiting` into a deploy phase event.
fn parse_compose_progress_line(
  line: &str,
  project: &str,
) -> Option<DeployEvent> {
  let mut tokens = line.split_whitespace();
  if tokens.next()? != "Container" {
    return None;
  }
  let container = tokens.next()?;
  let transition = tokens.next()?;
  let service = service_from_container(container, project);

  let event = match transition {
    "Waiting" => DeployEvent::service(
      DeployPhase::ServiceWaitingHealthy,
      service,
    ),
    "Healthy" => {
      DeployEvent::service(DeployPhase::ServiceHealthy, service)
    }
    "Error" => {
      let mut event =
        DeployEvent::service(DeployPhase::ServiceStatus, service);
      event.error = Some(line.trim().to_string());
      event
    }
    transition => {
      let mut event =
        DeployEvent::service(DeployPhase::ServiceStatus, service);
      event.status = Some(transition.to_string());
      event
    }
  };
  Some(event)
}

/// `myproj-web-1` -> `web`.
fn service_from_container(container: &str, project: &str) -> String {
  let rest = container
    .strip_prefix(project)
    .and_then(|rest| rest.strip_prefix(['-', '_']))
    .unwrap_or(container);
  match rest.rsplit_once(['-', '_']) {
    Some((service, index))
      if index.chars().all(|c| c.is_ascii_digit()) =>
    {
      service.to_string()
    }
    _ => rest.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn service_name_strips_project_and_replica() {
    assert_eq!(
      service_from_container("myproj-web-1", "myproj"),
      "web"
    );
    assert_eq!(
      service_from_container("myproj_db_2", "myproj"),
      "db"
    );
    assert_eq!(
      service_from_container("standalone", "myproj"),
      "standalone"
    );
  }

  #[test]
  fn shell_bound_args_are_sanitized() {
    assert_eq!(sanitize_tail("250"), "250");
    assert_eq!(sanitize_tail("all"), "all");
    assert_eq!(sanitize_tail("100; rm -rf /"), "100");
    assert_eq!(
      sanitize_since("2024-06-01T12:00:00Z"),
      Some("2024-06-01T12:00:00Z")
    );
    assert_eq!(sanitize_since("10m"), Some("10m"));
    assert_eq!(sanitize_since("$(reboot)"), None);
    assert_eq!(sanitize_since(""), None);
  }

  #[test]
  fn progress_line_maps_to_phases() {
    let event = parse_compose_progress_line(
      " Container myproj-web-1  Waiting",
      "myproj",
    )
    .unwrap();
    assert_eq!(event.phase, DeployPhase::ServiceWaitingHealthy);
    assert_eq!(event.service.as_deref(), Some("web"));

    let event = parse_compose_progress_line(
      " Container myproj-web-1  Healthy",
      "myproj",
    )
    .unwrap();
    assert_eq!(event.phase, DeployPhase::ServiceHealthy);

    let event = parse_compose_progress_line(
      " Container myproj-db-1  Started",
      "myproj",
    )
    .unwrap();
    assert_eq!(event.phase, DeployPhase::ServiceStatus);
    assert_eq!(event.status.as_deref(), Some("Started"));

    assert!(
      parse_compose_progress_line(
        " Network myproj_default  Creating",
        "myproj"
      )
      .is_none()
    );
  }
}
