//! Progress accounting for image pulls and compose deploys.
//!
//! [PullProgress] folds the engine's per-layer pull events into a
//! single 0..=100 aggregate. [DeployTracker] folds compose phase
//! events into the status text a UI should display.

use std::collections::BTreeMap;

use dockhand_client::entities::deploy::{
  DeployEvent, DeployPhase, PullEvent,
};
use indexmap::IndexMap;

/// Statuses marking a layer as done pulling.
pub const TERMINAL_LAYER_STATUSES: [&str; 3] =
  ["Pull complete", "Already exists", "Download complete"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerProgress {
  pub current: u64,
  pub total: u64,
  pub status: String,
}

impl LayerProgress {
  pub fn terminal(&self) -> bool {
    TERMINAL_LAYER_STATUSES
      .iter()
      .any(|status| self.status == *status)
  }
}

/// Aggregate progress of one image pull stream.
///
/// The reported aggregate is monotonic: late layer registrations
/// grow the denominator, which would otherwise make the raw ratio
/// dip backwards. It reaches 100 only once every known layer is in
/// a terminal status (capped at 99 before that).
#[derive(Debug, Default)]
pub struct PullProgress {
  layers: IndexMap<String, LayerProgress>,
  peak: u8,
}

impl PullProgress {
  pub fn update(&mut self, event: &PullEvent) {
    let Some(id) = event.id.as_deref() else {
      return;
    };
    let layer = self.layers.entry(id.to_string()).or_default();
    if let Some(status) = &event.status {
      layer.status = status.clone();
    }
    if let Some(detail) = &event.progress_detail {
      if detail.total > 0 {
        layer.total = detail.total;
      }
      layer.current = detail.current;
    }
  }

  /// 0 with no layers yet, 100 when every layer is terminal,
  /// otherwise the (monotonic) rounded ratio capped at 99.
  pub fn aggregate(&mut self) -> u8 {
    if self.layers.is_empty() {
      return self.peak;
    }
    if self.layers.values().all(LayerProgress::terminal) {
      self.peak = 100;
      return 100;
    }
    let (current, total) = self
      .layers
      .values()
      .filter(|layer| layer.total > 0)
      .fold((0u64, 0u64), |(current, total), layer| {
        (
          current + layer.current.min(layer.total),
          total + layer.total,
        )
      });
    if total > 0 {
      let ratio =
        ((current as f64 / total as f64) * 100.0).round() as u8;
      self.peak = self.peak.max(ratio.min(99));
    }
    self.peak
  }

  pub fn layers(&self) -> &IndexMap<String, LayerProgress> {
    &self.layers
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceDeployState {
  pub phase: Option<DeployPhase>,
  pub health: Option<String>,
  pub state: Option<String>,
  pub status: Option<String>,
}

/// Per-service deploy phase map with deterministic status-text
/// derivation. Waiting phases take priority over state issues,
/// which take priority over the last non-waiting line.
#[derive(Debug, Default)]
pub struct DeployTracker {
  services: BTreeMap<String, ServiceDeployState>,
  last_non_waiting_status: Option<String>,
}

impl DeployTracker {
  pub fn update(&mut self, event: &DeployEvent) {
    let Some(service) = event.service.as_deref() else {
      // begin / complete frames carry no service.
      return;
    };
    let state =
      self.services.entry(service.to_string()).or_default();
    state.phase = Some(event.phase);
    if let Some(health) = &event.health {
      state.health = Some(health.clone());
    }
    if let Some(container_state) = &event.state {
      state.state = Some(container_state.clone());
    }
    if let Some(status) = &event.status {
      state.status = Some(status.clone());
    }

    let non_waiting = match event.phase {
      DeployPhase::ServiceHealthy => {
        Some(format!("{service} healthy"))
      }
      DeployPhase::ServiceState => state
        .state
        .as_deref()
        .map(|container_state| {
          format!("{service} {container_state}")
        }),
      DeployPhase::ServiceStatus => state
        .status
        .as_deref()
        .map(|status| format!("{service}: {status}")),
      _ => None,
    };
    if let Some(non_waiting) = non_waiting {
      self.last_non_waiting_status = Some(non_waiting);
    }
  }

  pub fn service(&self, name: &str) -> Option<&ServiceDeployState> {
    self.services.get(name)
  }

  /// The status text a UI should display for the deploy.
  pub fn display_status(&self) -> String {
    // BTreeMap iteration gives the lexicographically first match.
    for (service, state) in &self.services {
      if state.phase == Some(DeployPhase::ServiceWaitingHealthy) {
        return match state.health.as_deref() {
          Some(health) => {
            format!("waiting for {service} to be healthy ({health})")
          }
          None => format!("waiting for {service} to be healthy"),
        };
      }
    }
    for (service, state) in &self.services {
      if state.phase == Some(DeployPhase::ServiceState)
        && state.state.as_deref() != Some("running")
      {
        let container_state =
          state.state.as_deref().unwrap_or("unknown");
        return format!("{service} {container_state}");
      }
    }
    self
      .last_non_waiting_status
      .clone()
      .unwrap_or_else(|| "deploying…".to_string())
  }
}

#[cfg(test)]
mod tests {
  use dockhand_client::entities::deploy::ProgressDetail;

  use super::*;

  fn pull_event(
    id: &str,
    current: u64,
    total: u64,
    status: Option<&str>,
  ) -> PullEvent {
    PullEvent {
      id: Some(id.to_string()),
      status: status.map(str::to_string),
      progress_detail: Some(ProgressDetail { current, total }),
      error: None,
    }
  }

  #[test]
  fn aggregate_starts_at_zero() {
    let mut progress = PullProgress::default();
    assert_eq!(progress.aggregate(), 0);
  }

  #[test]
  fn aggregate_is_monotonic_and_completes() {
    let mut progress = PullProgress::default();
    let events = [
      pull_event("l1", 50, 100, None),
      pull_event("l2", 0, 100, None),
      pull_event("l1", 100, 100, Some("Pull complete")),
      pull_event("l2", 100, 100, Some("Already exists")),
    ];
    let mut trace = Vec::new();
    for event in &events {
      progress.update(event);
      trace.push(progress.aggregate());
    }
    // Never decreases, even while new layers grow the denominator.
    assert!(trace.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(*trace.last().unwrap(), 100);
    // Not pinned to 100 until every layer is terminal.
    assert!(trace[2] < 100);
  }

  #[test]
  fn aggregate_caps_below_100_until_terminal() {
    let mut progress = PullProgress::default();
    progress.update(&pull_event("l1", 100, 100, None));
    assert_eq!(progress.aggregate(), 99);
    progress
      .update(&pull_event("l1", 100, 100, Some("Pull complete")));
    assert_eq!(progress.aggregate(), 100);
  }

  #[test]
  fn terminal_statuses_pin_to_100_without_totals() {
    let mut progress = PullProgress::default();
    for (id, status) in [
      ("l1", "Pull complete"),
      ("l2", "Already exists"),
      ("l3", "Download complete"),
    ] {
      progress.update(&PullEvent {
        id: Some(id.to_string()),
        status: Some(status.to_string()),
        progress_detail: None,
        error: None,
      });
    }
    assert_eq!(progress.aggregate(), 100);
  }

  #[test]
  fn events_without_id_are_ignored() {
    let mut progress = PullProgress::default();
    progress.update(&PullEvent {
      status: Some("Pulling from library/alpine".to_string()),
      ..Default::default()
    });
    assert!(progress.layers().is_empty());
  }

  fn deploy_event(
    phase: DeployPhase,
    service: &str,
  ) -> DeployEvent {
    DeployEvent::service(phase, service)
  }

  #[test]
  fn waiting_service_takes_priority() {
    let mut tracker = DeployTracker::default();

    let mut created = deploy_event(DeployPhase::ServiceState, "db");
    created.state = Some("created".to_string());
    tracker.update(&created);

    let mut waiting =
      deploy_event(DeployPhase::ServiceWaitingHealthy, "web");
    waiting.health = Some("starting".to_string());
    tracker.update(&waiting);

    assert_eq!(
      tracker.display_status(),
      "waiting for web to be healthy (starting)"
    );
  }

  #[test]
  fn non_running_state_beats_last_status() {
    let mut tracker = DeployTracker::default();

    let mut status =
      deploy_event(DeployPhase::ServiceStatus, "web");
    status.status = Some("Created".to_string());
    tracker.update(&status);

    let mut state = deploy_event(DeployPhase::ServiceState, "db");
    state.state = Some("restarting".to_string());
    tracker.update(&state);

    assert_eq!(tracker.display_status(), "db restarting");
  }

  #[test]
  fn running_services_fall_back_to_last_non_waiting() {
    let mut tracker = DeployTracker::default();

    let mut state = deploy_event(DeployPhase::ServiceState, "web");
    state.state = Some("running".to_string());
    tracker.update(&state);

    assert_eq!(tracker.display_status(), "web running");
  }

  #[test]
  fn empty_tracker_reports_deploying() {
    let tracker = DeployTracker::default();
    assert_eq!(tracker.display_status(), "deploying…");
  }

  #[test]
  fn lexicographically_first_waiting_service_wins() {
    let mut tracker = DeployTracker::default();
    for service in ["zeta", "alpha"] {
      tracker.update(&deploy_event(
        DeployPhase::ServiceWaitingHealthy,
        service,
      ));
    }
    assert_eq!(
      tracker.display_status(),
      "waiting for alpha to be healthy"
    );
  }
}
