use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use typeshare::typeshare;

use crate::entities::U64;

/// One record of the Docker image pull stream, as emitted by the
/// engine (`application/x-json-stream`). Unknown fields are
/// preserved nowhere: engine frames are passed through verbatim,
/// this type only drives progress accounting.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullEvent {
  /// Layer id. Absent on stream-level status lines.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(
    default,
    rename = "progressDetail",
    skip_serializing_if = "Option::is_none"
  )]
  pub progress_detail: Option<ProgressDetail>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressDetail {
  #[serde(default)]
  pub current: U64,
  #[serde(default)]
  pub total: U64,
}

/// Compose deploy phases, ordered roughly by stream position.
#[typeshare]
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeployPhase {
  Begin,
  ServiceWaitingHealthy,
  ServiceHealthy,
  ServiceState,
  ServiceStatus,
  Complete,
}

/// A synthesized deploy-progress frame. Serialized as one line of
/// the newline delimited deploy stream, eg
/// `{"type":"deploy","phase":"service_state","service":"web","state":"running"}`.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployEvent {
  #[serde(rename = "type")]
  pub kind: String,
  pub phase: DeployPhase,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub service: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub state: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub health: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl DeployEvent {
  pub fn phase(phase: DeployPhase) -> DeployEvent {
    DeployEvent {
      kind: "deploy".to_string(),
      phase,
      service: None,
      state: None,
      health: None,
      status: None,
      error: None,
    }
  }

  pub fn service(
    phase: DeployPhase,
    service: impl Into<String>,
  ) -> DeployEvent {
    DeployEvent {
      service: Some(service.into()),
      ..DeployEvent::phase(phase)
    }
  }
}
