use axum::{
  Json, Router,
  http::{HeaderName, HeaderValue, StatusCode},
  response::{IntoResponse, Response},
  routing::get,
};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::cors_layer;

mod deploy;

pub fn app() -> Router {
  Router::new()
    .route("/version", get(|| async { env!("CARGO_PKG_VERSION") }))
    .route("/environments", get(list_environments))
    .nest("/ws", crate::ws::router())
    .nest("/stream", deploy::router())
    .layer(cors_layer())
    .layer(SetResponseHeaderLayer::overriding(
      HeaderName::from_static("x-content-type-options"),
      HeaderValue::from_static("nosniff"),
    ))
    .layer(SetResponseHeaderLayer::overriding(
      HeaderName::from_static("x-frame-options"),
      HeaderValue::from_static("DENY"),
    ))
}

async fn list_environments() -> Response {
  Json(crate::state::environments().names()).into_response()
}

/// Client fault envelope used by the stream endpoints before
/// any upgrade happens.
pub fn bad_request(message: impl std::fmt::Display) -> Response {
  (
    StatusCode::BAD_REQUEST,
    Json(serde_json::json!({
      "success": false,
      "error": message.to_string(),
    })),
  )
    .into_response()
}
