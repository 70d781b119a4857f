use axum::{
  response::{IntoResponse, Response},
  Json,
};
use reqwest::StatusCode;
use serde_json::json;
use tracing::warn;

#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("URL is required")]
  MissingUrl,
  #[error("Invalid YouTube or SoundCloud URL")]
  InvalidUrl(String),
  #[error("{0}")]
  NotFound(&'static str),
  #[error("{0}")]
  NotReady(&'static str),
  #[error("{0}")]
  Extraction(String),
  #[error("No suitable format found")]
  NoSuitableFormat,
  #[error("Failed to stream media: {0}")]
  Upstream(String),
  #[error("task registry is unavailable")]
  RegistryUnavailable,
  #[error("{0}")]
  Internal(String),
  #[error("IO error: {0}")]
  IO(#[from] std::io::Error),
  #[error("HTTP error: {0}")]
  Http(#[from] reqwest::Error),
  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  pub fn status_code(&self) -> StatusCode {
    match self {
      Error::MissingUrl | Error::InvalidUrl(_) | Error::NotReady(_) => {
        StatusCode::BAD_REQUEST
      }
      Error::NotFound(_) => StatusCode::NOT_FOUND,
      Error::Upstream(_) => StatusCode::BAD_GATEWAY,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = self.status_code();
    if status.is_server_error() {
      warn!("request failed: {}", self);
    }

    (status, Json(json!({ "error": self.to_string() }))).into_response()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_codes_follow_taxonomy() {
    assert_eq!(Error::MissingUrl.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(
      Error::InvalidUrl("x".into()).status_code(),
      StatusCode::BAD_REQUEST
    );
    assert_eq!(
      Error::NotReady("Download not completed").status_code(),
      StatusCode::BAD_REQUEST
    );
    assert_eq!(
      Error::NotFound("Task not found").status_code(),
      StatusCode::NOT_FOUND
    );
    assert_eq!(
      Error::Extraction("boom".into()).status_code(),
      StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(
      Error::NoSuitableFormat.status_code(),
      StatusCode::INTERNAL_SERVER_ERROR
    );
  }

  #[test]
  fn test_extraction_message_passes_through() {
    let err = Error::Extraction("Video unavailable".into());
    assert_eq!(err.to_string(), "Video unavailable");
  }
}
