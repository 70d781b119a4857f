use std::{io::SeekFrom, path::Path as FsPath, sync::Arc};

use axum::{
  body::{boxed, Empty, StreamBody},
  extract::{Path, State},
  http::{self, header, HeaderMap, HeaderValue, StatusCode},
  response::{IntoResponse, Response},
  Json,
};
use itertools::Itertools;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{fs::File, io::AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::{
  config::Mode,
  extractor::Extractor,
  format::{MediaKind, Preference, AUDIO_CONTAINERS, VIDEO_CONTAINERS},
  registry::TaskRegistryRef,
  relay::Relay,
  runner::{JobRequest, JobRunner},
  task::{TaskOutput, TaskStatus},
  util::{content_disposition, ByteRange, ByteStream},
  validate::is_valid_url,
  Error, Result,
};

#[derive(Clone)]
pub struct AppState {
  pub runner: JobRunner,
  pub registry: TaskRegistryRef,
  pub extractor: Arc<dyn Extractor>,
  pub relay: Relay,
}

impl AppState {
  pub fn new(
    runner: JobRunner,
    registry: TaskRegistryRef,
    extractor: Arc<dyn Extractor>,
    relay: Relay,
  ) -> Self {
    Self {
      runner,
      registry,
      extractor,
      relay,
    }
  }

  fn mode(&self) -> Mode {
    self.runner.mode()
  }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ValidateRequest {
  url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Preferences {
  selected_audio_format: Option<String>,
  audio_quality: Option<String>,
  selected_video_format: Option<String>,
  video_quality: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExtractRequest {
  url: String,
  #[serde(rename = "type")]
  kind: Option<String>,
  format_id: Option<String>,
  preferences: Preferences,
}

fn require_url(url: &str) -> Result<&str> {
  let url = url.trim();
  if url.is_empty() {
    return Err(Error::MissingUrl);
  }
  if !is_valid_url(url) {
    return Err(Error::InvalidUrl(url.to_string()));
  }
  Ok(url)
}

// unsupported containers fall back to the kind's default
fn pick_container(requested: Option<&str>, supported: &[&str]) -> String {
  let default = supported[0];
  match requested.map(str::trim) {
    Some(c) if supported.contains(&c) => c.to_string(),
    Some(c) => {
      debug!("unsupported container {:?}, using {}", c, default);
      default.to_string()
    }
    None => default.to_string(),
  }
}

impl ExtractRequest {
  fn preference(&self) -> Preference {
    let prefs = &self.preferences;
    match self.kind.as_deref() {
      Some("video") => {
        let requested = prefs.selected_video_format.as_deref();
        Preference::video(
          pick_container(requested, VIDEO_CONTAINERS),
          prefs.video_quality.as_deref().unwrap_or("720p"),
        )
      }
      _ => {
        let requested = prefs.selected_audio_format.as_deref();
        Preference::audio(
          pick_container(requested, AUDIO_CONTAINERS),
          prefs.audio_quality.as_deref().unwrap_or("320k"),
        )
      }
    }
  }
}

pub async fn validate(
  State(state): State<AppState>,
  body: Option<Json<ValidateRequest>>,
) -> Result<Json<Value>> {
  let req = body.map(|Json(req)| req).unwrap_or_default();
  let url = require_url(&req.url)?;

  let info = state.extractor.lookup(url).await?;
  Ok(Json(json!({
    "valid": true,
    "info": {
      "title": info.title(),
      "uploader": info.uploader(),
      "duration": info.duration,
      "thumbnail": info.thumbnail,
      "description": info.description.as_deref().unwrap_or_default(),
      "upload_date": info.upload_date,
      "view_count": info.view_count,
      "webpage_url": info.webpage_url.as_deref().unwrap_or(url),
      "formats": info.formats,
    }
  })))
}

pub async fn extract(
  State(state): State<AppState>,
  body: Option<Json<ExtractRequest>>,
) -> Result<Json<Value>> {
  let req = body.map(|Json(req)| req).unwrap_or_default();
  let url = require_url(&req.url)?.to_string();
  let preference = req.preference();

  let mut quality = json!({
    "audioQuality": req.preferences.audio_quality.as_deref().unwrap_or("320k"),
  });
  if preference.kind == MediaKind::Video {
    quality["videoQuality"] = json!(preference.quality);
  }
  let container = preference.container.clone();

  let task_id = state
    .runner
    .submit(JobRequest {
      url,
      format_id: req.format_id.filter(|id| !id.is_empty()),
      preference,
    })
    .await?;

  Ok(Json(json!({
    "task_id": task_id,
    "message": format!("Media extraction started with format: {container}"),
    "preferences": {
      "format": container,
      "quality": quality,
    }
  })))
}

pub async fn status(
  State(state): State<AppState>,
  Path(task_id): Path<String>,
) -> Result<impl IntoResponse> {
  Ok(Json(state.registry.get(&task_id).await?))
}

/// Serves a completed task's media: the stored file, or a relay of the
/// selected format's URL.
pub async fn media(
  State(state): State<AppState>,
  Path(task_id): Path<String>,
  headers: HeaderMap,
) -> Result<Response> {
  let task = state.registry.get(&task_id).await?;
  if !task.is_completed() {
    return Err(Error::NotReady("Download not completed"));
  }

  match &task.output {
    Some(TaskOutput::File {
      file_path,
      filename,
      ..
    }) => {
      let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
      serve_file(file_path, filename, range).await
    }
    Some(TaskOutput::Stream {
      stream_url,
      filename,
    }) => {
      let mut resp = state
        .relay
        .proxy_stream(stream_url, headers.get(header::RANGE))
        .await?;
      resp
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, disposition(filename)?);
      Ok(resp)
    }
    None => Err(Error::NotFound("Downloaded file not found")),
  }
}

fn disposition(filename: &str) -> Result<HeaderValue> {
  HeaderValue::from_str(&content_disposition(filename))
    .map_err(|e| Error::Internal(e.to_string()))
}

async fn serve_file(
  path: &FsPath,
  filename: &str,
  range: Option<&str>,
) -> Result<Response> {
  let mut file = match File::open(path).await {
    Ok(file) => file,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
      return Err(Error::NotFound("Downloaded file not found"))
    }
    Err(e) => return Err(e.into()),
  };
  let size = file.metadata().await?.len();

  let builder = http::Response::builder()
    .header(header::CONTENT_TYPE, "application/octet-stream")
    .header(header::CONTENT_DISPOSITION, disposition(filename)?)
    .header(header::ACCEPT_RANGES, "bytes");

  let resp = match ByteRange::parse(range, size) {
    ByteRange::Full => builder
      .status(StatusCode::OK)
      .header(header::CONTENT_LENGTH, size)
      .body(boxed(StreamBody::new(ReaderStream::new(file)))),
    ByteRange::Partial { start, end } => {
      file.seek(SeekFrom::Start(start)).await?;
      let len = end - start + 1;
      let stream = ByteStream::new(ReaderStream::new(file)).limit_bytes(len);
      builder
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}"))
        .header(header::CONTENT_LENGTH, len)
        .body(boxed(StreamBody::new(stream)))
    }
    ByteRange::Unsatisfiable => builder
      .status(StatusCode::RANGE_NOT_SATISFIABLE)
      .header(header::CONTENT_RANGE, format!("bytes */{size}"))
      .body(boxed(Empty::new())),
  };

  resp.map_err(|e| Error::Internal(e.to_string()))
}

pub async fn thumbnail(
  State(state): State<AppState>,
  Path(task_id): Path<String>,
) -> Result<impl IntoResponse> {
  let task = state.registry.get(&task_id).await?;
  if !task.is_completed() {
    return Err(Error::NotReady("Extraction not completed"));
  }

  let url = task
    .video_info
    .and_then(|info| info.thumbnail)
    .filter(|url| !url.is_empty())
    .ok_or(Error::NotFound("Thumbnail not available"))?;

  let bytes = state.relay.fetch_thumbnail(&url).await.map_err(|e| {
    warn!("thumbnail fetch for {} failed: {}", task_id, e);
    Error::Internal("Failed to download thumbnail".into())
  })?;

  Ok((
    [
      (header::CONTENT_TYPE, "image/jpeg"),
      (header::CACHE_CONTROL, "public, max-age=3600"),
    ],
    bytes,
  ))
}

pub async fn health(State(state): State<AppState>) -> Result<Json<Value>> {
  let counts = state
    .registry
    .snapshot()
    .await?
    .iter()
    .counts_by(|task| task.status);

  Ok(Json(json!({
    "status": "healthy",
    "message": "Media broker is running",
    "mode": state.mode(),
    "tasks": {
      "extracting": counts.get(&TaskStatus::Extracting).copied().unwrap_or(0),
      "completed": counts.get(&TaskStatus::Completed).copied().unwrap_or(0),
      "error": counts.get(&TaskStatus::Error).copied().unwrap_or(0),
    },
  })))
}

pub async fn start_download() -> impl IntoResponse {
  (
    StatusCode::GONE,
    Json(json!({
      "error": "This endpoint is deprecated. Use /api/extract instead.",
      "message": "Media is now extracted with user preferences in a single request",
    })),
  )
}
