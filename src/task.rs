use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::format::{CandidateFormat, MediaKind, Preference};

const DESCRIPTION_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Extracting,
  Completed,
  Error,
}

/// Where a completed task's media lives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaskOutput {
  File {
    file_path: PathBuf,
    filename: String,
    file_size: u64,
  },
  Stream {
    stream_url: String,
    filename: String,
  },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatInfo {
  pub format_id: String,
  pub ext: String,
  pub media_type: MediaKind,
  pub quality: String,
  pub acodec: Option<String>,
  pub vcodec: Option<String>,
  pub abr: Option<f64>,
  pub vbr: Option<f64>,
  pub width: Option<u32>,
  pub height: Option<u32>,
  pub fps: Option<f64>,
  pub filesize: Option<u64>,
}

impl FormatInfo {
  pub fn new(format: &CandidateFormat, preference: &Preference) -> Self {
    Self {
      format_id: format.format_id.clone(),
      ext: format.ext.clone(),
      media_type: preference.kind,
      quality: preference.quality.clone(),
      acodec: format.acodec.clone(),
      vcodec: format.vcodec.clone(),
      abr: format.abr,
      vbr: format.vbr,
      width: format.width,
      height: format.height,
      fps: format.fps,
      filesize: format.estimated_size(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoInfo {
  pub title: String,
  pub uploader: String,
  pub duration: Option<f64>,
  pub thumbnail: Option<String>,
  pub upload_date: Option<String>,
  pub view_count: Option<u64>,
  pub description: String,
}

impl VideoInfo {
  pub fn truncate_description(description: &str) -> String {
    description.chars().take(DESCRIPTION_LIMIT).collect()
  }
}

/// One extraction job's tracked state.
///
/// Records are immutable snapshots: every change produces a new `Task` that
/// replaces the previous one in the registry wholesale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
  pub task_id: String,
  pub status: TaskStatus,
  pub progress: u8,
  pub message: String,
  pub created_at: DateTime<Utc>,
  #[serde(flatten, skip_serializing_if = "Option::is_none")]
  pub output: Option<TaskOutput>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub format_info: Option<FormatInfo>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub video_info: Option<VideoInfo>,
}

impl Task {
  pub fn extracting(task_id: impl Into<String>) -> Self {
    Self {
      task_id: task_id.into(),
      status: TaskStatus::Extracting,
      progress: 0,
      message: "Extracting media information...".to_string(),
      created_at: Utc::now(),
      output: None,
      format_info: None,
      video_info: None,
    }
  }

  pub fn is_completed(&self) -> bool {
    self.status == TaskStatus::Completed
  }

  pub fn is_terminal(&self) -> bool {
    self.status != TaskStatus::Extracting
  }

  pub fn file_path(&self) -> Option<&PathBuf> {
    match &self.output {
      Some(TaskOutput::File { file_path, .. }) => Some(file_path),
      _ => None,
    }
  }

  /// A progress update; progress never moves backwards while extracting and
  /// terminal tasks are left untouched.
  pub fn advanced(&self, progress: u8, message: impl Into<String>) -> Self {
    if self.is_terminal() {
      return self.clone();
    }

    Self {
      progress: progress.min(100).max(self.progress),
      message: message.into(),
      ..self.clone()
    }
  }

  pub fn completed(
    &self,
    output: TaskOutput,
    format_info: FormatInfo,
    video_info: VideoInfo,
  ) -> Self {
    Self {
      status: TaskStatus::Completed,
      progress: 100,
      message: "Download completed!".to_string(),
      output: Some(output),
      format_info: Some(format_info),
      video_info: Some(video_info),
      ..self.clone()
    }
  }

  pub fn failed(&self, details: impl std::fmt::Display) -> Self {
    Self {
      status: TaskStatus::Error,
      progress: 0,
      message: format!("Error: {details}"),
      output: None,
      format_info: None,
      video_info: None,
      ..self.clone()
    }
  }
}
