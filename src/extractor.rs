mod ytdlp;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
  format::CandidateFormat,
  task::VideoInfo,
  Result,
};

pub use ytdlp::Ytdlp;

/// Metadata for one media resource, looked up without downloading it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaInfo {
  pub title: Option<String>,
  pub uploader: Option<String>,
  pub duration: Option<f64>,
  pub thumbnail: Option<String>,
  pub description: Option<String>,
  pub upload_date: Option<String>,
  pub view_count: Option<u64>,
  pub webpage_url: Option<String>,
  pub formats: Vec<CandidateFormat>,
}

impl MediaInfo {
  pub fn title(&self) -> &str {
    self.title.as_deref().unwrap_or("Unknown")
  }

  pub fn uploader(&self) -> &str {
    self.uploader.as_deref().unwrap_or("Unknown")
  }

  pub fn video_info(&self) -> VideoInfo {
    VideoInfo {
      title: self.title().to_string(),
      uploader: self.uploader().to_string(),
      duration: self.duration,
      thumbnail: self.thumbnail.clone(),
      upload_date: self.upload_date.clone(),
      view_count: self.view_count,
      description: VideoInfo::truncate_description(
        self.description.as_deref().unwrap_or_default(),
      ),
    }
  }
}

/// Post-processing applied by the extraction tool once the download is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcess {
  None,
  ExtractAudio {
    codec: String,
    // kbps; lossless codecs carry none
    quality: Option<u32>,
  },
  RemuxVideo(String),
  RecodeVideo(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
  pub url: String,
  // yt-dlp format selector expression, e.g. `140/bestaudio/best`
  pub format: String,
  pub output_template: PathBuf,
  pub post_process: PostProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEvent {
  Progress { downloaded: u64, total: Option<u64> },
  Finished,
}

#[async_trait]
pub trait Extractor: Send + Sync {
  async fn lookup(&self, url: &str) -> Result<MediaInfo>;

  /// Runs the download, reporting samples on `events` until it returns.
  async fn download(
    &self,
    request: DownloadRequest,
    events: mpsc::Sender<DownloadEvent>,
  ) -> Result<()>;
}

#[cfg(test)]
pub mod testing {
  use std::sync::Arc;

  use tokio::sync::Notify;

  use super::*;
  use crate::Error;

  /// A scripted extractor: `lookup` can be held back by a gate and
  /// `download` writes a small file where yt-dlp would.
  #[derive(Default)]
  pub struct FakeExtractor {
    pub info: MediaInfo,
    pub lookup_error: Option<String>,
    pub download_error: Option<String>,
    pub output_ext: String,
    pub payload: Vec<u8>,
    pub gate: Option<Arc<Notify>>,
  }

  impl FakeExtractor {
    pub fn new(info: MediaInfo) -> Self {
      Self {
        info,
        output_ext: "mp3".to_string(),
        payload: b"0123456789abcdef".to_vec(),
        ..Default::default()
      }
    }
  }

  #[async_trait]
  impl Extractor for FakeExtractor {
    async fn lookup(&self, _url: &str) -> Result<MediaInfo> {
      if let Some(gate) = &self.gate {
        gate.notified().await;
      }
      match &self.lookup_error {
        Some(message) => Err(Error::Extraction(message.clone())),
        None => Ok(self.info.clone()),
      }
    }

    async fn download(
      &self,
      request: DownloadRequest,
      events: mpsc::Sender<DownloadEvent>,
    ) -> Result<()> {
      let total = self.payload.len() as u64;
      for downloaded in [0, total / 4, total / 2, total] {
        events
          .send(DownloadEvent::Progress {
            downloaded,
            total: Some(total),
          })
          .await
          .ok();
      }

      if let Some(message) = &self.download_error {
        return Err(Error::Extraction(message.clone()));
      }

      events.send(DownloadEvent::Finished).await.ok();

      let template = request.output_template.to_string_lossy().into_owned();
      let path = template
        .replace("%(title)s", self.info.title())
        .replace("%(ext)s", &self.output_ext);
      tokio::fs::write(path, &self.payload).await?;
      Ok(())
    }
  }

  pub fn sample_info() -> MediaInfo {
    let audio = CandidateFormat {
      format_id: "140".into(),
      ext: "m4a".into(),
      acodec: Some("mp4a.40.2".into()),
      vcodec: Some("none".into()),
      abr: Some(129.5),
      url: Some("https://cdn.example/140".into()),
      ..Default::default()
    };
    let muxed = CandidateFormat {
      format_id: "18".into(),
      ext: "mp4".into(),
      acodec: Some("mp4a.40.2".into()),
      vcodec: Some("avc1.42001E".into()),
      height: Some(360),
      width: Some(640),
      tbr: Some(500.0),
      url: Some("https://cdn.example/18".into()),
      ..Default::default()
    };

    MediaInfo {
      title: Some("Never: Gonna?".into()),
      uploader: Some("Rick".into()),
      duration: Some(212.0),
      thumbnail: Some("https://img.example/thumb.jpg".into()),
      description: Some("a song".into()),
      upload_date: Some("20091025".into()),
      view_count: Some(1_000_000),
      webpage_url: Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ".into()),
      formats: vec![audio, muxed],
    }
  }
}
