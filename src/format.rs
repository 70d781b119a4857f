use std::cmp::Ordering;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One encoding offered by the source platform, as reported by yt-dlp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateFormat {
  pub format_id: String,
  pub ext: String,
  pub acodec: Option<String>,
  pub vcodec: Option<String>,
  pub abr: Option<f64>,
  pub vbr: Option<f64>,
  pub tbr: Option<f64>,
  pub width: Option<u32>,
  pub height: Option<u32>,
  pub fps: Option<f64>,
  pub filesize: Option<u64>,
  pub filesize_approx: Option<u64>,
  pub url: Option<String>,
  pub format_note: Option<String>,
}

fn codec_present(codec: &Option<String>) -> bool {
  codec
    .as_deref()
    .map_or(false, |c| !c.is_empty() && c != "none")
}

impl CandidateFormat {
  pub fn has_audio(&self) -> bool {
    codec_present(&self.acodec)
  }

  pub fn has_video(&self) -> bool {
    codec_present(&self.vcodec)
  }

  pub fn has_url(&self) -> bool {
    self.url.as_deref().map_or(false, |u| !u.is_empty())
  }

  pub fn video_bitrate(&self) -> f64 {
    self.vbr.or(self.tbr).unwrap_or(0.0)
  }

  pub fn estimated_size(&self) -> Option<u64> {
    self.filesize.or(self.filesize_approx)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
  #[default]
  Audio,
  Video,
}

pub const AUDIO_CONTAINERS: &[&str] = &["mp3", "wav", "flac", "aac"];
pub const VIDEO_CONTAINERS: &[&str] = &["mp4", "webm", "mkv"];

const AUDIO_CONTAINER_GROUP: &[&str] = &["mp3", "m4a", "aac"];
const VIDEO_CONTAINER_GROUP: &[&str] = &["mp4", "webm", "mkv"];

/// Bitrate ceiling in kbps; unknown tiers mean 320k.
pub fn audio_ceiling(tier: &str) -> u32 {
  match tier {
    "128k" => 128,
    "256k" => 256,
    _ => 320,
  }
}

/// Height ceiling in pixels; unknown tiers mean 720p.
pub fn video_ceiling(tier: &str) -> u32 {
  match tier {
    "480p" => 480,
    "1080p" => 1080,
    "1440p" => 1440,
    "2160p" => 2160,
    _ => 720,
  }
}

/// What the user asked for: a media kind, a container and a quality tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preference {
  pub kind: MediaKind,
  pub container: String,
  pub quality: String,
}

impl Preference {
  pub fn audio(
    container: impl Into<String>,
    quality: impl Into<String>,
  ) -> Self {
    Self {
      kind: MediaKind::Audio,
      container: container.into(),
      quality: quality.into(),
    }
  }

  pub fn video(
    container: impl Into<String>,
    quality: impl Into<String>,
  ) -> Self {
    Self {
      kind: MediaKind::Video,
      container: container.into(),
      quality: quality.into(),
    }
  }

  pub fn ceiling(&self) -> u32 {
    match self.kind {
      MediaKind::Audio => audio_ceiling(&self.quality),
      MediaKind::Video => video_ceiling(&self.quality),
    }
  }

  // audio-only for audio requests, muxed audio+video for video requests
  fn codecs_match(&self, format: &CandidateFormat) -> bool {
    match self.kind {
      MediaKind::Audio => format.has_audio() && !format.has_video(),
      MediaKind::Video => format.has_audio() && format.has_video(),
    }
  }

  fn carries_relevant_codec(&self, format: &CandidateFormat) -> bool {
    match self.kind {
      MediaKind::Audio => format.has_audio(),
      MediaKind::Video => format.has_video(),
    }
  }

  fn within_ceiling(&self, format: &CandidateFormat) -> bool {
    let ceiling = f64::from(self.ceiling());
    match self.kind {
      MediaKind::Audio => format.abr.unwrap_or(0.0) <= ceiling,
      MediaKind::Video => f64::from(format.height.unwrap_or(0)) <= ceiling,
    }
  }

  fn container_rank(&self, format: &CandidateFormat) -> u8 {
    let group = match self.kind {
      MediaKind::Audio => AUDIO_CONTAINER_GROUP,
      MediaKind::Video => VIDEO_CONTAINER_GROUP,
    };
    if format.ext == self.container {
      0
    } else if group.contains(&format.ext.as_str()) {
      1
    } else {
      2
    }
  }

  // descending by quality: bitrate for audio, (height, bitrate) for video
  fn by_quality_desc(
    &self,
    a: &CandidateFormat,
    b: &CandidateFormat,
  ) -> Ordering {
    match self.kind {
      MediaKind::Audio => {
        let (qa, qb) = (a.abr.unwrap_or(0.0), b.abr.unwrap_or(0.0));
        qb.total_cmp(&qa)
      }
      MediaKind::Video => b
        .height
        .unwrap_or(0)
        .cmp(&a.height.unwrap_or(0))
        .then_with(|| b.video_bitrate().total_cmp(&a.video_bitrate())),
    }
  }
}

/// Picks exactly one candidate for `preference`, or fails with
/// `NoSuitableFormat`.
///
/// An explicit format id bypasses the heuristics. Otherwise three tiers are
/// tried in order: exact container with matching codecs under the quality
/// ceiling, any container with matching codecs under the ceiling (ranked by
/// container family), and finally anything carrying the relevant codec.
/// Sorting is stable so ties resolve to the earlier candidate.
pub fn select_format<'a>(
  formats: &'a [CandidateFormat],
  preference: &Preference,
  explicit_id: Option<&str>,
) -> Result<&'a CandidateFormat> {
  let chosen = match explicit_id.filter(|id| !id.is_empty()) {
    Some(id) => formats.iter().find(|f| f.format_id == id),
    None => exact_container(formats, preference)
      .or_else(|| ranked_container(formats, preference))
      .or_else(|| any_codec(formats, preference)),
  };

  chosen
    .filter(|f| f.has_url())
    .ok_or(Error::NoSuitableFormat)
}

fn exact_container<'a>(
  formats: &'a [CandidateFormat],
  preference: &Preference,
) -> Option<&'a CandidateFormat> {
  formats
    .iter()
    .filter(|f| f.ext == preference.container)
    .filter(|f| preference.codecs_match(f))
    .filter(|f| preference.within_ceiling(f))
    .sorted_by(|a, b| preference.by_quality_desc(a, b))
    .next()
}

fn ranked_container<'a>(
  formats: &'a [CandidateFormat],
  preference: &Preference,
) -> Option<&'a CandidateFormat> {
  formats
    .iter()
    .filter(|f| preference.codecs_match(f))
    .filter(|f| preference.within_ceiling(f))
    .sorted_by(|a, b| {
      preference
        .container_rank(a)
        .cmp(&preference.container_rank(b))
        .then_with(|| preference.by_quality_desc(a, b))
    })
    .next()
}

fn any_codec<'a>(
  formats: &'a [CandidateFormat],
  preference: &Preference,
) -> Option<&'a CandidateFormat> {
  formats
    .iter()
    .filter(|f| preference.carries_relevant_codec(f) && f.has_url())
    .sorted_by(|a, b| preference.by_quality_desc(a, b))
    .next()
}
