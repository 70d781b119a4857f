use std::{
  net::SocketAddr, path::PathBuf, str::FromStr, sync::LazyLock,
  time::Duration,
};

use regex::Regex;
use serde::Serialize;
use tracing::warn;

/// How a finished task hands its media to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
  /// The selected format's own URL is relayed, nothing is stored locally.
  DirectUrl,
  /// Media is downloaded (and transcoded) into the download directory.
  MaterializedFile,
}

impl FromStr for Mode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "direct" | "direct_url" | "stream" => Ok(Mode::DirectUrl),
      "file" | "materialized_file" | "download" => Ok(Mode::MaterializedFile),
      other => Err(format!("unknown broker mode: {other}")),
    }
  }
}

#[derive(Debug, Clone)]
pub struct YtdlpConfig {
  pub program: PathBuf,
  // number of yt-dlp processes allowed to run at the same time
  pub concurrency: usize,
  pub proxy: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
  pub bind_addr: SocketAddr,
  pub mode: Mode,
  pub download_dir: PathBuf,
  pub allowed_origins: Vec<String>,
  pub cleanup_interval: Duration,
  pub file_max_age: Duration,
  // the sweeper evicts `evict_batch` tasks once the registry grows past this
  pub max_tasks: usize,
  pub evict_batch: usize,
  // hard bound enforced by the registry itself on insert
  pub task_capacity: usize,
  pub thumbnail_timeout: Duration,
  pub stream_timeout: Duration,
  pub ytdlp: YtdlpConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
      mode: Mode::MaterializedFile,
      download_dir: PathBuf::from("downloads"),
      allowed_origins: vec![
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:3000".to_string(),
      ],
      cleanup_interval: Duration::from_secs(3600),
      file_max_age: Duration::from_secs(7200),
      max_tasks: 100,
      evict_batch: 50,
      task_capacity: 1000,
      thumbnail_timeout: Duration::from_secs(10),
      stream_timeout: Duration::from_secs(30),
      ytdlp: YtdlpConfig {
        program: PathBuf::from("yt-dlp"),
        concurrency: 2,
        proxy: None,
      },
    }
  }
}

impl Config {
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let defaults = Self::default();
    let get = |key: &str| {
      lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    };

    let secs = |key: &str, default: Duration| {
      Duration::from_secs(parse_or(key, get(key), default.as_secs()))
    };

    let allowed_origins = get("ALLOWED_ORIGINS")
      .map(|v| {
        v.split(',')
          .map(|origin| origin.trim().to_string())
          .filter(|origin| !origin.is_empty())
          .collect()
      })
      .unwrap_or(defaults.allowed_origins);

    let ytdlp = YtdlpConfig {
      program: get("YTDLP_PATH")
        .map(PathBuf::from)
        .unwrap_or(defaults.ytdlp.program),
      concurrency: parse_or(
        "YTDLP_CONCURRENCY",
        get("YTDLP_CONCURRENCY"),
        defaults.ytdlp.concurrency,
      )
      .max(1),
      proxy: get("YTDLP_PROXY"),
    };

    Self {
      bind_addr: parse_or("BIND_ADDR", get("BIND_ADDR"), defaults.bind_addr),
      mode: parse_or("BROKER_MODE", get("BROKER_MODE"), defaults.mode),
      download_dir: get("DOWNLOAD_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.download_dir),
      allowed_origins,
      cleanup_interval: secs(
        "CLEANUP_INTERVAL_SECS",
        defaults.cleanup_interval,
      ),
      file_max_age: secs("FILE_MAX_AGE_SECS", defaults.file_max_age),
      max_tasks: parse_or("MAX_TASKS", get("MAX_TASKS"), defaults.max_tasks),
      evict_batch: parse_or(
        "EVICT_BATCH",
        get("EVICT_BATCH"),
        defaults.evict_batch,
      ),
      task_capacity: parse_or(
        "TASK_CAPACITY",
        get("TASK_CAPACITY"),
        defaults.task_capacity,
      )
      .max(1),
      thumbnail_timeout: secs(
        "THUMBNAIL_TIMEOUT_SECS",
        defaults.thumbnail_timeout,
      ),
      stream_timeout: secs("STREAM_TIMEOUT_SECS", defaults.stream_timeout),
      ytdlp,
    }
  }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> T
where
  T: FromStr,
  T::Err: std::fmt::Display,
{
  match value.map(|v| v.parse::<T>()) {
    Some(Ok(parsed)) => parsed,
    Some(Err(e)) => {
      warn!("ignoring invalid {}: {}", key, e);
      default
    }
    None => default,
  }
}

/// Strips credentials from a proxy url before it ends up in a log line.
pub fn redact_proxy(proxy: &str) -> String {
  static AUTH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"//[^:/@]+(:[^@]+)?@").expect("hard-coded regex")
  });
  AUTH_REGEX.replace(proxy, "//<REDACTED>@").into_owned()
}
