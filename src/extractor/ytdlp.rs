use std::{path::PathBuf, process::Stdio, sync::Arc};

use async_trait::async_trait;
use tokio::{
  io::{AsyncBufReadExt, AsyncReadExt, BufReader},
  process::Command,
  sync::{mpsc, Semaphore},
};
use tracing::{debug, info};

use crate::{
  config::{redact_proxy, YtdlpConfig},
  Error, Result,
};

use super::{DownloadEvent, DownloadRequest, Extractor, MediaInfo, PostProcess};

const PROGRESS_PREFIX: &str = "[broker-progress]";

// downloaded|total|estimate|status, "NA" for unknown fields
const PROGRESS_TEMPLATE: &str = "download:[broker-progress] %(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.status)s";

// run yt-dlp command line for metadata lookups and downloads.
// requires yt-dlp (and ffmpeg for post-processing) to be installed.
pub struct Ytdlp {
  program: PathBuf,
  proxy: Option<String>,
  // ensure only a limited set of ytdlp processes at a time
  permits: Arc<Semaphore>,
}

impl Ytdlp {
  pub fn new(config: &YtdlpConfig) -> Self {
    if let Some(proxy) = &config.proxy {
      info!("yt-dlp using proxy: {}", redact_proxy(proxy));
    }

    Self {
      program: config.program.clone(),
      proxy: config.proxy.clone(),
      permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
    }
  }

  fn command(&self) -> Command {
    let mut cmd = Command::new(&self.program);
    cmd.arg("--no-playlist").arg("--no-warnings");
    if let Some(proxy) = &self.proxy {
      cmd.arg("--proxy").arg(proxy);
    }
    cmd.kill_on_drop(true);
    cmd
  }
}

#[async_trait]
impl Extractor for Ytdlp {
  async fn lookup(&self, url: &str) -> Result<MediaInfo> {
    let mut cmd = self.command();
    cmd.arg("--dump-single-json").arg("--skip-download").arg(url);

    let guard = self.permits.acquire().await.map_err(|_| {
      Error::Internal("yt-dlp semaphore closed".to_string())
    })?;
    let output = cmd.output().await?;
    drop(guard);

    if !output.status.success() {
      return Err(Error::Extraction(format!(
        "Failed to extract video info: {}",
        error_message(&output.stderr)
      )));
    }

    let mut media: MediaInfo = serde_json::from_slice(&output.stdout)?;
    // only formats with an accessible url are useful to anyone
    media.formats.retain(|f| f.has_url());
    Ok(media)
  }

  async fn download(
    &self,
    request: DownloadRequest,
    events: mpsc::Sender<DownloadEvent>,
  ) -> Result<()> {
    let mut cmd = self.command();
    cmd
      .arg("-f")
      .arg(&request.format)
      .arg("--newline")
      .arg("--no-mtime")
      .arg("--progress-template")
      .arg(PROGRESS_TEMPLATE)
      .arg("-o")
      .arg(&request.output_template);

    match &request.post_process {
      PostProcess::None => {}
      PostProcess::ExtractAudio { codec, quality } => {
        cmd.arg("-x").arg("--audio-format").arg(codec);
        if let Some(kbps) = quality {
          cmd.arg("--audio-quality").arg(format!("{kbps}K"));
        }
      }
      PostProcess::RemuxVideo(container) => {
        cmd.arg("--remux-video").arg(container);
      }
      PostProcess::RecodeVideo(container) => {
        cmd.arg("--recode-video").arg(container);
      }
    }

    cmd
      .arg(&request.url)
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());

    let guard = self.permits.acquire().await.map_err(|_| {
      Error::Internal("yt-dlp semaphore closed".to_string())
    })?;
    debug!("downloading {} with format {}", request.url, request.format);

    let mut child = cmd.spawn()?;
    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| Error::Internal("yt-dlp stdout not captured".into()))?;
    let mut err_pipe = child
      .stderr
      .take()
      .ok_or_else(|| Error::Internal("yt-dlp stderr not captured".into()))?;

    let read_progress = async {
      let mut lines = BufReader::new(stdout).lines();
      while let Some(line) = lines.next_line().await? {
        match parse_progress_line(&line) {
          // a closed receiver only means nobody is listening anymore
          Some(event) => {
            events.send(event).await.ok();
          }
          None => debug!("yt-dlp: {}", line),
        }
      }
      Ok::<_, std::io::Error>(())
    };
    let read_stderr = async {
      let mut buf = Vec::new();
      err_pipe.read_to_end(&mut buf).await.map(|_| buf)
    };

    let (progress, stderr) = tokio::join!(read_progress, read_stderr);
    let status = child.wait().await?;
    drop(guard);
    progress?;
    let stderr = stderr?;

    if !status.success() {
      return Err(Error::Extraction(error_message(&stderr)));
    }

    Ok(())
  }
}

fn parse_count(field: &str) -> Option<u64> {
  // estimates are reported as floats
  field.trim().parse::<f64>().ok().map(|n| n.max(0.0) as u64)
}

/// Parses one line printed through `PROGRESS_TEMPLATE`.
fn parse_progress_line(line: &str) -> Option<DownloadEvent> {
  let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?.trim();
  let mut fields = rest.split('|');
  let downloaded = fields.next()?;
  let total = fields.next()?;
  let estimate = fields.next()?;
  let status = fields.next()?.trim();

  match status {
    "finished" => Some(DownloadEvent::Finished),
    "downloading" => Some(DownloadEvent::Progress {
      downloaded: parse_count(downloaded)?,
      total: parse_count(total).or_else(|| parse_count(estimate)),
    }),
    _ => None,
  }
}

/// The `ERROR:` lines yt-dlp printed, or its last words if there were none.
fn error_message(stderr: &[u8]) -> String {
  let s = String::from_utf8_lossy(stderr);
  let errors: Vec<&str> = s
    .lines()
    .filter_map(|line| line.trim().strip_prefix("ERROR:"))
    .map(str::trim)
    .collect();

  if !errors.is_empty() {
    return errors.join("; ");
  }

  s.lines()
    .map(str::trim)
    .filter(|line| !line.is_empty())
    .last()
    .unwrap_or("yt-dlp exited without output")
    .to_string()
}
