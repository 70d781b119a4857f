use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use tokio::{fs, sync::mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
  config::Mode,
  extractor::{
    DownloadEvent, DownloadRequest, Extractor, MediaInfo, PostProcess,
  },
  format::{select_format, CandidateFormat, MediaKind, Preference},
  registry::TaskRegistryRef,
  sweeper::discard_task_file,
  task::{FormatInfo, Task, TaskOutput},
  util::output_filename,
  Error, Result,
};

// the last fifth of the progress bar belongs to post-processing
const DOWNLOAD_PROGRESS_BAND: u64 = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
  pub url: String,
  pub format_id: Option<String>,
  pub preference: Preference,
}

/// Schedules extraction jobs and drives each one from lookup to a terminal
/// task state.
#[derive(Clone)]
pub struct JobRunner {
  registry: TaskRegistryRef,
  extractor: Arc<dyn Extractor>,
  mode: Mode,
  download_dir: PathBuf,
}

/// The owning job's view of its task. Every update is published to the
/// registry as a whole new record.
struct TaskHandle {
  registry: TaskRegistryRef,
  current: Task,
}

impl TaskHandle {
  async fn publish(&mut self, next: Task) {
    self.current = next.clone();
    match self.registry.replace(next).await {
      Ok(true) => {}
      Ok(false) => debug!("task {} was evicted mid-run", self.current.task_id),
      Err(e) => warn!("failed to publish task {}: {}", self.current.task_id, e),
    }
  }

  async fn progress(&mut self, progress: u8, message: impl Into<String>) {
    let next = self.current.advanced(progress, message);
    self.publish(next).await;
  }

  async fn report(&mut self, event: DownloadEvent) {
    match event {
      DownloadEvent::Progress {
        downloaded,
        total: Some(total),
      } if total > 0 => {
        let scaled = u128::from(downloaded.min(total))
          * u128::from(DOWNLOAD_PROGRESS_BAND)
          / u128::from(total);
        let progress = scaled as u8;
        self
          .progress(progress, format!("Downloading... {progress}%"))
          .await;
      }
      DownloadEvent::Progress { .. } => {}
      DownloadEvent::Finished => {
        self
          .progress(DOWNLOAD_PROGRESS_BAND as u8, "Processing...")
          .await;
      }
    }
  }
}

impl JobRunner {
  pub fn new(
    registry: TaskRegistryRef,
    extractor: Arc<dyn Extractor>,
    mode: Mode,
    download_dir: impl Into<PathBuf>,
  ) -> Self {
    Self {
      registry,
      extractor,
      mode,
      download_dir: download_dir.into(),
    }
  }

  pub fn mode(&self) -> Mode {
    self.mode
  }

  /// Registers a fresh task and starts its job in the background. Returns the
  /// task id without waiting for the job.
  pub async fn submit(&self, request: JobRequest) -> Result<String> {
    let task_id = Uuid::new_v4().to_string();
    let task = Task::extracting(&task_id);

    let evicted = self.registry.insert(task.clone()).await?;
    for old in &evicted {
      info!("evicted task {} to make room", old.task_id);
      discard_task_file(&self.registry, old).await;
    }

    let runner = self.clone();
    tokio::spawn(async move { runner.run(task, request).await });

    Ok(task_id)
  }

  /// Drives one job to completion. Failures end up in the task record only.
  pub async fn run(&self, task: Task, request: JobRequest) {
    let task_id = task.task_id.clone();
    let temp_dir = self.download_dir.join(format!("tmp_{task_id}"));
    let mut handle = TaskHandle {
      registry: self.registry.clone(),
      current: task.clone(),
    };
    handle.publish(task).await;

    info!("task {} started for {}", task_id, request.url);
    match self.execute(&mut handle, &request, &temp_dir).await {
      Ok(()) => info!("task {} completed", task_id),
      Err(e) => {
        warn!("task {} failed: {}", task_id, e);
        if self.mode == Mode::MaterializedFile {
          remove_temp_dir(&temp_dir).await;
        }
        let failed = handle.current.failed(&e);
        handle.publish(failed).await;
      }
    }
  }

  async fn execute(
    &self,
    handle: &mut TaskHandle,
    request: &JobRequest,
    temp_dir: &Path,
  ) -> Result<()> {
    let info = self.extractor.lookup(&request.url).await?;
    let selected = select_format(
      &info.formats,
      &request.preference,
      request.format_id.as_deref(),
    )?
    .clone();
    debug!(
      "task {} selected format {} ({})",
      handle.current.task_id, selected.format_id, selected.ext
    );

    let mut format_info = FormatInfo::new(&selected, &request.preference);
    let output = match self.mode {
      Mode::DirectUrl => {
        let stream_url = selected
          .url
          .clone()
          .filter(|url| !url.is_empty())
          .ok_or(Error::NoSuitableFormat)?;
        let filename =
          output_filename(info.title(), info.uploader(), &selected.ext);
        TaskOutput::Stream {
          stream_url,
          filename,
        }
      }
      Mode::MaterializedFile => {
        let (output, ext) = self
          .download(handle, request, &selected, &info, temp_dir)
          .await?;
        // post-processing decides the delivered container
        format_info.ext = ext;
        output
      }
    };

    let video_info = info.video_info();
    let completed = handle.current.completed(output, format_info, video_info);
    handle.publish(completed).await;
    Ok(())
  }

  async fn download(
    &self,
    handle: &mut TaskHandle,
    request: &JobRequest,
    selected: &CandidateFormat,
    info: &MediaInfo,
    temp_dir: &Path,
  ) -> Result<(TaskOutput, String)> {
    handle.progress(0, "Configuring download options...").await;
    let options = download_options(request, selected, temp_dir);
    fs::create_dir_all(temp_dir).await?;

    handle.progress(0, "Starting download...").await;
    let (tx, mut rx) = mpsc::channel(32);
    let download = self.extractor.download(options, tx);
    let report = async {
      while let Some(event) = rx.recv().await {
        handle.report(event).await;
      }
    };
    let (result, ()) = tokio::join!(download, report);
    result?;

    self.materialize(info, temp_dir).await
  }

  /// Moves the single file the download produced into the shared directory
  /// under its final name. Also returns the file's extension.
  async fn materialize(
    &self,
    info: &MediaInfo,
    temp_dir: &Path,
  ) -> Result<(TaskOutput, String)> {
    let downloaded = find_single_file(temp_dir)
      .await?
      .ok_or_else(|| Error::Extraction("No file was downloaded".into()))?;
    let ext = downloaded
      .extension()
      .and_then(|ext| ext.to_str())
      .unwrap_or("bin")
      .to_string();

    let filename = output_filename(info.title(), info.uploader(), &ext);
    let file_path = self.download_dir.join(&filename);
    match fs::remove_file(&file_path).await {
      Ok(()) => debug!("replacing existing file {}", file_path.display()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => return Err(e.into()),
    }
    fs::rename(&downloaded, &file_path).await?;
    remove_temp_dir(temp_dir).await;

    let file_size = fs::metadata(&file_path).await?.len();
    let output = TaskOutput::File {
      file_path,
      filename,
      file_size,
    };
    Ok((output, ext))
  }
}

/// Builds the extraction tool's options from the user's preference and the
/// selected candidate.
pub fn download_options(
  request: &JobRequest,
  selected: &CandidateFormat,
  temp_dir: &Path,
) -> DownloadRequest {
  let preference = &request.preference;
  let (format, post_process) = match preference.kind {
    MediaKind::Audio => {
      let quality = match preference.container.as_str() {
        "mp3" | "aac" => Some(preference.ceiling()),
        _ => None,
      };
      (
        format!("{}/bestaudio/best", selected.format_id),
        PostProcess::ExtractAudio {
          codec: preference.container.clone(),
          quality,
        },
      )
    }
    MediaKind::Video => {
      let post_process = if selected.ext == preference.container {
        PostProcess::None
      } else if preference.container == "mkv" {
        PostProcess::RecodeVideo(preference.container.clone())
      } else {
        PostProcess::RemuxVideo(preference.container.clone())
      };
      (
        format!(
          "{}/best[height<={}]/best",
          selected.format_id,
          preference.ceiling()
        ),
        post_process,
      )
    }
  };

  DownloadRequest {
    url: request.url.clone(),
    format,
    output_template: temp_dir.join("%(title)s.%(ext)s"),
    post_process,
  }
}

async fn find_single_file(dir: &Path) -> Result<Option<PathBuf>> {
  let mut entries = fs::read_dir(dir).await?;
  while let Some(entry) = entries.next_entry().await? {
    if entry.file_type().await?.is_file() {
      return Ok(Some(entry.path()));
    }
  }
  Ok(None)
}

async fn remove_temp_dir(dir: &Path) {
  if let Err(e) = fs::remove_dir_all(dir).await {
    if e.kind() != std::io::ErrorKind::NotFound {
      warn!("failed to remove {}: {}", dir.display(), e);
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::{
    extractor::testing::{sample_info, FakeExtractor},
    registry::TaskRegistry,
    task::TaskStatus,
  };

  fn audio_request() -> JobRequest {
    JobRequest {
      url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
      format_id: None,
      preference: Preference::audio("mp3", "320k"),
    }
  }

  fn runner(
    extractor: FakeExtractor,
    mode: Mode,
    dir: &Path,
  ) -> (JobRunner, TaskRegistryRef) {
    let registry = TaskRegistry::new(100).spawn();
    let runner =
      JobRunner::new(registry.clone(), Arc::new(extractor), mode, dir);
    (runner, registry)
  }

  fn titled(title: &str) -> FakeExtractor {
    let mut info = sample_info();
    info.title = Some(title.into());
    FakeExtractor::new(info)
  }

  fn file_path(task: &Task) -> PathBuf {
    task.file_path().cloned().expect("a materialized file")
  }

  async fn wait_terminal(registry: &TaskRegistryRef, task_id: &str) -> Task {
    for _ in 0..500 {
      let task = registry.get(task_id).await.unwrap();
      if task.is_terminal() {
        return task;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {task_id} never finished");
  }

  #[tokio::test]
  async fn test_direct_url_mode_completes_with_stream_url() {
    let dir = tempfile::tempdir().unwrap();
    let extractor = FakeExtractor::new(sample_info());
    let (runner, registry) = runner(extractor, Mode::DirectUrl, dir.path());

    let task_id = runner.submit(audio_request()).await.unwrap();
    let task = wait_terminal(&registry, &task_id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    assert_eq!(
      task.output,
      Some(TaskOutput::Stream {
        stream_url: "https://cdn.example/140".into(),
        filename: "Never Gonna - Rick.m4a".into(),
      })
    );
    assert_eq!(task.video_info.unwrap().title, "Never: Gonna?");
  }

  #[tokio::test]
  async fn test_materialized_file_mode_moves_file_into_place() {
    let dir = tempfile::tempdir().unwrap();
    let extractor = FakeExtractor::new(sample_info());
    let (runner, registry) =
      runner(extractor, Mode::MaterializedFile, dir.path());

    let task_id = runner.submit(audio_request()).await.unwrap();
    let task = wait_terminal(&registry, &task_id).await;

    assert_eq!(task.status, TaskStatus::Completed, "{}", task.message);
    let expected = dir.path().join("Never Gonna - Rick.mp3");
    assert_eq!(
      task.output,
      Some(TaskOutput::File {
        file_path: expected.clone(),
        filename: "Never Gonna - Rick.mp3".into(),
        file_size: 16,
      })
    );
    assert!(expected.exists());
    assert!(!dir.path().join(format!("tmp_{task_id}")).exists());
    // the delivered container, not the selected m4a candidate
    assert_eq!(task.format_info.unwrap().ext, "mp3");
  }

  #[tokio::test]
  async fn test_long_multibyte_title_is_materialized() {
    let dir = tempfile::tempdir().unwrap();
    let title = "日".repeat(80);
    let mut extractor = titled(&title);
    extractor.info.uploader = Some("本".repeat(10));
    let (runner, registry) =
      runner(extractor, Mode::MaterializedFile, dir.path());

    let task_id = runner.submit(audio_request()).await.unwrap();
    let task = wait_terminal(&registry, &task_id).await;

    assert_eq!(task.status, TaskStatus::Completed, "{}", task.message);
    let path = file_path(&task);
    assert!(path.exists());
    let name = path.file_name().unwrap().to_str().unwrap();
    assert!(name.len() <= 255);
    assert!(name.starts_with(&title));
  }

  #[tokio::test]
  async fn test_evicting_one_task_keeps_file_of_same_media() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, registry) =
      runner(titled("Shared"), Mode::MaterializedFile, dir.path());

    let first = runner.submit(audio_request()).await.unwrap();
    let first = wait_terminal(&registry, &first).await;
    let second = runner.submit(audio_request()).await.unwrap();
    let second = wait_terminal(&registry, &second).await;
    assert_eq!(second.status, TaskStatus::Completed, "{}", second.message);
    assert_eq!(file_path(&first), file_path(&second));

    let evicted = registry.remove(&first.task_id).await.unwrap().unwrap();
    discard_task_file(&registry, &evicted).await;
    assert!(file_path(&second).exists());

    // the last task referencing it takes the file along
    let evicted = registry.remove(&second.task_id).await.unwrap().unwrap();
    discard_task_file(&registry, &evicted).await;
    assert!(!file_path(&second).exists());
  }

  #[tokio::test]
  async fn test_submit_deletes_files_of_tasks_evicted_for_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let registry = TaskRegistry::new(1).spawn();
    let mode = Mode::MaterializedFile;
    let first_runner = JobRunner::new(
      registry.clone(),
      Arc::new(titled("First")),
      mode,
      dir.path(),
    );
    let second_runner = JobRunner::new(
      registry.clone(),
      Arc::new(titled("Second")),
      mode,
      dir.path(),
    );

    let first = first_runner.submit(audio_request()).await.unwrap();
    let first = wait_terminal(&registry, &first).await;
    assert_eq!(first.status, TaskStatus::Completed, "{}", first.message);
    assert!(file_path(&first).exists());

    let second = second_runner.submit(audio_request()).await.unwrap();
    assert!(registry.find(&first.task_id).await.unwrap().is_none());
    assert!(!file_path(&first).exists());

    let second = wait_terminal(&registry, &second).await;
    assert_eq!(second.status, TaskStatus::Completed, "{}", second.message);
    assert!(file_path(&second).exists());
  }

  #[tokio::test]
  async fn test_lookup_failure_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let mut extractor = FakeExtractor::new(sample_info());
    extractor.lookup_error = Some("Video unavailable".into());
    let (runner, registry) = runner(extractor, Mode::DirectUrl, dir.path());

    let task_id = runner.submit(audio_request()).await.unwrap();
    let task = wait_terminal(&registry, &task_id).await;

    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.progress, 0);
    assert_eq!(task.message, "Error: Video unavailable");
  }

  #[tokio::test]
  async fn test_no_suitable_format_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let mut info = sample_info();
    info.formats.clear();
    let (runner, registry) =
      runner(FakeExtractor::new(info), Mode::DirectUrl, dir.path());

    let task_id = runner.submit(audio_request()).await.unwrap();
    let task = wait_terminal(&registry, &task_id).await;

    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.message, "Error: No suitable format found");
  }

  #[tokio::test]
  async fn test_download_failure_cleans_temp_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut extractor = FakeExtractor::new(sample_info());
    extractor.download_error = Some("HTTP Error 403: Forbidden".into());
    let (runner, registry) =
      runner(extractor, Mode::MaterializedFile, dir.path());

    let task = Task::extracting("fixed-id");
    registry.insert(task.clone()).await.unwrap();
    runner.run(task, audio_request()).await;

    let task = registry.get("fixed-id").await.unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.progress, 0);
    assert_eq!(task.message, "Error: HTTP Error 403: Forbidden");
    assert!(!dir.path().join("tmp_fixed-id").exists());
  }

  #[tokio::test]
  async fn test_progress_samples_are_scaled_and_monotonic() {
    let registry = TaskRegistry::new(10).spawn();
    let task = Task::extracting("p");
    registry.insert(task.clone()).await.unwrap();
    let mut handle = TaskHandle {
      registry: registry.clone(),
      current: task,
    };

    let mut seen = Vec::new();
    let events = [
      DownloadEvent::Progress { downloaded: 0, total: Some(200) },
      DownloadEvent::Progress { downloaded: 100, total: Some(200) },
      DownloadEvent::Progress { downloaded: 50, total: Some(200) },
      DownloadEvent::Progress { downloaded: 999, total: None },
      DownloadEvent::Progress { downloaded: 200, total: Some(200) },
      DownloadEvent::Finished,
    ];
    for event in events {
      handle.report(event).await;
      seen.push(registry.get("p").await.unwrap().progress);
    }

    assert_eq!(seen, vec![0, 40, 40, 40, 80, 80]);
    assert_eq!(registry.get("p").await.unwrap().message, "Processing...");
  }

  #[tokio::test]
  async fn test_progress_with_huge_total_does_not_overflow() {
    let registry = TaskRegistry::new(10).spawn();
    let task = Task::extracting("big");
    registry.insert(task.clone()).await.unwrap();
    let mut handle = TaskHandle {
      registry: registry.clone(),
      current: task,
    };

    let total = Some(u64::MAX);
    let half = u64::MAX / 2;
    handle
      .report(DownloadEvent::Progress { downloaded: half, total })
      .await;
    assert_eq!(registry.get("big").await.unwrap().progress, 39);

    handle
      .report(DownloadEvent::Progress { downloaded: u64::MAX, total })
      .await;
    let task = registry.get("big").await.unwrap();
    assert_eq!(task.progress, 80);
    assert_eq!(task.message, "Downloading... 80%");
  }

  #[test]
  fn test_download_options() {
    let temp = Path::new("/tmp/tmp_x");
    let audio = CandidateFormat {
      format_id: "140".into(),
      ext: "m4a".into(),
      ..Default::default()
    };
    let options = download_options(&audio_request(), &audio, temp);
    assert_eq!(options.format, "140/bestaudio/best");
    assert_eq!(
      options.post_process,
      PostProcess::ExtractAudio {
        codec: "mp3".into(),
        quality: Some(320)
      }
    );
    assert_eq!(options.output_template, temp.join("%(title)s.%(ext)s"));

    let mut flac = audio_request();
    flac.preference = Preference::audio("flac", "128k");
    let options = download_options(&flac, &audio, temp);
    assert_eq!(
      options.post_process,
      PostProcess::ExtractAudio {
        codec: "flac".into(),
        quality: None
      }
    );

    let video = CandidateFormat {
      format_id: "18".into(),
      ext: "mp4".into(),
      ..Default::default()
    };
    let mut request = audio_request();
    request.preference = Preference::video("mkv", "1080p");
    let options = download_options(&request, &video, temp);
    assert_eq!(options.format, "18/best[height<=1080]/best");
    assert_eq!(
      options.post_process,
      PostProcess::RecodeVideo("mkv".into())
    );

    request.preference = Preference::video("mp4", "720p");
    let options = download_options(&request, &video, temp);
    assert_eq!(options.post_process, PostProcess::None);

    request.preference = Preference::video("webm", "720p");
    let options = download_options(&request, &video, temp);
    assert_eq!(options.format, "18/best[height<=720]/best");
    assert_eq!(
      options.post_process,
      PostProcess::RemuxVideo("webm".into())
    );
  }
}
