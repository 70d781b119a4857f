use std::{
  path::{Path, PathBuf},
  time::{Duration, SystemTime},
};

use tokio::fs;
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, info, warn};

use crate::{config::Config, registry::TaskRegistryRef, task::Task, Result};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
  pub evicted_tasks: usize,
  pub removed_files: usize,
}

/// Periodically evicts the oldest tasks once the registry grows past a
/// threshold and deletes stale files from the download directory.
#[derive(Clone)]
pub struct Sweeper {
  registry: TaskRegistryRef,
  download_dir: PathBuf,
  interval: Duration,
  file_max_age: Duration,
  max_tasks: usize,
  evict_batch: usize,
}

impl Sweeper {
  pub fn new(registry: TaskRegistryRef, config: &Config) -> Self {
    Self {
      registry,
      download_dir: config.download_dir.clone(),
      interval: config.cleanup_interval,
      file_max_age: config.file_max_age,
      max_tasks: config.max_tasks,
      evict_batch: config.evict_batch,
    }
  }

  /// Runs until shutdown is requested. A failed cycle is logged and the loop
  /// carries on.
  pub async fn run(self, subsys: SubsystemHandle) -> Result<()> {
    let mut ticker =
      tokio::time::interval(self.interval.max(Duration::from_secs(1)));
    // the first tick completes immediately
    ticker.tick().await;

    loop {
      tokio::select! {
        _ = subsys.on_shutdown_requested() => {
          info!("sweeper stopped");
          return Ok(());
        }
        _ = ticker.tick() => {
          let report = self.sweep().await;
          if report != SweepReport::default() {
            info!(
              "sweep evicted {} tasks, removed {} files",
              report.evicted_tasks, report.removed_files
            );
          }
        }
      }
    }
  }

  pub async fn sweep(&self) -> SweepReport {
    let mut report = SweepReport::default();

    match self.evict_excess().await {
      Ok(evicted) => report.evicted_tasks = evicted,
      Err(e) => warn!("task eviction failed: {}", e),
    }

    match remove_expired_files_at(
      &self.download_dir,
      self.file_max_age,
      SystemTime::now(),
    )
    .await
    {
      Ok(removed) => report.removed_files = removed,
      Err(e) => warn!(
        "failed to scan {} for stale files: {}",
        self.download_dir.display(),
        e
      ),
    }

    report
  }

  async fn evict_excess(&self) -> Result<usize> {
    if self.registry.len().await? <= self.max_tasks {
      return Ok(0);
    }

    let evicted = self.registry.evict_oldest(self.evict_batch).await?;
    for task in &evicted {
      debug!("evicting task {}", task.task_id);
      discard_task_file(&self.registry, task).await;
    }
    Ok(evicted.len())
  }
}

/// Deletes the file a materialized task points to, if any. Tasks for the
/// same media share an output path, so the file stays while any task left in
/// the registry still serves it.
pub async fn discard_task_file(registry: &TaskRegistryRef, task: &Task) {
  let Some(path) = task.file_path() else {
    return;
  };

  match registry.snapshot().await {
    Ok(tasks) if tasks.iter().any(|t| t.file_path() == Some(path)) => {
      debug!("keeping {}, still served by another task", path.display());
      return;
    }
    Ok(_) => {}
    Err(e) => {
      warn!("not deleting {}: {}", path.display(), e);
      return;
    }
  }

  match fs::remove_file(path).await {
    Ok(()) => debug!("deleted {}", path.display()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
    Err(e) => warn!("failed to delete {}: {}", path.display(), e),
  }
}

/// Removes regular files in `dir` last modified more than `max_age` before
/// `now`. Directories are left alone so in-flight downloads survive.
pub async fn remove_expired_files_at(
  dir: &Path,
  max_age: Duration,
  now: SystemTime,
) -> Result<usize> {
  let mut removed = 0;
  let mut entries = fs::read_dir(dir).await?;

  while let Some(entry) = entries.next_entry().await? {
    let path = entry.path();
    let metadata = match entry.metadata().await {
      Ok(metadata) if metadata.is_file() => metadata,
      Ok(_) => continue,
      Err(e) => {
        warn!("failed to stat {}: {}", path.display(), e);
        continue;
      }
    };

    let age = metadata
      .modified()
      .ok()
      .and_then(|modified| now.duration_since(modified).ok());
    if !matches!(age, Some(age) if age > max_age) {
      continue;
    }

    match fs::remove_file(&path).await {
      Ok(()) => {
        debug!("removed stale file {}", path.display());
        removed += 1;
      }
      Err(e) => warn!("failed to remove {}: {}", path.display(), e),
    }
  }

  Ok(removed)
}
