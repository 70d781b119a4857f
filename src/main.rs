use std::{sync::Arc, time::Duration};

use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod error;
mod extractor;
mod format;
mod registry;
mod relay;
mod runner;
mod server;
mod sweeper;
mod task;
mod util;
mod validate;

pub use error::{Error, Result};

use crate::{
  api::AppState, config::Config, extractor::Ytdlp, registry::TaskRegistry,
  relay::Relay, runner::JobRunner, sweeper::Sweeper,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .init();

  let config = Config::from_env();
  tokio::fs::create_dir_all(&config.download_dir).await?;
  info!(
    "starting in {:?} mode, downloads in {}",
    config.mode,
    config.download_dir.display()
  );

  let registry = TaskRegistry::new(config.task_capacity).spawn();
  let extractor = Arc::new(Ytdlp::new(&config.ytdlp));
  let runner = JobRunner::new(
    registry.clone(),
    extractor.clone(),
    config.mode,
    &config.download_dir,
  );
  let relay = Relay::new(config.thumbnail_timeout, config.stream_timeout)?;
  let state = AppState::new(runner, registry.clone(), extractor, relay);

  let app = server::router(state, &config.allowed_origins);
  let sweeper = Sweeper::new(registry, &config);
  let addr = config.bind_addr;

  Toplevel::new(move |s| async move {
    s.start(SubsystemBuilder::new("http", move |subsys| {
      server::serve(subsys, addr, app)
    }));
    s.start(SubsystemBuilder::new("sweeper", move |subsys| {
      sweeper.run(subsys)
    }));
  })
  .catch_signals()
  .handle_shutdown_requests(SHUTDOWN_TIMEOUT)
  .await
  .map_err(|e| Error::Internal(e.to_string()))
}
