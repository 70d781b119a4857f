use std::net::SocketAddr;

use axum::{
  http::{header, HeaderValue, Method},
  routing::{get, post},
  Router,
};
use tokio_graceful_shutdown::SubsystemHandle;
use tower_http::{
  cors::{AllowOrigin, Any, CorsLayer},
  trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
  api::{self, AppState},
  Error, Result,
};

/// The API routes, mounted both at the root and under `/api`.
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
  let api = Router::new()
    .route("/validate", post(api::validate))
    .route("/extract", post(api::extract))
    .route("/status/:task_id", get(api::status))
    .route("/stream/:task_id", get(api::media))
    .route("/download/:task_id", get(api::media))
    .route("/thumbnail/:task_id", get(api::thumbnail))
    .route("/health", get(api::health))
    .route("/start_download", post(api::start_download))
    .with_state(state);

  Router::new()
    .merge(api.clone())
    .nest("/api", api)
    .layer(cors_layer(allowed_origins))
    .layer(TraceLayer::new_for_http())
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
  let allow_origin = if allowed_origins.iter().any(|o| o == "*") {
    AllowOrigin::any()
  } else {
    let origins: Vec<HeaderValue> = allowed_origins
      .iter()
      .filter_map(|origin| match HeaderValue::from_str(origin) {
        Ok(value) => Some(value),
        Err(_) => {
          warn!("ignoring invalid allowed origin: {}", origin);
          None
        }
      })
      .collect();
    info!("CORS allow-list: {:?}", origins);
    AllowOrigin::list(origins)
  };

  CorsLayer::new()
    .allow_origin(allow_origin)
    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
    .allow_headers(Any)
    .expose_headers([
      header::CONTENT_DISPOSITION,
      header::CONTENT_LENGTH,
      header::CONTENT_RANGE,
    ])
}

pub async fn serve(
  subsys: SubsystemHandle,
  addr: SocketAddr,
  app: Router,
) -> Result<()> {
  let server = axum::Server::try_bind(&addr)
    .map_err(|e| Error::Internal(format!("failed to bind {addr}: {e}")))?;
  info!("listening on {}", addr);

  server
    .serve(app.into_make_service())
    .with_graceful_shutdown(subsys.on_shutdown_requested())
    .await
    .map_err(|e| Error::Internal(e.to_string()))
}
