use std::time::Duration;

use axum::{
  body::{boxed, StreamBody},
  http::{self, header, HeaderMap, HeaderValue},
  response::Response,
};
use bytes::Bytes;
use tracing::debug;

use crate::{Error, Result};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

fn browser_headers() -> HeaderMap {
  let mut headers = HeaderMap::new();
  headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
  headers.insert(
    header::ACCEPT_LANGUAGE,
    HeaderValue::from_static("en-US,en;q=0.9"),
  );
  // relayed bytes must match the upstream's content length
  headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
  headers.insert(header::DNT, HeaderValue::from_static("1"));
  headers.insert(
    header::UPGRADE_INSECURE_REQUESTS,
    HeaderValue::from_static("1"),
  );
  headers
}

/// Stateless pass-through fetches for thumbnails and selected media URLs.
#[derive(Clone)]
pub struct Relay {
  thumbnails: reqwest::Client,
  streams: reqwest::Client,
}

impl Relay {
  pub fn new(
    thumbnail_timeout: Duration,
    stream_timeout: Duration,
  ) -> Result<Self> {
    let thumbnails = reqwest::Client::builder()
      .user_agent(USER_AGENT)
      .timeout(thumbnail_timeout)
      .build()?;
    // a total timeout would cut long streams short, so only bound connecting
    let streams = reqwest::Client::builder()
      .user_agent(USER_AGENT)
      .default_headers(browser_headers())
      .connect_timeout(stream_timeout)
      .build()?;

    Ok(Self {
      thumbnails,
      streams,
    })
  }

  pub async fn fetch_thumbnail(&self, url: &str) -> Result<Bytes> {
    let resp = self.thumbnails.get(url).send().await?.error_for_status()?;
    Ok(resp.bytes().await?)
  }

  /// Relays `url` chunk by chunk, forwarding the client's `Range` header.
  pub async fn proxy_stream(
    &self,
    url: &str,
    range: Option<&HeaderValue>,
  ) -> Result<Response> {
    let mut req = self.streams.get(url);
    if let Some(range) = range {
      req = req.header(header::RANGE, range.clone());
    }

    let upstream = req
      .send()
      .await
      .and_then(|resp| resp.error_for_status())
      .map_err(|e| Error::Upstream(e.to_string()))?;
    debug!("relaying {} from upstream", upstream.status());

    let mut builder = http::Response::builder().status(upstream.status());
    for name in [
      header::CONTENT_TYPE,
      header::CONTENT_LENGTH,
      header::CONTENT_RANGE,
    ] {
      if let Some(value) = upstream.headers().get(&name) {
        builder = builder.header(name, value.clone());
      }
    }
    if !upstream.headers().contains_key(header::CONTENT_TYPE) {
      builder =
        builder.header(header::CONTENT_TYPE, "application/octet-stream");
    }

    builder
      .header(header::ACCEPT_RANGES, "bytes")
      .header(header::CACHE_CONTROL, "no-cache")
      .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
      .body(boxed(StreamBody::new(upstream.bytes_stream())))
      .map_err(|e| Error::Internal(e.to_string()))
  }
}
