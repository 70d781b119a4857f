use std::{
  pin::Pin,
  task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;

/// Caps a byte stream at a fixed number of bytes, for serving the tail end of
/// a `Range` request from a reader that has already been seeked.
pub struct ByteStream<T> {
  stream: T,
  limit_bytes: Option<u64>,
}

impl<T> ByteStream<T> {
  pub fn new(stream: T) -> Self {
    ByteStream {
      stream,
      limit_bytes: None,
    }
  }

  pub fn limit_bytes(self, bytes: u64) -> Self {
    ByteStream {
      limit_bytes: Some(bytes),
      ..self
    }
  }
}

impl<T, E> Stream for ByteStream<T>
where
  T: Stream<Item = Result<Bytes, E>> + Unpin,
{
  type Item = Result<Bytes, E>;

  fn poll_next(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Self::Item>> {
    let this = &mut *self;
    if this.limit_bytes == Some(0) {
      return Poll::Ready(None);
    }

    match Pin::new(&mut this.stream).poll_next(cx) {
      Poll::Ready(Some(Ok(bytes))) => match this.limit_bytes {
        None => Poll::Ready(Some(Ok(bytes))),
        Some(limit) => {
          let len = bytes.len() as u64;
          if len > limit {
            this.limit_bytes = Some(0);
            Poll::Ready(Some(Ok(bytes.slice(..limit as usize))))
          } else {
            this.limit_bytes = Some(limit - len);
            Poll::Ready(Some(Ok(bytes)))
          }
        }
      },
      Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
      Poll::Ready(None) => Poll::Ready(None),
      Poll::Pending => Poll::Pending,
    }
  }
}
