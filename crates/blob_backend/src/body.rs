//! Streaming blob bodies.

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, stream::BoxStream};

use crate::BlobResult;

/// A byte stream owned by whoever holds it.
///
/// Dropping the body releases the underlying connection or buffer, so every
/// exit path of a caller releases it without an explicit close.
pub struct BlobBody {
    inner: BoxStream<'static, BlobResult<Bytes>>,
}

impl BlobBody {
    pub fn from_bytes(data: Bytes) -> Self {
        Self {
            inner: futures::stream::once(async move { Ok(data) }).boxed(),
        }
    }

    pub fn from_stream(stream: impl Stream<Item = BlobResult<Bytes>> + Send + 'static) -> Self {
        Self {
            inner: stream.boxed(),
        }
    }

    pub fn empty() -> Self {
        Self {
            inner: futures::stream::empty().boxed(),
        }
    }

    /// Read the whole body into one buffer.
    pub async fn collect(mut self) -> BlobResult<Bytes> {
        let Some(first) = self.inner.next().await.transpose()? else {
            return Ok(Bytes::new());
        };
        let Some(second) = self.inner.next().await.transpose()? else {
            return Ok(first);
        };
        let mut buffer = BytesMut::with_capacity(first.len() + second.len());
        buffer.extend_from_slice(&first);
        buffer.extend_from_slice(&second);
        while let Some(chunk) = self.inner.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl Stream for BlobBody {
    type Item = BlobResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl fmt::Debug for BlobBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobBody").finish_non_exhaustive()
    }
}

impl From<Bytes> for BlobBody {
    fn from(data: Bytes) -> Self {
        Self::from_bytes(data)
    }
}
