//! Byte-stream pair connecting a render running in the sandbox to the host
//! that serves the response.
//!
//! The writer is handed to the render; the reader is consumed by the bridge.
//! Chunks written before [`StreamWriter::close`] are always delivered, and the
//! reader only ends once the writer is closed (or every writer clone dropped).

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Write attempted after the stream was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("render stream is already closed")]
pub struct StreamClosed;

/// Create a connected writer/body pair.
pub fn pair() -> (StreamWriter, BodyStream) {
    let (tx, rx) = unbounded_channel();
    (
        StreamWriter {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        BodyStream { rx },
    )
}

/// Writable half, cloneable so the render and its supervisor share it.
#[derive(Debug, Clone)]
pub struct StreamWriter {
    tx: Arc<Mutex<Option<UnboundedSender<Bytes>>>>,
}

impl StreamWriter {
    /// Enqueue a chunk. Empty chunks are accepted and skipped.
    pub fn write(&self, chunk: impl Into<Bytes>) -> Result<(), StreamClosed> {
        let chunk = chunk.into();
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(StreamClosed)?;
        if chunk.is_empty() {
            return Ok(());
        }
        tx.send(chunk).map_err(|_| StreamClosed)
    }

    /// Close the stream. Idempotent; returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Readable half: a stream of body chunks.
#[derive(Debug)]
pub struct BodyStream {
    rx: UnboundedReceiver<Bytes>,
}

impl BodyStream {
    /// Read to the end and decode as UTF-8 (lossy).
    pub async fn text(mut self) -> String {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.next().await {
            body.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&body).into_owned()
    }
}

impl Stream for BodyStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn test_text_collects_all_chunks() {
        let (writer, body) = pair();
        writer.write("<html>").unwrap();
        writer.write(Bytes::from_static(b"<body>hi</body>")).unwrap();
        writer.write("</html>").unwrap();
        assert!(writer.close());

        assert_eq!(body.text().await, "<html><body>hi</body></html>");
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (writer, _body) = pair();
        assert!(writer.close());
        assert!(!writer.close());
        assert!(writer.is_closed());
        assert_eq!(writer.write("late"), Err(StreamClosed));
    }

    #[tokio::test]
    async fn test_slow_chunked_writer_delivers_everything() {
        let (writer, body) = pair();
        let producer = tokio::spawn(async move {
            for i in 0..20 {
                writer.write(format!("<p>{i}</p>")).unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            writer.close();
        });

        let text = body.text().await;
        producer.await.unwrap();
        let expected: String = (0..20).map(|i| format!("<p>{i}</p>")).collect();
        assert_eq!(text, expected);
    }

    #[tokio::test]
    async fn test_body_ends_when_writers_dropped() {
        let (writer, body) = pair();
        writer.write("partial").unwrap();
        drop(writer);
        assert_eq!(body.text().await, "partial");
    }
}
