//! In-process byte pipe
//!
//! Bridges a producer task writing an archive (or any generated body) to the
//! consumer reading the response. The producer closes the pipe with the error
//! that stopped it so the consumer observes the failure instead of a short
//! read.

use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::PollSender;

/// Reading half of a pipe
pub type PipeReader = StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>;

/// Writing half of a pipe
pub struct PipeWriter {
    tx: PollSender<io::Result<Bytes>>,
}

/// Create a pipe holding at most `capacity` in-flight chunks
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PipeWriter {
            tx: PollSender::new(tx),
        },
        StreamReader::new(ReceiverStream::new(rx)),
    )
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed")
}

impl PipeWriter {
    /// Close the pipe with `err`; the reader's next read fails with it
    pub async fn fail(self, err: io::Error) {
        self.failer().fail(err).await
    }

    /// Handle able to fail the pipe after the writer was moved into an
    /// encoder. The reader only sees end-of-stream once every handle is gone.
    pub fn failer(&self) -> PipeFailer {
        PipeFailer {
            tx: self.tx.get_ref().cloned(),
        }
    }
}

/// Detached error side of a [`PipeWriter`]
#[derive(Clone)]
pub struct PipeFailer {
    tx: Option<mpsc::Sender<io::Result<Bytes>>>,
}

impl PipeFailer {
    pub async fn fail(self, err: io::Error) {
        if let Some(tx) = self.tx {
            let _ = tx.send(Err(err)).await;
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(this.tx.poll_reserve(cx)).map_err(|_| closed())?;
        this.tx
            .send_item(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| closed())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().tx.close();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pipe_transfers_bytes() {
        let (mut writer, mut reader) = pipe(2);
        let producer = tokio::spawn(async move {
            for chunk in [&b"hello "[..], &b"pipe"[..]] {
                writer.write_all(chunk).await.unwrap();
            }
            writer.shutdown().await.unwrap();
        });
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        producer.await.unwrap();
        assert_eq!(out, "hello pipe");
    }

    #[tokio::test]
    async fn test_pipe_failure_reaches_reader() {
        let (mut writer, mut reader) = pipe(4);
        writer.write_all(b"partial").await.unwrap();
        writer
            .fail(io::Error::new(io::ErrorKind::Other, "producer failed"))
            .await;
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.to_string(), "producer failed");
    }

    #[tokio::test]
    async fn test_failer_outlives_writer() {
        let (mut writer, mut reader) = pipe(4);
        let failer = writer.failer();
        writer.write_all(b"data").await.unwrap();
        drop(writer);
        failer
            .fail(io::Error::new(io::ErrorKind::InvalidData, "encoder failed"))
            .await;
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(out, b"data");
    }

    #[tokio::test]
    async fn test_dropped_reader_breaks_writer() {
        let (mut writer, reader) = pipe(1);
        drop(reader);
        let err = writer.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_producer_error_is_forwarded() {
        let mut source = tokio_test::io::Builder::new()
            .read(b"head")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "upstream reset"))
            .build();
        let (mut writer, mut reader) = pipe(4);
        let producer = tokio::spawn(async move {
            if let Err(err) = tokio::io::copy(&mut source, &mut writer).await {
                writer.fail(err).await;
            }
        });
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        producer.await.unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(out, b"head");
    }
}
