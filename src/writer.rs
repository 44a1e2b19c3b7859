use crate::{Error, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Writes all of `data` to `conn`, tolerating partial writes.
///
/// A write that accepts zero bytes before the payload is complete is a
/// stall, not a success.
pub async fn write_payload<W>(conn: &mut W, data: &[u8]) -> Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    log::debug!("Want to write {} bytes", data.len());

    let mut written = 0;
    while written < data.len() {
        let n = conn
            .write(&data[written..])
            .await
            .map_err(|e| Error::WriteFailed { source: e, written })?;

        if n == 0 {
            return Err(Error::WriteStalled {
                written,
                total: data.len(),
            });
        }

        written += n;
        log::trace!("Wrote {} of {} bytes", written, data.len());
    }

    conn.flush()
        .await
        .map_err(|e| Error::WriteFailed { source: e, written })?;

    Ok(written)
}

/// Feeds `data` into the attached connection and closes it, unless `cancel`
/// fires first.
pub(crate) async fn feed<W>(mut conn: W, data: Vec<u8>, cancel: CancellationToken) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let written = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        r = write_payload(&mut conn, &data) => r?,
    };

    // Closing our end delivers EOF to the runner's stdin.
    tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        r = conn.shutdown() => r.map_err(|e| Error::WriteFailed { source: e, written })?,
    }

    log::debug!("Done writing {} bytes to attached stdin", written);
    Ok(written)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{
        collections::VecDeque,
        io,
        pin::Pin,
        task::{Context, Poll},
    };

    /// Accepts at most the next scripted number of bytes per write call.
    struct Scripted {
        chunks: VecDeque<io::Result<usize>>,
        received: Vec<u8>,
        calls: usize,
    }

    impl Scripted {
        fn new(chunks: Vec<io::Result<usize>>) -> Self {
            Scripted {
                chunks: chunks.into(),
                received: Vec::new(),
                calls: 0,
            }
        }
    }

    impl AsyncWrite for Scripted {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.calls += 1;
            let next = self.chunks.pop_front().unwrap_or(Ok(buf.len()));
            Poll::Ready(next.map(|n| {
                let n = n.min(buf.len());
                self.received.extend_from_slice(&buf[..n]);
                n
            }))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn partial_writes_complete() {
        let data = payload(100);
        let cases: Vec<Vec<usize>> = vec![
            vec![100],
            vec![1; 100],
            vec![3, 50, 7, 40],
            vec![99, 1],
            vec![64, 64],
        ];

        for chunks in cases {
            let mut conn = Scripted::new(chunks.iter().copied().map(Ok).collect());
            let written = write_payload(&mut conn, &data)
                .await
                .expect("write succeeds");

            assert_eq!(written, data.len());
            assert_eq!(conn.received, data, "chunks {:?}", chunks);
        }
    }

    #[tokio::test]
    async fn empty_payload_issues_no_writes() {
        let mut conn = Scripted::new(vec![Ok(0)]);
        assert_eq!(write_payload(&mut conn, b"").await.unwrap(), 0);
        assert_eq!(conn.calls, 0);
    }

    #[tokio::test]
    async fn zero_byte_write_stalls() {
        let data = payload(10);
        let mut conn = Scripted::new(vec![Ok(4), Ok(0), Ok(6)]);

        match write_payload(&mut conn, &data).await {
            Err(Error::WriteStalled { written, total }) => {
                assert_eq!(written, 4);
                assert_eq!(total, 10);
            }
            other => panic!("expected a stall, got {:?}", other),
        }
        assert_eq!(conn.calls, 2);
    }

    #[tokio::test]
    async fn write_error_carries_cause() {
        let data = payload(10);
        let broken = io::Error::new(io::ErrorKind::BrokenPipe, "runner went away");
        let mut conn = Scripted::new(vec![Ok(2), Err(broken)]);

        match write_payload(&mut conn, &data).await {
            Err(Error::WriteFailed { source, written }) => {
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe);
                assert_eq!(written, 2);
            }
            other => panic!("expected a write failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn feed_closes_connection() {
        use tokio::io::AsyncReadExt;

        let (client, mut server) = tokio::io::duplex(8);
        let data = payload(1000);
        let task = tokio::spawn(feed(client, data.clone(), CancellationToken::new()));

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), 1000);
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn feed_honours_cancellation() {
        // Nobody reads the other end, so the writer blocks once the buffer fills.
        let (client, _server) = tokio::io::duplex(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(feed(client, payload(1000), cancel.clone()));

        cancel.cancel();
        assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));
    }
}
