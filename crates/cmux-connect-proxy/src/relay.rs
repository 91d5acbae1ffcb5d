//! Byte relay between the two ends of an established tunnel.
//!
//! Each direction runs its own copy loop. The first loop to stop, for any
//! reason, cancels the shared token so the other loop stops too; a tunnel is
//! never left half-open. [`pipe`] returns only after both loops are done and
//! both streams have been shut down and dropped.

use std::io::ErrorKind;

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction over the life of a tunnel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copies `a` to `b` and `b` to `a` until either direction ends.
///
/// Copy errors are logged, never returned: a tunnel ending, cleanly or not,
/// is the normal way for it to finish.
pub async fn pipe<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let closed = CancellationToken::new();
    let (a_read, a_write) = io::split(a);
    let (b_read, b_write) = io::split(b);

    let (a_to_b, b_to_a) = tokio::join!(
        copy_until_closed(a_read, b_write, &closed, "a->b"),
        copy_until_closed(b_read, a_write, &closed, "b->a"),
    );

    RelayStats { a_to_b, b_to_a }
}

enum Stop {
    Eof,
    Closed,
    Failed(std::io::Error),
}

async fn copy_until_closed<R, W>(
    mut reader: R,
    mut writer: W,
    closed: &CancellationToken,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;

    let stop = loop {
        let read = tokio::select! {
            _ = closed.cancelled() => break Stop::Closed,
            res = reader.read(&mut buf) => res,
        };
        let n = match read {
            Ok(0) => break Stop::Eof,
            Ok(n) => n,
            Err(err) => break Stop::Failed(err),
        };
        let written = tokio::select! {
            _ = closed.cancelled() => break Stop::Closed,
            res = writer.write_all(&buf[..n]) => res,
        };
        if let Err(err) = written {
            break Stop::Failed(err);
        }
        copied += n as u64;
    };

    closed.cancel();
    match stop {
        Stop::Eof => debug!(direction, copied, "relay source reached end of stream"),
        Stop::Closed => debug!(direction, copied, "relay closed by opposite direction"),
        Stop::Failed(err) if is_disconnect(&err) => {
            debug!(direction, copied, error = %err, "relay peer disconnected")
        }
        Stop::Failed(err) => warn!(direction, copied, error = %err, "error copying data"),
    }

    // May fail when the peer already closed; nothing to do about it here.
    let _ = writer.shutdown().await;
    copied
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{duplex, DuplexStream, ReadBuf};
    use tokio::time::timeout;

    use super::*;

    const DEADLINE: Duration = Duration::from_secs(5);

    /// A stream whose reads always fail with a reset.
    struct ResetStream;

    impl AsyncRead for ResetStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::new(ErrorKind::ConnectionReset, "reset")))
        }
    }

    impl AsyncWrite for ResetStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::new(ErrorKind::NotConnected, "already closed")))
        }
    }

    fn pair() -> (DuplexStream, DuplexStream) {
        duplex(1024)
    }

    async fn read_exact_within(stream: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        timeout(DEADLINE, stream.read_exact(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        buf
    }

    async fn expect_eof(stream: &mut DuplexStream) {
        let mut buf = [0u8; 16];
        let n = timeout(DEADLINE, stream.read(&mut buf))
            .await
            .expect("stream was left open")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn relays_both_directions() {
        let (mut client, client_side) = pair();
        let (mut upstream, upstream_side) = pair();
        let relay = tokio::spawn(pipe(upstream_side, client_side));

        client.write_all(b"hello upstream").await.unwrap();
        assert_eq!(read_exact_within(&mut upstream, 14).await, b"hello upstream");

        upstream.write_all(b"hello client").await.unwrap();
        assert_eq!(read_exact_within(&mut client, 12).await, b"hello client");

        drop(client);
        let stats = timeout(DEADLINE, relay).await.unwrap().unwrap();
        assert_eq!(stats, RelayStats { a_to_b: 12, b_to_a: 14 });
    }

    #[tokio::test]
    async fn preserves_order_across_many_writes() {
        let (mut client, client_side) = pair();
        let (mut upstream, upstream_side) = pair();
        let relay = tokio::spawn(pipe(client_side, upstream_side));

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            for chunk in payload.chunks(700) {
                client.write_all(chunk).await.unwrap();
            }
            client
        });

        let received = read_exact_within(&mut upstream, expected.len()).await;
        assert_eq!(received, expected);

        drop(writer.await.unwrap());
        let stats = timeout(DEADLINE, relay).await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, expected.len() as u64);
    }

    #[tokio::test]
    async fn closing_one_side_closes_both() {
        let (client, client_side) = pair();
        let (mut upstream, upstream_side) = pair();
        let relay = tokio::spawn(pipe(client_side, upstream_side));

        drop(client);
        expect_eof(&mut upstream).await;
        timeout(DEADLINE, relay).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn upstream_close_reaches_client() {
        let (mut client, client_side) = pair();
        let (mut upstream, upstream_side) = pair();
        let relay = tokio::spawn(pipe(upstream_side, client_side));

        upstream.write_all(b"bye").await.unwrap();
        drop(upstream);

        assert_eq!(read_exact_within(&mut client, 3).await, b"bye");
        expect_eof(&mut client).await;
        timeout(DEADLINE, relay).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn read_error_tears_down_tunnel() {
        let (mut client, client_side) = pair();
        let relay = tokio::spawn(pipe(ResetStream, client_side));

        expect_eof(&mut client).await;
        let stats = timeout(DEADLINE, relay).await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 0);
    }

    #[tokio::test]
    async fn failing_shutdown_is_not_surfaced() {
        let (client, client_side) = pair();
        let relay = tokio::spawn(pipe(client_side, ResetStream));
        drop(client);
        // ResetStream refuses shutdown; the relay still completes normally.
        timeout(DEADLINE, relay).await.unwrap().unwrap();
    }
}
