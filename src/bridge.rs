//! Full-duplex relay between two established connections.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::{select, task::spawn};
use tokio_util::sync::CancellationToken;

pub const BRIDGE_BUFFER_SIZE: usize = 4096;

/// Copies `source` into `sink` until either side fails, then closes the relay.
///
/// `closed` is shared with the opposite direction: whichever direction stops
/// first cancels it, and the other one drops its halves as soon as it sees it.
pub async fn bridge<R, W>(mut source: R, mut sink: W, closed: CancellationToken)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; BRIDGE_BUFFER_SIZE];

    loop {
        let n = select! {
            _ = closed.cancelled() => return,
            r = source.read(&mut buf) => match r {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };

        let written = select! {
            _ = closed.cancelled() => return,
            r = async {
                sink.write_all(&buf[..n]).await?;
                sink.flush().await
            } => r,
        };
        if written.is_err() {
            break;
        }
    }

    select! {
        _ = closed.cancelled() => {},
        _ = sink.shutdown() => {},
    }
    closed.cancel();
}

/// Spawns both directions of a relay between `a` and `b`, each given as
/// (reader, writer).
pub fn relay<AR, AW, BR, BW>(a: (AR, AW), b: (BR, BW))
where
    AR: AsyncRead + Send + Unpin + 'static,
    AW: AsyncWrite + Send + Unpin + 'static,
    BR: AsyncRead + Send + Unpin + 'static,
    BW: AsyncWrite + Send + Unpin + 'static,
{
    let closed = CancellationToken::new();
    let (ar, aw) = a;
    let (br, bw) = b;

    spawn(bridge(ar, bw, closed.clone()));
    spawn(bridge(br, aw, closed));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, split};
    use tokio::time::timeout;

    #[tokio::test]
    async fn relays_both_ways() {
        let (mut left, left_inner) = duplex(1024);
        let (mut right, right_inner) = duplex(1024);
        relay(split(left_inner), split(right_inner));

        left.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let big = vec![9u8; 3 * BRIDGE_BUFFER_SIZE + 5];
        let mut got = vec![0u8; big.len()];
        let (w, r) = tokio::join!(right.write_all(&big), left.read_exact(&mut got));
        w.unwrap();
        r.unwrap();
        assert_eq!(got, big);
    }

    #[tokio::test]
    async fn one_side_closing_tears_down_both() {
        let (left, left_inner) = duplex(1024);
        let (mut right, right_inner) = duplex(1024);
        relay(split(left_inner), split(right_inner));

        drop(left);

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(5), right.read(&mut buf))
            .await
            .expect("relay did not close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn cancelled_bridge_stops_reading() {
        let (_keep, source) = duplex(64);
        let (sink, _peer) = duplex(64);
        let closed = CancellationToken::new();
        let t = spawn(bridge(source, sink, closed.clone()));

        closed.cancel();
        timeout(Duration::from_secs(5), t)
            .await
            .expect("bridge ignored cancellation")
            .unwrap();
    }
}
